//! Client side of the job event stream.
//!
//! Stages, in data-flow order:
//!
//! - [`api::JobsApi`]: reqwest wrapper for the jobs and events endpoints.
//! - [`subscriber::Subscriber`]: long-poll loop with resume cursor,
//!   exponential backoff and terminal-status detection.
//! - [`envelope`]: normalizes wire records into [`StepEvent`]s.
//! - [`reconstructor::TokenReconstructor`]: extracts batched text.
//! - [`playback::PlaybackDriver`]: adaptive typewriter on a tokio timer.
//! - [`pipeline::RunPipeline`]: wires the stages together with channels
//!   and reports [`pipeline::UiUpdate`]s.
//!
//! [`StepEvent`]: jobstream_core::step_event::StepEvent

pub mod api;
pub mod backoff;
pub mod config;
pub mod envelope;
pub mod pipeline;
pub mod playback;
pub mod reconstructor;
pub mod run;
pub mod source;
pub mod status_poller;
pub mod subscriber;

pub use api::{ApiError, JobRecord, JobsApi};
pub use config::{ClientConfig, ConfigError};
pub use pipeline::{PipelineConfig, RunHandle, RunPipeline, UiUpdate};
pub use source::{EventSource, JobCreator, PollParams, StatusSource};
pub use subscriber::{ConnectionPhase, StreamError, Subscriber, SubscriptionEnd};
