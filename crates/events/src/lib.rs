//! Server side of the job event stream.
//!
//! This crate provides the producer half of the wire contract:
//!
//! - [`WireEvent`]: the JSON envelope delivered for every event.
//! - [`EventLog`]: in-memory, per-job append-only log with a long-poll
//!   read (`wait_since`) and job status tracking.
//! - [`ChatEmitter`]: turns an upstream text-delta stream into numbered
//!   token batches and latency markers, written through a [`StepReporter`].

pub mod emitter;
pub mod envelope;
pub mod log;

pub use emitter::{
    ChatEmitter, ChatMessage, ChatRequest, ChatStreamError, ChatStreamSummary, ReportError,
    StepReporter, StepUpdate, UpstreamSource,
};
pub use envelope::WireEvent;
pub use log::{EventLog, JobReporter, LogError};
