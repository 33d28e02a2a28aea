//! Pure building blocks shared by the job event stream crates.
//!
//! Nothing in this crate touches the network or spawns tasks. Timestamps
//! are always passed in, which keeps the batching, playback and latency
//! policies unit-testable without a runtime.

pub mod batching;
pub mod clock;
pub mod error;
pub mod latency;
pub mod playback;
pub mod status;
pub mod step_event;
pub mod step_id;
pub mod types;
