//! The normalized, immutable record produced for every wire event.

use serde::Serialize;

use crate::latency::LatencyMeta;
use crate::status::JobStatus;
use crate::step_id;
use crate::types::{SequenceId, Timestamp};

/// Which envelope shape a [`StepEvent`] was normalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Step,
    Status,
    Result,
    /// Record without a recognised envelope, read field-by-field.
    Flat,
}

/// One delivered event after envelope normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEvent {
    /// Colon-namespaced step id, e.g. `chat:tokens:7`.
    pub step_id: String,
    /// Batch text, status text, or empty.
    pub message: String,
    /// Marks completion of the named step (not of the whole run).
    pub finished: bool,
    /// Timestamp carried by the envelope, when present.
    pub server_timestamp: Option<Timestamp>,
    /// Local clock at the moment the event was parsed.
    pub received_at: Timestamp,
    /// Resume cursor value for this event, when present.
    pub sequence_id: Option<SequenceId>,
    /// Structured marker unpacked from a `__latency_meta__:` message.
    pub latency_meta: Option<LatencyMeta>,
    pub kind: EventKind,
}

impl StepEvent {
    /// The batch number if this is a canonical or legacy token batch step.
    pub fn batch_number(&self) -> Option<u64> {
        step_id::parse_batch_number(&self.step_id)
    }

    /// The job status carried by a status envelope.
    pub fn job_status(&self) -> Option<JobStatus> {
        (self.kind == EventKind::Status).then(|| JobStatus::parse(&self.message))
    }

    pub fn is_latency_marker(&self) -> bool {
        step_id::is_latency_marker(&self.step_id)
    }
}
