//! Latency checkpoints, segments and bottleneck heuristic.
//!
//! A run is stamped at a fixed set of client-side [`Checkpoint`]s on one
//! local clock. The backend additionally publishes [`BackendMarker`]
//! events whose message carries a [`LatencyMeta`] payload with the
//! server's own emit time. [`LatencyTracker::report`] derives:
//!
//! - **segments**: deltas between adjacent client checkpoints;
//! - **pipeline metrics**: deltas computed purely from backend timestamps
//!   (proxy time-to-first-token, buffering delay, delivery delay);
//! - a **bottleneck** guess: the largest pipeline metric.
//!
//! The bottleneck is advisory. Client and server clocks are not
//! synchronised, markers can be missing, and the largest delta is not
//! necessarily the one worth optimising. Consumers must present it as a
//! hint, never as a diagnosis.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::step_event::StepEvent;
use crate::step_id::{
    LATENCY_META_PREFIX, MARKER_FIRST_BATCH, MARKER_FIRST_UPSTREAM_DELTA,
    MARKER_REQUEST_DISPATCH, MARKER_UPSTREAM_ACCEPTED,
};
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Checkpoints and markers
// ---------------------------------------------------------------------------

/// Client-side milestones, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Checkpoint {
    Submit,
    JobCreated,
    EventsSubscribeStarted,
    EventsConnected,
    Executing,
    FirstEvent,
    FirstToken,
    JobStatusFinished,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 8] = [
        Self::Submit,
        Self::JobCreated,
        Self::EventsSubscribeStarted,
        Self::EventsConnected,
        Self::Executing,
        Self::FirstEvent,
        Self::FirstToken,
        Self::JobStatusFinished,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::JobCreated => "job-created",
            Self::EventsSubscribeStarted => "events-subscribe-started",
            Self::EventsConnected => "events-connected",
            Self::Executing => "executing",
            Self::FirstEvent => "first-event",
            Self::FirstToken => "first-token",
            Self::JobStatusFinished => "job-status-finished",
        }
    }
}

/// Server-side milestones published as `chat:latency:*` steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMarker {
    RequestDispatch,
    UpstreamAccepted,
    FirstUpstreamDelta,
    FirstBatchEmit,
}

impl BackendMarker {
    pub fn step_id(self) -> &'static str {
        match self {
            Self::RequestDispatch => MARKER_REQUEST_DISPATCH,
            Self::UpstreamAccepted => MARKER_UPSTREAM_ACCEPTED,
            Self::FirstUpstreamDelta => MARKER_FIRST_UPSTREAM_DELTA,
            Self::FirstBatchEmit => MARKER_FIRST_BATCH,
        }
    }

    pub fn from_step_id(step_id: &str) -> Option<Self> {
        match step_id {
            MARKER_REQUEST_DISPATCH => Some(Self::RequestDispatch),
            MARKER_UPSTREAM_ACCEPTED => Some(Self::UpstreamAccepted),
            MARKER_FIRST_UPSTREAM_DELTA => Some(Self::FirstUpstreamDelta),
            MARKER_FIRST_BATCH => Some(Self::FirstBatchEmit),
            _ => None,
        }
    }
}

/// Structured payload carried in a latency marker's message.
///
/// On the wire: `__latency_meta__:{"label":"...","server_emit_ts_ms":123,...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyMeta {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_emit_ts_ms: Option<i64>,
    /// Any additional marker fields (e.g. `batch_num`).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl LatencyMeta {
    pub fn new(label: impl Into<String>, server_emit_ts_ms: i64) -> Self {
        Self {
            label: label.into(),
            server_emit_ts_ms: Some(server_emit_ts_ms),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Decode a step message. Returns `None` when the sentinel prefix is
    /// absent or the remainder is not a valid payload, in which case the
    /// message is plain text.
    pub fn decode(message: &str) -> Option<Self> {
        let payload = message.strip_prefix(LATENCY_META_PREFIX)?;
        serde_json::from_str(payload).ok()
    }

    /// Encode as a step message with the sentinel prefix.
    pub fn encode(&self) -> String {
        // A struct of strings, integers and a JSON map always serializes.
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{LATENCY_META_PREFIX}{json}")
    }
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Named delta between two client checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub name: &'static str,
    pub from: Checkpoint,
    pub to: Checkpoint,
    /// `None` when either endpoint was never recorded.
    pub millis: Option<i64>,
}

/// Segments reported for every run, in display order.
const SEGMENTS: &[(&str, Checkpoint, Checkpoint)] = &[
    ("submit_to_job_created", Checkpoint::Submit, Checkpoint::JobCreated),
    (
        "job_created_to_subscribe_started",
        Checkpoint::JobCreated,
        Checkpoint::EventsSubscribeStarted,
    ),
    (
        "subscribe_started_to_events_connected",
        Checkpoint::EventsSubscribeStarted,
        Checkpoint::EventsConnected,
    ),
    (
        "job_created_to_events_connected",
        Checkpoint::JobCreated,
        Checkpoint::EventsConnected,
    ),
    ("job_created_to_executing", Checkpoint::JobCreated, Checkpoint::Executing),
    (
        "events_connected_to_first_event",
        Checkpoint::EventsConnected,
        Checkpoint::FirstEvent,
    ),
    ("first_event_to_first_token", Checkpoint::FirstEvent, Checkpoint::FirstToken),
    (
        "first_token_to_job_finished",
        Checkpoint::FirstToken,
        Checkpoint::JobStatusFinished,
    ),
    ("submit_to_first_token", Checkpoint::Submit, Checkpoint::FirstToken),
    ("submit_to_job_finished", Checkpoint::Submit, Checkpoint::JobStatusFinished),
];

/// The three backend-derived delays the bottleneck is chosen from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    /// Model/proxy time to first token: first-upstream-delta - request-dispatch.
    ProxyDelay,
    /// Buffering delay: first-batch-emit - first-upstream-delta.
    BufferDelay,
    /// Delivery/stamping delay: first token envelope timestamp - first-batch-emit.
    #[serde(rename = "pipeline-delay")]
    DeliveryDelay,
}

impl PipelineStage {
    pub fn label(self) -> &'static str {
        match self {
            Self::ProxyDelay => "proxy-delay",
            Self::BufferDelay => "buffer-delay",
            Self::DeliveryDelay => "pipeline-delay",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineMetrics {
    pub proxy_ttft_ms: Option<i64>,
    pub buffer_delay_ms: Option<i64>,
    pub delivery_delay_ms: Option<i64>,
}

impl PipelineMetrics {
    fn candidates(&self) -> [(PipelineStage, Option<i64>); 3] {
        [
            (PipelineStage::ProxyDelay, self.proxy_ttft_ms),
            (PipelineStage::BufferDelay, self.buffer_delay_ms),
            (PipelineStage::DeliveryDelay, self.delivery_delay_ms),
        ]
    }

    /// The largest available metric. Ties go to the earlier pipeline stage.
    pub fn bottleneck(&self) -> Option<Bottleneck> {
        self.candidates()
            .into_iter()
            .filter_map(|(stage, ms)| ms.map(|millis| Bottleneck { stage, millis }))
            .fold(None, |best: Option<Bottleneck>, candidate| match best {
                Some(b) if b.millis >= candidate.millis => Some(b),
                _ => Some(candidate),
            })
    }
}

/// Advisory "likely bottleneck". See the module docs for its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Bottleneck {
    pub stage: PipelineStage,
    pub millis: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointStamp {
    pub checkpoint: Checkpoint,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyReport {
    pub checkpoints: Vec<CheckpointStamp>,
    pub segments: Vec<Segment>,
    pub pipeline: PipelineMetrics,
    /// Advisory only.
    pub bottleneck: Option<Bottleneck>,
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "latency segments:")?;
        for segment in &self.segments {
            match segment.millis {
                Some(ms) => writeln!(f, "  {:<40} {ms:>8} ms", segment.name)?,
                None => writeln!(f, "  {:<40} {:>8}", segment.name, "n/a")?,
            }
        }
        writeln!(f, "pipeline:")?;
        for (stage, value) in self.pipeline.candidates() {
            match value {
                Some(ms) => writeln!(f, "  {:<40} {ms:>8} ms", stage.label())?,
                None => writeln!(f, "  {:<40} {:>8}", stage.label(), "n/a")?,
            }
        }
        match self.bottleneck {
            Some(b) => write!(
                f,
                "likely bottleneck (advisory): {} at {} ms",
                b.stage.label(),
                b.millis
            ),
            None => write!(f, "likely bottleneck (advisory): unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Collects checkpoints and backend markers for one run.
///
/// Every recording is first-write-wins, so replays and duplicate events
/// never move a checkpoint.
#[derive(Debug, Default, Clone)]
pub struct LatencyTracker {
    checkpoints: BTreeMap<Checkpoint, Timestamp>,
    markers: BTreeMap<BackendMarker, i64>,
    first_token_envelope_ms: Option<i64>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `checkpoint` at `at`. Returns `false` if already recorded.
    pub fn record(&mut self, checkpoint: Checkpoint, at: Timestamp) -> bool {
        if self.checkpoints.contains_key(&checkpoint) {
            return false;
        }
        self.checkpoints.insert(checkpoint, at);
        true
    }

    pub fn get(&self, checkpoint: Checkpoint) -> Option<Timestamp> {
        self.checkpoints.get(&checkpoint).copied()
    }

    /// Record a backend marker's server timestamp (epoch millis).
    pub fn record_marker(&mut self, marker: BackendMarker, server_ms: i64) -> bool {
        if self.markers.contains_key(&marker) {
            return false;
        }
        self.markers.insert(marker, server_ms);
        true
    }

    pub fn marker(&self, marker: BackendMarker) -> Option<i64> {
        self.markers.get(&marker).copied()
    }

    /// Record the envelope timestamp of the first token batch event.
    pub fn record_first_token_envelope(&mut self, at: Timestamp) -> bool {
        if self.first_token_envelope_ms.is_some() {
            return false;
        }
        self.first_token_envelope_ms = Some(at.timestamp_millis());
        true
    }

    /// Pick up a backend marker from a normalized event, if it is one.
    ///
    /// The marker payload's `server_emit_ts_ms` is preferred; the envelope
    /// timestamp is the fallback when the payload carries none.
    pub fn observe_marker(&mut self, event: &StepEvent) -> Option<BackendMarker> {
        let marker = BackendMarker::from_step_id(&event.step_id)?;
        let server_ms = event
            .latency_meta
            .as_ref()
            .and_then(|meta| meta.server_emit_ts_ms)
            .or_else(|| event.server_timestamp.map(|ts| ts.timestamp_millis()))?;
        self.record_marker(marker, server_ms).then_some(marker)
    }

    fn delta(&self, from: Checkpoint, to: Checkpoint) -> Option<i64> {
        let start = self.checkpoints.get(&from)?;
        let end = self.checkpoints.get(&to)?;
        Some((*end - *start).num_milliseconds())
    }

    fn marker_delta(&self, from: BackendMarker, to: BackendMarker) -> Option<i64> {
        Some(self.marker(to)? - self.marker(from)?)
    }

    pub fn pipeline_metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            proxy_ttft_ms: self
                .marker_delta(BackendMarker::RequestDispatch, BackendMarker::FirstUpstreamDelta),
            buffer_delay_ms: self
                .marker_delta(BackendMarker::FirstUpstreamDelta, BackendMarker::FirstBatchEmit),
            delivery_delay_ms: self
                .first_token_envelope_ms
                .zip(self.marker(BackendMarker::FirstBatchEmit))
                .map(|(envelope, batch)| envelope - batch),
        }
    }

    pub fn report(&self) -> LatencyReport {
        let checkpoints = self
            .checkpoints
            .iter()
            .map(|(checkpoint, at)| CheckpointStamp {
                checkpoint: *checkpoint,
                at: *at,
            })
            .collect();
        let segments = SEGMENTS
            .iter()
            .map(|(name, from, to)| Segment {
                name,
                from: *from,
                to: *to,
                millis: self.delta(*from, *to),
            })
            .collect();
        let pipeline = self.pipeline_metrics();
        LatencyReport {
            checkpoints,
            segments,
            bottleneck: pipeline.bottleneck(),
            pipeline,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
