//! Wire record parser.
//!
//! Every delivered record is classified into a closed [`Envelope`] variant
//! and normalized into a [`StepEvent`]. Typed envelopes are distinguished
//! by their `type` field; anything else goes through a flat fallback that
//! reads step-id and message fields directly. Parsing never fails past
//! this module: an unusable record yields `None`.

use chrono::DateTime;
use jobstream_core::latency::LatencyMeta;
use jobstream_core::status::JobStatus;
use jobstream_core::step_event::{EventKind, StepEvent};
use jobstream_core::step_id::{STEP_JOB_RESULT, STEP_JOB_STATUS};
use jobstream_core::types::{SequenceId, Timestamp};
use serde::Deserialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Typed wire shapes
// ---------------------------------------------------------------------------

/// Envelopes recognised by their `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedEnvelope {
    #[serde(rename = "job.step")]
    Step {
        #[serde(default)]
        schema: String,
        data: StepData,
    },

    #[serde(rename = "job.status")]
    Status { data: StatusData },

    #[serde(rename = "job.result")]
    Result {
        #[serde(default)]
        data: Option<ResultData>,
    },
}

#[derive(Debug, Deserialize)]
struct StepData {
    name: String,
    #[serde(default)]
    options: Option<StepOptions>,
}

#[derive(Debug, Deserialize)]
struct StepOptions {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusData {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    result_urn: Option<String>,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One classified wire record.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A named step started or finished.
    Step {
        name: String,
        message: Option<String>,
        finished: bool,
    },
    /// The job's current status.
    Status { status: JobStatus },
    /// A result became available.
    Result { result_urn: Option<String> },
    /// A record without a recognised `type`, read field-by-field.
    Flat {
        step_id: String,
        message: String,
        finished: bool,
    },
}

/// A classified record plus the fields common to every shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub envelope: Envelope,
    pub sequence_id: Option<SequenceId>,
    pub timestamp: Option<Timestamp>,
}

impl Record {
    /// Classify `raw`. Typed shapes are tried first; a record whose `type`
    /// is missing, unknown, or whose payload does not fit falls back to the
    /// flat reader.
    pub fn classify(raw: &Value) -> Option<Self> {
        if !raw.is_object() {
            return None;
        }
        let envelope = match TypedEnvelope::deserialize(raw) {
            Ok(typed) => Envelope::from(typed),
            Err(_) => flat(raw)?,
        };
        Some(Self {
            envelope,
            sequence_id: sequence_id(raw),
            timestamp: raw
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&chrono::Utc)),
        })
    }

    /// Normalize into a [`StepEvent`] received at `received_at`.
    pub fn into_step_event(self, received_at: Timestamp) -> StepEvent {
        let (step_id, message, finished, kind) = match self.envelope {
            Envelope::Step {
                name,
                message,
                finished,
            } => (name, message.unwrap_or_default(), finished, EventKind::Step),
            Envelope::Status { status } => (
                STEP_JOB_STATUS.to_string(),
                status.as_str().to_string(),
                true,
                EventKind::Status,
            ),
            Envelope::Result { result_urn } => (
                STEP_JOB_RESULT.to_string(),
                result_urn.unwrap_or_default(),
                true,
                EventKind::Result,
            ),
            Envelope::Flat {
                step_id,
                message,
                finished,
            } => (step_id, message, finished, EventKind::Flat),
        };

        let latency_meta = match kind {
            EventKind::Step | EventKind::Flat => LatencyMeta::decode(&message),
            EventKind::Status | EventKind::Result => None,
        };
        let message = match &latency_meta {
            Some(meta) => meta.label.clone(),
            None => message,
        };

        StepEvent {
            step_id,
            message,
            finished,
            server_timestamp: self.timestamp,
            received_at,
            sequence_id: self.sequence_id,
            latency_meta,
            kind,
        }
    }
}

impl From<TypedEnvelope> for Envelope {
    fn from(typed: TypedEnvelope) -> Self {
        match typed {
            TypedEnvelope::Step { schema, data } => Envelope::Step {
                name: data.name,
                message: data.options.and_then(|o| o.message),
                finished: schema.contains(".finish"),
            },
            TypedEnvelope::Status { data } => Envelope::Status {
                status: JobStatus::parse(&data.status),
            },
            TypedEnvelope::Result { data } => Envelope::Result {
                result_urn: data.and_then(|d| d.result_urn),
            },
        }
    }
}

/// Parse one raw record. Unusable records are logged at debug level and
/// dropped.
pub fn parse_record(raw: &Value, received_at: Timestamp) -> Option<StepEvent> {
    match Record::classify(raw) {
        Some(record) => Some(record.into_step_event(received_at)),
        None => {
            tracing::debug!(record = %raw, "Dropping unrecognised event record");
            None
        }
    }
}

/// Parse a record from its JSON text.
pub fn parse_text(text: &str, received_at: Timestamp) -> Option<StepEvent> {
    match serde_json::from_str::<Value>(text) {
        Ok(raw) => parse_record(&raw, received_at),
        Err(e) => {
            tracing::debug!(error = %e, "Dropping non-JSON event record");
            None
        }
    }
}

/// The record's `seqID`, read without classifying the record. A numeric
/// id is rendered to a string.
pub fn sequence_id(raw: &Value) -> Option<SequenceId> {
    let value = ["seqID", "seqId", "seq_id"]
        .iter()
        .find_map(|key| raw.get(*key))?;
    match value {
        Value::String(s) if !s.is_empty() => Some(SequenceId::new(s.clone())),
        Value::Number(n) => Some(SequenceId::new(n.to_string())),
        _ => None,
    }
}

// ---- private helpers ----

fn flat(raw: &Value) -> Option<Envelope> {
    let step_id = ["stepId", "step_id", "name"]
        .iter()
        .find_map(|key| raw.get(*key).and_then(Value::as_str))
        .filter(|id| !id.is_empty())?;
    Some(Envelope::Flat {
        step_id: step_id.to_string(),
        message: raw
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        finished: raw.get("finished").and_then(Value::as_bool).unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
