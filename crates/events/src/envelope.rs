//! Wire envelope written for every delivered event.
//!
//! ```json
//! {"seqID":"00000000000000000042","type":"job.step",
//!  "schema":"urn:ivcap:schema:job.step.start.1",
//!  "timestamp":"2026-01-01T00:00:00.123Z",
//!  "data":{"name":"chat:tokens:1","options":{"message":"Hel"}}}
//! ```

use jobstream_core::status::JobStatus;
use jobstream_core::types::{SequenceId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const TYPE_STEP: &str = "job.step";
pub const TYPE_STATUS: &str = "job.status";
pub const TYPE_RESULT: &str = "job.result";

pub const SCHEMA_STEP_START: &str = "urn:ivcap:schema:job.step.start.1";
pub const SCHEMA_STEP_FINISH: &str = "urn:ivcap:schema:job.step.finish.1";
pub const SCHEMA_STATUS: &str = "urn:ivcap:schema:job.status.1";
pub const SCHEMA_RESULT: &str = "urn:ivcap:schema:job.result.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Assigned by the log on append.
    #[serde(rename = "seqID", default, skip_serializing_if = "Option::is_none")]
    pub seq_id: Option<SequenceId>,

    #[serde(rename = "type")]
    pub event_type: String,

    pub schema: String,

    pub timestamp: Timestamp,

    pub data: serde_json::Value,
}

impl WireEvent {
    /// A step envelope. `finished` selects the finish schema.
    pub fn step(name: &str, message: Option<&str>, finished: bool, at: Timestamp) -> Self {
        let mut data = json!({ "name": name });
        if let Some(message) = message {
            data["options"] = json!({ "message": message });
        }
        Self {
            seq_id: None,
            event_type: TYPE_STEP.to_string(),
            schema: if finished {
                SCHEMA_STEP_FINISH
            } else {
                SCHEMA_STEP_START
            }
            .to_string(),
            timestamp: at,
            data,
        }
    }

    pub fn status(status: &JobStatus, at: Timestamp) -> Self {
        Self {
            seq_id: None,
            event_type: TYPE_STATUS.to_string(),
            schema: SCHEMA_STATUS.to_string(),
            timestamp: at,
            data: json!({ "status": status.as_str() }),
        }
    }

    pub fn result(result_urn: Option<&str>, at: Timestamp) -> Self {
        let data = match result_urn {
            Some(urn) => json!({ "result_urn": urn }),
            None => json!({}),
        };
        Self {
            seq_id: None,
            event_type: TYPE_RESULT.to_string(),
            schema: SCHEMA_RESULT.to_string(),
            timestamp: at,
            data,
        }
    }

    pub fn is_finish(&self) -> bool {
        self.schema.contains(".finish")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> Timestamp {
        chrono::DateTime::from_timestamp_millis(1_767_225_600_123).unwrap()
    }

    #[test]
    fn step_event_serializes_to_wire_shape() {
        let mut event = WireEvent::step("chat:tokens:1", Some("Hel"), false, at());
        event.seq_id = Some(SequenceId::new("00000000000000000042"));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["seqID"], "00000000000000000042");
        assert_eq!(value["type"], "job.step");
        assert_eq!(value["schema"], SCHEMA_STEP_START);
        assert_eq!(value["data"]["name"], "chat:tokens:1");
        assert_eq!(value["data"]["options"]["message"], "Hel");
        assert!(!event.is_finish());
    }

    #[test]
    fn finish_step_uses_finish_schema_and_omits_missing_message() {
        let event = WireEvent::step("chat:tokens:1", None, true, at());
        assert!(event.is_finish());
        assert!(event.data.get("options").is_none());
    }

    #[test]
    fn unassigned_seq_id_is_not_serialized() {
        let value = serde_json::to_value(WireEvent::status(&JobStatus::Executing, at())).unwrap();
        assert!(value.get("seqID").is_none());
        assert_eq!(value["data"]["status"], "executing");
    }

    #[test]
    fn result_event_carries_optional_urn() {
        let with = WireEvent::result(Some("urn:result:1"), at());
        assert_eq!(with.data["result_urn"], "urn:result:1");
        assert_eq!(WireEvent::result(None, at()).data, json!({}));
    }
}
