//! Step id naming for the chat event stream.
//!
//! Step ids are colon-separated namespaces. Token batches are published
//! as `chat:tokens:{n}`; older emitters used the singular
//! `chat:token:{n}`, which consumers must still accept.

/// Canonical prefix for numbered token batches.
pub const TOKENS_PREFIX: &str = "chat:tokens:";

/// Legacy (singular) prefix for numbered token batches.
pub const LEGACY_TOKEN_PREFIX: &str = "chat:token:";

/// Prefix shared by all backend latency marker steps.
pub const LATENCY_PREFIX: &str = "chat:latency:";

/// Sentinel that marks a step message as a structured latency payload.
pub const LATENCY_META_PREFIX: &str = "__latency_meta__:";

pub const STEP_CHAT_REQUEST: &str = "chat:request";
pub const STEP_CHAT_RESPONSE: &str = "chat:response";
pub const STEP_CHAT_COMPLETE: &str = "chat:complete";
pub const STEP_CHAT_ERROR: &str = "chat:error";

pub const MARKER_REQUEST_DISPATCH: &str = "chat:latency:request-dispatch";
pub const MARKER_UPSTREAM_ACCEPTED: &str = "chat:latency:upstream-accepted";
pub const MARKER_FIRST_UPSTREAM_DELTA: &str = "chat:latency:first-upstream-delta";
pub const MARKER_FIRST_BATCH: &str = "chat:latency:first-batch";

/// Synthetic step id given to job status envelopes.
pub const STEP_JOB_STATUS: &str = "job:status";

/// Synthetic step id given to result-available envelopes.
pub const STEP_JOB_RESULT: &str = "job:result";

/// Build the canonical step id for batch number `n`.
pub fn batch_step_id(n: u64) -> String {
    format!("{TOKENS_PREFIX}{n}")
}

/// Extract the batch number from a canonical or legacy batch step id.
///
/// Returns `None` for anything else, including a zero batch number
/// (batches are numbered from 1).
pub fn parse_batch_number(step_id: &str) -> Option<u64> {
    let suffix = step_id
        .strip_prefix(TOKENS_PREFIX)
        .or_else(|| step_id.strip_prefix(LEGACY_TOKEN_PREFIX))?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().filter(|n| *n >= 1)
}

pub fn is_batch_step(step_id: &str) -> bool {
    parse_batch_number(step_id).is_some()
}

pub fn is_latency_marker(step_id: &str) -> bool {
    step_id.starts_with(LATENCY_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_legacy_forms_parse() {
        assert_eq!(parse_batch_number("chat:tokens:7"), Some(7));
        assert_eq!(parse_batch_number("chat:token:12"), Some(12));
    }

    #[test]
    fn non_batch_ids_are_rejected() {
        assert_eq!(parse_batch_number("chat:response"), None);
        assert_eq!(parse_batch_number("chat:tokens:"), None);
        assert_eq!(parse_batch_number("chat:tokens:0"), None);
        assert_eq!(parse_batch_number("chat:tokens:-1"), None);
        assert_eq!(parse_batch_number("chat:tokens:3:extra"), None);
        assert_eq!(parse_batch_number("phase:search"), None);
    }

    #[test]
    fn batch_step_id_uses_plural_form() {
        assert_eq!(batch_step_id(1), "chat:tokens:1");
        assert!(is_batch_step(&batch_step_id(42)));
    }

    #[test]
    fn latency_markers_share_prefix() {
        assert!(is_latency_marker(MARKER_FIRST_BATCH));
        assert!(!is_latency_marker(STEP_CHAT_REQUEST));
    }
}
