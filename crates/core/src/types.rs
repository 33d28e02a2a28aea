use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Opaque per-run delivery cursor assigned by the event endpoint.
///
/// Ids are compared numerically when both sides parse as unsigned
/// integers and lexically otherwise, so both `"42"` and zero-padded
/// `"00000000000000000042"` order correctly against each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceId(String);

impl SequenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric(&self) -> Option<u128> {
        self.0.parse().ok()
    }
}

impl Ord for SequenceId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SequenceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_compare_by_value() {
        assert!(SequenceId::from("9") < SequenceId::from("10"));
        assert!(SequenceId::from("00000000000000000010") > SequenceId::from("9"));
    }

    #[test]
    fn non_numeric_ids_fall_back_to_lexical() {
        assert!(SequenceId::from("evt-a") < SequenceId::from("evt-b"));
    }

    #[test]
    fn equal_values_with_different_padding_are_ordered_not_equal() {
        let a = SequenceId::from("7");
        let b = SequenceId::from("007");
        assert_ne!(a.cmp(&b), Ordering::Equal);
    }
}
