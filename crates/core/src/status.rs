//! Job status vocabulary.
//!
//! The jobs API reports status as a free-form string. Only a small fixed
//! set is terminal; everything unrecognised is treated as still running.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_SCHEDULED: &str = "scheduled";
pub const STATUS_EXECUTING: &str = "executing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_CANCELLED: &str = "cancelled";

/// Status strings that end a job.
pub const TERMINAL_STATUSES: &[&str] = &[
    STATUS_SUCCEEDED,
    STATUS_FAILED,
    STATUS_ERROR,
    STATUS_CANCELLED,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Executing,
    Succeeded,
    Failed,
    Error,
    Cancelled,
    /// Any status string outside the known vocabulary.
    Other(String),
}

impl JobStatus {
    /// Parse a status string (case-insensitive, surrounding whitespace ignored).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            STATUS_PENDING => Self::Pending,
            STATUS_SCHEDULED => Self::Scheduled,
            STATUS_EXECUTING => Self::Executing,
            STATUS_SUCCEEDED => Self::Succeeded,
            STATUS_FAILED => Self::Failed,
            STATUS_ERROR => Self::Error,
            STATUS_CANCELLED => Self::Cancelled,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => STATUS_PENDING,
            Self::Scheduled => STATUS_SCHEDULED,
            Self::Executing => STATUS_EXECUTING,
            Self::Succeeded => STATUS_SUCCEEDED,
            Self::Failed => STATUS_FAILED,
            Self::Error => STATUS_ERROR,
            Self::Cancelled => STATUS_CANCELLED,
            Self::Other(s) => s,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Error | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl From<String> for JobStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
