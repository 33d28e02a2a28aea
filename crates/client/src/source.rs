//! Transport seams for the subscriber, status poller and pipeline.
//!
//! [`JobsApi`](crate::api::JobsApi) implements all three traits against
//! the HTTP API; tests substitute scripted in-memory sources.

use std::time::Duration;

use async_trait::async_trait;
use jobstream_core::status::JobStatus;
use jobstream_core::types::SequenceId;

use crate::api::{ApiError, JobRecord};

/// Bounds sent with every events request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollParams {
    /// How long the server may hold the request open.
    pub max_wait: Duration,
    /// Maximum number of events per response.
    pub limit: usize,
}

impl PollParams {
    /// Same limit, but the server must answer immediately.
    pub fn non_waiting(self) -> Self {
        Self {
            max_wait: Duration::ZERO,
            ..self
        }
    }
}

/// Resumable long-poll event feed.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch raw records strictly after `cursor`.
    ///
    /// An empty vector means "no new events" and is not an error.
    async fn fetch_events(
        &self,
        job_id: &str,
        cursor: Option<&SequenceId>,
        params: PollParams,
    ) -> Result<Vec<serde_json::Value>, ApiError>;
}

/// Job status lookup.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError>;
}

/// Job creation.
#[async_trait]
pub trait JobCreator: Send + Sync {
    async fn create_job(&self, request: &serde_json::Value) -> Result<JobRecord, ApiError>;
}
