//! REST client for the jobs API.
//!
//! Wraps job creation, job reads and the resumable events long-poll
//! using [`reqwest`].

use std::time::Duration;

use async_trait::async_trait;
use jobstream_core::status::JobStatus;
use jobstream_core::types::SequenceId;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::source::{EventSource, JobCreator, PollParams, StatusSource};

/// Extra time allowed on top of the server-side wait before the client
/// gives up on an events request.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

/// Timeout for requests that are not long-polls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A job as returned by `GET /1/jobs/{id}` and `POST /1/jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    #[serde(default)]
    events: Vec<serde_json::Value>,
}

/// Errors from the jobs API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The API returned a non-2xx status code.
    #[error("Jobs API error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A success response whose body could not be decoded.
    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Transport timeouts and connection failures are transient, as are
    /// HTTP 408 and 504. Everything else is fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::Status { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || *status == StatusCode::GATEWAY_TIMEOUT.as_u16()
            }
            Self::Decode(_) => false,
        }
    }
}

/// HTTP client for one jobs API deployment.
pub struct JobsApi {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl JobsApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8080`.
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, token)
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling).
    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a job. Sends `POST /1/jobs` with the request JSON.
    pub async fn submit_job(&self, request: &serde_json::Value) -> Result<JobRecord, ApiError> {
        let response = self
            .authorize(self.client.post(format!("{}/1/jobs", self.api_url)))
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Read a job. Sends `GET /1/jobs/{id}`.
    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord, ApiError> {
        let response = self
            .authorize(self.client.get(format!("{}/1/jobs/{}", self.api_url, job_id)))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Long-poll for events. Sends
    /// `GET /1/jobs/{id}/events?since=&limit=&max-wait=`.
    ///
    /// `204 No Content` and an empty `events` array both yield an empty
    /// vector.
    pub async fn poll_events(
        &self,
        job_id: &str,
        cursor: Option<&SequenceId>,
        params: PollParams,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", params.limit.to_string()),
            ("max-wait", params.max_wait.as_secs().to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("since", cursor.to_string()));
        }

        let response = self
            .authorize(
                self.client
                    .get(format!("{}/1/jobs/{}/events", self.api_url, job_id)),
            )
            .query(&query)
            .timeout(params.max_wait + LONG_POLL_SLACK)
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        let page: EventsPage = Self::parse_response(response).await?;
        Ok(page.events)
    }

    // ---- private helpers ----

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::Status`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl EventSource for JobsApi {
    async fn fetch_events(
        &self,
        job_id: &str,
        cursor: Option<&SequenceId>,
        params: PollParams,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        self.poll_events(job_id, cursor, params).await
    }
}

#[async_trait]
impl StatusSource for JobsApi {
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, ApiError> {
        Ok(self.get_job(job_id).await?.status)
    }
}

#[async_trait]
impl JobCreator for JobsApi {
    async fn create_job(&self, request: &serde_json::Value) -> Result<JobRecord, ApiError> {
        self.submit_job(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_timeouts_are_transient() {
        let status = |status| ApiError::Status {
            status,
            body: String::new(),
        };
        assert!(status(504).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(500).is_transient());
        assert!(!status(404).is_transient());
        assert!(!ApiError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn job_record_parses_status_vocabulary() {
        let record: JobRecord =
            serde_json::from_str(r#"{"id":"job-1","status":"Executing"}"#).unwrap();
        assert_eq!(record.status, JobStatus::Executing);
    }

    #[test]
    fn events_page_tolerates_missing_array() {
        let page: EventsPage = serde_json::from_str("{}").unwrap();
        assert!(page.events.is_empty());
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        // Nothing listens on the loopback discard port.
        let api = JobsApi::new("http://127.0.0.1:9", None);
        let err = api.get_job("job-1").await.unwrap_err();
        assert!(err.is_transient(), "expected transient, got {err:?}");
    }
}
