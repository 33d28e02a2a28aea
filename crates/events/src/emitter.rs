//! Batched chat step emitter.
//!
//! [`ChatEmitter`] drives one streamed chat run: it opens an
//! [`UpstreamSource`], accumulates the text deltas it yields in a
//! [`BatchBuffer`] and publishes every flush as a `chat:tokens:{n}` step
//! through a [`StepReporter`]. Latency markers are written at the points
//! the client uses to attribute time-to-first-token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use jobstream_core::batching::{Batch, BatchBuffer, BatchPolicy};
use jobstream_core::clock::{Clock, SystemClock};
use jobstream_core::latency::LatencyMeta;
use jobstream_core::step_id::{
    self, MARKER_FIRST_BATCH, MARKER_FIRST_UPSTREAM_DELTA, MARKER_REQUEST_DISPATCH,
    MARKER_UPSTREAM_ACCEPTED, STEP_CHAT_COMPLETE, STEP_CHAT_ERROR, STEP_CHAT_REQUEST,
    STEP_CHAT_RESPONSE,
};
use serde::{Deserialize, Serialize};

/// Longest error text written to a `chat:error` step before truncation.
const MAX_ERROR_MESSAGE_CHARS: usize = 1000;
const TRUNCATED_SUFFIX: &str = "...<truncated>";

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// One step lifecycle write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepUpdate {
    pub step_id: String,
    pub message: Option<String>,
    pub finished: bool,
}

impl StepUpdate {
    pub fn started(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            message: Some(message.into()),
            finished: false,
        }
    }

    pub fn finished(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            message: None,
            finished: true,
        }
    }

    pub fn finished_with(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            message: Some(message.into()),
            finished: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Event sink error: {0}")]
    Sink(String),
}

/// Destination for step events.
#[async_trait]
pub trait StepReporter: Send + Sync {
    async fn report(&self, update: StepUpdate) -> Result<(), ReportError>;
}

/// Failure while talking to the upstream model provider.
#[derive(Debug, thiserror::Error)]
pub enum ChatStreamError {
    #[error("Upstream returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Unexpected chat streaming error: {0}")]
    Unexpected(String),
}

impl ChatStreamError {
    /// Stable machine-readable code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UpstreamHttp { .. } => "CHAT_UPSTREAM_HTTP_ERROR",
            Self::UpstreamTimeout => "CHAT_UPSTREAM_TIMEOUT",
            Self::Unexpected(_) => "CHAT_UNEXPECTED_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// Opaque provider of generated text deltas.
#[async_trait]
pub trait UpstreamSource: Send {
    /// Open the generation stream. Errors here mean the upstream never
    /// accepted the request.
    async fn open(
        &mut self,
        request: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<String, ChatStreamError>>, ChatStreamError>;
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatStreamSummary {
    pub model: String,
    pub response_text: String,
    pub chunks_emitted: u64,
    pub approx_tokens_emitted: u64,
    pub total_events: u64,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

pub struct ChatEmitter<R> {
    reporter: R,
    policy: BatchPolicy,
    clock: Arc<dyn Clock>,
}

/// Per-run counters.
#[derive(Default)]
struct RunTally {
    events: u64,
    chunks: u64,
    approx_tokens: u64,
    response: String,
}

impl<R: StepReporter> ChatEmitter<R> {
    pub fn new(reporter: R, policy: BatchPolicy) -> Self {
        Self {
            reporter,
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for the `server_emit_ts_ms` carried by latency markers.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Stream one chat request through the batching policy.
    pub async fn run<U>(
        &self,
        upstream: &mut U,
        request: &ChatRequest,
    ) -> Result<ChatStreamSummary, ChatStreamError>
    where
        U: UpstreamSource + ?Sized,
    {
        let started = tokio::time::Instant::now();
        let mut tally = RunTally::default();

        self.marker(&mut tally, MARKER_REQUEST_DISPATCH, "Request dispatched", None)
            .await;
        self.emit(
            &mut tally,
            StepUpdate::started(
                STEP_CHAT_REQUEST,
                format!("Submitting chat request to model '{}'", request.model),
            ),
        )
        .await;

        let mut deltas = match upstream.open(request).await {
            Ok(stream) => stream,
            Err(e) => {
                self.fail(&mut tally, &e).await;
                return Err(e);
            }
        };

        self.emit(&mut tally, StepUpdate::finished(STEP_CHAT_REQUEST)).await;
        self.marker(&mut tally, MARKER_UPSTREAM_ACCEPTED, "Upstream accepted", None)
            .await;
        self.emit(
            &mut tally,
            StepUpdate::started(STEP_CHAT_RESPONSE, "Streaming response"),
        )
        .await;

        let mut buffer = BatchBuffer::new(self.policy, started.into_std());
        let mut saw_delta = false;

        while let Some(delta) = deltas.next().await {
            let delta = match delta {
                Ok(delta) => delta,
                Err(e) => {
                    self.fail(&mut tally, &e).await;
                    return Err(e);
                }
            };
            if delta.is_empty() {
                continue;
            }
            if !saw_delta {
                saw_delta = true;
                self.marker(
                    &mut tally,
                    MARKER_FIRST_UPSTREAM_DELTA,
                    "First upstream delta",
                    None,
                )
                .await;
            }
            tally.chunks += 1;
            tally.approx_tokens += delta.split_whitespace().count().max(1) as u64;

            let now = tokio::time::Instant::now().into_std();
            if let Some(batch) = buffer.push(&delta, now) {
                self.publish(&mut tally, batch).await;
            }
        }

        if let Some(batch) = buffer.finish(tokio::time::Instant::now().into_std()) {
            self.publish(&mut tally, batch).await;
        }

        let chunks = tally.chunks;
        self.emit(
            &mut tally,
            StepUpdate::finished_with(
                STEP_CHAT_RESPONSE,
                format!("Completed streaming {chunks} chunks"),
            ),
        )
        .await;
        self.emit(
            &mut tally,
            StepUpdate::started(STEP_CHAT_COMPLETE, "Chat completed"),
        )
        .await;
        self.emit(&mut tally, StepUpdate::finished(STEP_CHAT_COMPLETE)).await;

        let summary = ChatStreamSummary {
            model: request.model.clone(),
            response_text: tally.response.trim().to_string(),
            chunks_emitted: tally.chunks,
            approx_tokens_emitted: tally.approx_tokens,
            total_events: tally.events,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            model = %summary.model,
            chunks = summary.chunks_emitted,
            events = summary.total_events,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Chat stream completed",
        );
        Ok(summary)
    }

    async fn publish(&self, tally: &mut RunTally, batch: Batch) {
        if batch.number == 1 {
            self.marker(tally, MARKER_FIRST_BATCH, "First token batch", Some(1))
                .await;
        }
        let step = step_id::batch_step_id(batch.number);
        tracing::debug!(
            batch = batch.number,
            fragments = batch.fragment_count,
            trigger = ?batch.trigger,
            "Flushing token batch",
        );

        tally.response.push_str(&batch.text);

        self.emit(tally, StepUpdate::started(step.clone(), batch.text))
            .await;
        self.emit(tally, StepUpdate::finished(step)).await;
    }

    async fn marker(
        &self,
        tally: &mut RunTally,
        step: &str,
        label: &str,
        batch_num: Option<u64>,
    ) {
        let mut meta = LatencyMeta::new(label, self.clock.now().timestamp_millis());
        if let Some(n) = batch_num {
            meta = meta.with_field("batch_num", n.into());
        }
        let payload = meta.encode();
        self.emit(tally, StepUpdate::started(step, payload.clone()))
            .await;
        self.emit(tally, StepUpdate::finished_with(step, payload)).await;
    }

    async fn fail(&self, tally: &mut RunTally, error: &ChatStreamError) {
        tracing::error!(code = error.code(), error = %error, "Chat stream failed");
        let message = truncate_message(&format!("{}: {error}", error.code()));
        self.emit(tally, StepUpdate::started(STEP_CHAT_ERROR, message.clone()))
            .await;
        self.emit(tally, StepUpdate::finished_with(STEP_CHAT_ERROR, message))
            .await;
    }

    /// Write one step. Sink failures are logged and the run continues.
    async fn emit(&self, tally: &mut RunTally, update: StepUpdate) {
        tally.events += 1;
        let step_id = update.step_id.clone();
        if let Err(e) = self.reporter.report(update).await {
            tracing::warn!(step_id = %step_id, error = %e, "Failed to report step");
        }
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    let head: String = message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    format!("{head}{TRUNCATED_SUFFIX}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
