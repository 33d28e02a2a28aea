//! Long-poll event subscriber.
//!
//! [`Subscriber::run`] repeatedly polls an [`EventSource`] with the last
//! seen sequence id until the job reaches a terminal status or the
//! [`CancellationToken`] is triggered:
//!
//! ```text
//! Idle -> Connecting -> Streaming <-> Retrying -> Terminal
//!            |                                      ^
//!            +------ fatal first-attempt error -----+
//! ```
//!
//! An empty response is a normal outcome and simply polls again.
//! Transient failures back off exponentially (see [`crate::backoff`]);
//! non-transient failures and an exhausted retry budget end the
//! subscription with a [`StreamError`]. Terminal status is detected from
//! status events in the stream, or out-of-band through a `watch` channel
//! fed by the status poller. In the latter case non-waiting drain polls
//! run until the server has nothing newer, so trailing events are not lost.
//!
//! Parsed events leave through an `mpsc` channel as
//! [`SubscriberEvent::Event`], interleaved with
//! [`SubscriberEvent::Phase`] transitions.

use std::sync::Arc;
use std::time::Duration;

use jobstream_core::clock::{Clock, SystemClock};
use jobstream_core::status::JobStatus;
use jobstream_core::step_event::StepEvent;
use jobstream_core::types::SequenceId;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;
use crate::backoff::{Backoff, RetryConfig, RetryDecision};
use crate::envelope::{parse_record, sequence_id};
use crate::source::{EventSource, PollParams};

/// Upper bound on non-waiting polls made while draining.
const MAX_DRAIN_POLLS: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Streaming,
    /// Waiting `delay` before retry number `attempt`.
    Retrying { attempt: u32, delay: Duration },
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriberEvent {
    Phase(ConnectionPhase),
    Event(StepEvent),
}

/// Clean ways a subscription ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The job succeeded.
    Completed(JobStatus),
    /// The caller cancelled, or dropped the event receiver.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Event stream failed after {failures} consecutive errors: {last_error}")]
    RetryBudgetExhausted { failures: u32, last_error: ApiError },

    #[error("Event stream failed: {0}")]
    Fatal(ApiError),

    #[error("Job ended with status '{0}'")]
    JobFailed(JobStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub poll: PollParams,
    pub retry: RetryConfig,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Connection phase, cursor and retry counter for one subscription.
#[derive(Debug, Clone)]
pub struct SubscriberState {
    phase: ConnectionPhase,
    cursor: Option<SequenceId>,
    backoff: Backoff,
    delivered: u64,
    skipped: u64,
    dropped: u64,
}

impl SubscriberState {
    pub fn new(retry: RetryConfig, cursor: Option<SequenceId>) -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            cursor,
            backoff: Backoff::new(retry),
            delivered: 0,
            skipped: 0,
            dropped: 0,
        }
    }

    pub fn phase(&self) -> &ConnectionPhase {
        &self.phase
    }

    pub fn cursor(&self) -> Option<&SequenceId> {
        self.cursor.as_ref()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Records the parser could not use.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Decide whether `event` is new and advance the cursor past it.
    ///
    /// Events at or below the cursor are redeliveries and are rejected.
    /// Events without a sequence id cannot be placed and are accepted.
    pub fn accept(&mut self, event: &StepEvent) -> bool {
        let Some(seq) = &event.sequence_id else {
            self.delivered += 1;
            return true;
        };
        if self.cursor.as_ref().is_some_and(|cursor| seq <= cursor) {
            self.skipped += 1;
            return false;
        }
        self.cursor = Some(seq.clone());
        self.delivered += 1;
        true
    }

    /// Move the cursor past a record that was dropped unparsed, so the
    /// next poll does not fetch it again. Never moves the cursor back.
    pub fn pass_over(&mut self, seq: Option<SequenceId>) {
        self.dropped += 1;
        let Some(seq) = seq else {
            return;
        };
        if self.cursor.as_ref().map_or(true, |cursor| seq > *cursor) {
            self.cursor = Some(seq);
        }
    }

    /// Returns `true` if the phase changed.
    fn transition(&mut self, phase: ConnectionPhase) -> bool {
        if self.phase == phase {
            return false;
        }
        self.phase = phase;
        true
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// What woke the poll loop.
enum Wake {
    Cancelled,
    StatusChanged { open: bool },
    Fetched(Result<Vec<serde_json::Value>, ApiError>),
}

pub struct Subscriber<S: ?Sized> {
    source: Arc<S>,
    job_id: String,
    config: SubscriberConfig,
    events: mpsc::Sender<SubscriberEvent>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    status: Option<watch::Receiver<Option<JobStatus>>>,
    state: SubscriberState,
}

impl<S: EventSource + ?Sized> Subscriber<S> {
    pub fn new(
        source: Arc<S>,
        job_id: impl Into<String>,
        config: SubscriberConfig,
        events: mpsc::Sender<SubscriberEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            job_id: job_id.into(),
            config,
            events,
            cancel,
            clock: Arc::new(SystemClock),
            status: None,
            state: SubscriberState::new(config.retry, None),
        }
    }

    /// Stamp `received_at` with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Watch out-of-band job status published by the status poller.
    pub fn with_status(mut self, status: watch::Receiver<Option<JobStatus>>) -> Self {
        self.status = Some(status);
        self
    }

    /// Start from a previously seen cursor instead of the beginning.
    pub fn resume_from(mut self, cursor: SequenceId) -> Self {
        self.state = SubscriberState::new(self.config.retry, Some(cursor));
        self
    }

    pub fn state(&self) -> &SubscriberState {
        &self.state
    }

    /// Drive the subscription to its end.
    pub async fn run(mut self) -> Result<SubscriptionEnd, StreamError> {
        tracing::info!(
            job_id = %self.job_id,
            cursor = ?self.state.cursor,
            "Subscribing to job events",
        );
        self.transition(ConnectionPhase::Connecting).await;

        let mut status = self.status.take();
        let mut status_open = status.is_some();

        loop {
            if let Some(terminal) = terminal_status(status.as_ref()) {
                return self.drain_and_finish(terminal).await;
            }

            let cursor = self.state.cursor.clone();
            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                open = status_changed(status.as_mut().filter(|_| status_open)) => {
                    Wake::StatusChanged { open }
                }
                result = self.source.fetch_events(&self.job_id, cursor.as_ref(), self.config.poll) => {
                    Wake::Fetched(result)
                }
            };

            let records = match wake {
                Wake::Cancelled => return Ok(self.cancelled().await),
                Wake::StatusChanged { open } => {
                    status_open = open;
                    continue;
                }
                Wake::Fetched(Ok(records)) => records,
                Wake::Fetched(Err(e)) => {
                    self.handle_failure(e).await?;
                    continue;
                }
            };

            self.state.backoff.record_success();
            if self.state.phase != ConnectionPhase::Streaming {
                tracing::info!(job_id = %self.job_id, "Event stream connected");
                self.transition(ConnectionPhase::Streaming).await;
            }

            match self.deliver_all(records).await {
                Delivery::Continue => {}
                Delivery::Terminal(terminal) => return self.finish(terminal).await,
                Delivery::Closed => return Ok(self.cancelled().await),
            }
        }
    }

    // ---- private helpers ----

    /// Classify a failed poll. Returns `Err` when the subscription must
    /// end, `Ok` after the backoff wait when it should poll again.
    async fn handle_failure(&mut self, error: ApiError) -> Result<(), StreamError> {
        if !error.is_transient() {
            tracing::error!(job_id = %self.job_id, error = %error, "Event poll failed");
            self.transition(ConnectionPhase::Terminal).await;
            return Err(StreamError::Fatal(error));
        }

        match self.state.backoff.record_failure() {
            RetryDecision::GiveUp => {
                let failures = self.state.backoff.failures();
                tracing::error!(
                    job_id = %self.job_id,
                    failures,
                    error = %error,
                    "Event poll retry budget exhausted",
                );
                self.transition(ConnectionPhase::Terminal).await;
                Err(StreamError::RetryBudgetExhausted {
                    failures,
                    last_error: error,
                })
            }
            RetryDecision::Retry(delay) => {
                let attempt = self.state.backoff.failures();
                tracing::warn!(
                    job_id = %self.job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Event poll failed, retrying",
                );
                self.transition(ConnectionPhase::Retrying { attempt, delay })
                    .await;

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
                Ok(())
            }
        }
    }

    /// Pick up events still buffered server-side after a terminal status
    /// arrived out-of-band, then finish with that status.
    async fn drain_and_finish(
        &mut self,
        terminal: JobStatus,
    ) -> Result<SubscriptionEnd, StreamError> {
        tracing::info!(
            job_id = %self.job_id,
            status = %terminal,
            "Terminal status observed out-of-band, draining",
        );

        for _ in 0..MAX_DRAIN_POLLS {
            let cursor = self.state.cursor.clone();
            let drained = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = self.source.fetch_events(
                    &self.job_id,
                    cursor.as_ref(),
                    self.config.poll.non_waiting(),
                ) => Some(result),
            };

            let records = match drained {
                None => return Ok(self.cancelled().await),
                Some(Ok(records)) if records.is_empty() => break,
                Some(Ok(records)) => records,
                Some(Err(e)) => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Drain poll failed");
                    break;
                }
            };
            match self.deliver_all(records).await {
                Delivery::Continue => {}
                Delivery::Terminal(_) => break,
                Delivery::Closed => return Ok(self.cancelled().await),
            }
        }
        self.finish(terminal).await
    }

    async fn deliver_all(&mut self, records: Vec<serde_json::Value>) -> Delivery {
        let mut terminal = None;
        for raw in records {
            let Some(event) = parse_record(&raw, self.clock.now()) else {
                self.state.pass_over(sequence_id(&raw));
                continue;
            };
            if !self.state.accept(&event) {
                tracing::debug!(
                    job_id = %self.job_id,
                    seq_id = ?event.sequence_id,
                    "Skipping redelivered event",
                );
                continue;
            }
            if let Some(status) = event.job_status().filter(JobStatus::is_terminal) {
                terminal = Some(status);
            }
            tracing::trace!(job_id = %self.job_id, step_id = %event.step_id, "Event delivered");
            if self.events.send(SubscriberEvent::Event(event)).await.is_err() {
                return Delivery::Closed;
            }
        }
        match terminal {
            Some(status) => Delivery::Terminal(status),
            None => Delivery::Continue,
        }
    }

    async fn finish(&mut self, status: JobStatus) -> Result<SubscriptionEnd, StreamError> {
        tracing::info!(
            job_id = %self.job_id,
            status = %status,
            delivered = self.state.delivered,
            skipped = self.state.skipped,
            dropped = self.state.dropped,
            "Event stream finished",
        );
        self.transition(ConnectionPhase::Terminal).await;
        if status.is_success() {
            Ok(SubscriptionEnd::Completed(status))
        } else {
            Err(StreamError::JobFailed(status))
        }
    }

    async fn cancelled(&mut self) -> SubscriptionEnd {
        tracing::info!(job_id = %self.job_id, "Event subscription cancelled");
        self.transition(ConnectionPhase::Terminal).await;
        SubscriptionEnd::Cancelled
    }

    async fn transition(&mut self, phase: ConnectionPhase) {
        if self.state.transition(phase.clone()) {
            let _ = self.events.send(SubscriberEvent::Phase(phase)).await;
        }
    }
}

enum Delivery {
    Continue,
    Terminal(JobStatus),
    /// The event receiver is gone.
    Closed,
}

fn terminal_status(status: Option<&watch::Receiver<Option<JobStatus>>>) -> Option<JobStatus> {
    status
        .and_then(|rx| rx.borrow().clone())
        .filter(JobStatus::is_terminal)
}

/// Resolves when the watched status changes. Returns `false` once the
/// sender is gone; never resolves when there is nothing to watch.
pub(crate) async fn status_changed(
    status: Option<&mut watch::Receiver<Option<JobStatus>>>,
) -> bool {
    match status {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobstream_core::step_event::EventKind;

    fn event(seq: Option<&str>) -> StepEvent {
        StepEvent {
            step_id: "chat:tokens:1".into(),
            message: "x".into(),
            finished: false,
            server_timestamp: None,
            received_at: chrono::Utc::now(),
            sequence_id: seq.map(SequenceId::new),
            latency_meta: None,
            kind: EventKind::Step,
        }
    }

    #[test]
    fn state_rejects_events_at_or_below_cursor() {
        let mut state = SubscriberState::new(RetryConfig::default(), Some("5".into()));
        assert!(!state.accept(&event(Some("4"))));
        assert!(!state.accept(&event(Some("5"))));
        assert!(state.accept(&event(Some("6"))));
        assert_eq!(state.cursor(), Some(&SequenceId::new("6")));
        assert_eq!(state.skipped(), 2);
        assert_eq!(state.delivered(), 1);
    }

    #[test]
    fn state_accepts_unsequenced_events_without_moving_cursor() {
        let mut state = SubscriberState::new(RetryConfig::default(), None);
        assert!(state.accept(&event(None)));
        assert!(state.cursor().is_none());
    }

    #[test]
    fn state_passes_over_dropped_records_without_regressing() {
        let mut state = SubscriberState::new(RetryConfig::default(), Some("5".into()));
        state.pass_over(Some("3".into()));
        assert_eq!(state.cursor(), Some(&SequenceId::new("5")));
        state.pass_over(Some("7".into()));
        assert_eq!(state.cursor(), Some(&SequenceId::new("7")));
        state.pass_over(None);
        assert_eq!(state.cursor(), Some(&SequenceId::new("7")));
        assert_eq!(state.dropped(), 3);
        assert_eq!(state.delivered(), 0);
    }

    #[test]
    fn state_starts_idle_and_reports_changes_only() {
        let mut state = SubscriberState::new(RetryConfig::default(), None);
        assert_eq!(state.phase(), &ConnectionPhase::Idle);
        assert!(state.transition(ConnectionPhase::Connecting));
        assert!(!state.transition(ConnectionPhase::Connecting));
    }
}
