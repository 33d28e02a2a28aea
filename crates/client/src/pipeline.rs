//! Run orchestration.
//!
//! [`RunPipeline`] starts one run per job: it spawns the subscriber, the
//! status poller and the playback driver, plus a coordinator task that
//! owns the [`RunState`], the [`TokenReconstructor`] and the
//! [`LatencyTracker`]. The caller sees the run only through the
//! [`UiUpdate`]s on its [`RunHandle`].
//!
//! ```text
//! Subscriber --SubscriberEvent--> Coordinator --Enqueue--> PlaybackDriver
//!      ^                           ^  |   ^                     |
//!  StatusPoller ----(watch)--------+  |   +-------Reveal--------+
//!                                     v
//!                                 UiUpdate
//! ```
//!
//! The coordinator both feeds and drains the playback driver, so the
//! command channel is unbounded. Every other stage channel is bounded by
//! [`PipelineConfig::channel_capacity`].
//!
//! When the subscription ends the coordinator forces a playback flush
//! before reporting the outcome, so no text is left mid-reveal.

use std::sync::Arc;
use std::time::Duration;

use jobstream_core::clock::{Clock, SystemClock};
use jobstream_core::latency::{Checkpoint, LatencyReport, LatencyTracker};
use jobstream_core::playback::{PlaybackConfig, Reveal};
use jobstream_core::status::JobStatus;
use jobstream_core::step_event::StepEvent;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiError;
use crate::backoff::RetryConfig;
use crate::config::{
    ClientConfig, DEFAULT_EVENTS_BATCH_LIMIT, DEFAULT_EVENTS_MAX_WAIT, DEFAULT_STATUS_POLL_INTERVAL,
};
use crate::playback::{PlaybackCommand, PlaybackDriver};
use crate::reconstructor::TokenReconstructor;
use crate::run::{RunOutcome, RunState};
use crate::source::{EventSource, JobCreator, PollParams, StatusSource};
use crate::status_poller::StatusPoller;
use crate::subscriber::{
    status_changed, ConnectionPhase, StreamError, Subscriber, SubscriberConfig, SubscriberEvent,
    SubscriptionEnd,
};

/// Capacity of the bounded channels between pipeline stages.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What the UI is told about a run.
#[derive(Debug, Clone, PartialEq)]
pub enum UiUpdate {
    /// Connection phase changed.
    Phase(ConnectionPhase),
    /// A step event arrived (for debug display).
    Step(StepEvent),
    /// Text to append to the visible response.
    Reveal(String),
    /// The job reached a successful terminal status.
    Finished {
        status: JobStatus,
        latency: LatencyReport,
    },
    /// The run failed. Sent at most once, after playback has flushed.
    Errored {
        message: String,
        latency: LatencyReport,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub poll: PollParams,
    pub retry: RetryConfig,
    pub status_poll_interval: Duration,
    pub playback: PlaybackConfig,
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll: PollParams {
                max_wait: DEFAULT_EVENTS_MAX_WAIT,
                limit: DEFAULT_EVENTS_BATCH_LIMIT,
            },
            retry: RetryConfig::default(),
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            playback: PlaybackConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl From<&ClientConfig> for PipelineConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            poll: config.poll,
            retry: config.retry,
            status_poll_interval: config.status_poll_interval,
            playback: config.playback,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle to one running job stream.
pub struct RunHandle {
    job_id: String,
    updates: mpsc::Receiver<UiUpdate>,
    cancel: CancellationToken,
    task: JoinHandle<RunState>,
}

impl RunHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Next update, or `None` once the run is over.
    pub async fn next_update(&mut self) -> Option<UiUpdate> {
        self.updates.recv().await
    }

    /// Stop the subscription and the status poller. Text already received
    /// is still flushed through playback.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the run to end and return its final state. Updates not
    /// yet read are discarded.
    pub async fn wait(self) -> Option<RunState> {
        drop(self.updates);
        match self.task.await {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Run coordinator panicked");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RunPipeline
// ---------------------------------------------------------------------------

pub struct RunPipeline<B> {
    backend: Arc<B>,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl<B> RunPipeline<B>
where
    B: EventSource + StatusSource + JobCreator + 'static,
{
    pub fn new(backend: Arc<B>, config: PipelineConfig) -> Self {
        Self {
            backend,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp checkpoints and events with `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a job from `request`, then stream it.
    pub async fn submit(&self, request: &serde_json::Value) -> Result<RunHandle, ApiError> {
        let mut tracker = LatencyTracker::new();
        tracker.record(Checkpoint::Submit, self.clock.now());

        let job = self.backend.create_job(request).await?;
        tracker.record(Checkpoint::JobCreated, self.clock.now());
        tracing::info!(job_id = %job.id, status = %job.status, "Job submitted");

        Ok(self.spawn(job.id, tracker))
    }

    /// Stream an existing job.
    pub fn attach(&self, job_id: impl Into<String>) -> RunHandle {
        self.spawn(job_id.into(), LatencyTracker::new())
    }

    fn spawn(&self, job_id: String, mut tracker: LatencyTracker) -> RunHandle {
        let capacity = self.config.channel_capacity.max(1);
        let cancel = CancellationToken::new();

        let (status_tx, status_rx) = watch::channel(None);
        let (subscriber_tx, subscriber_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (reveal_tx, reveal_rx) = mpsc::channel(capacity);
        let (ui_tx, ui_rx) = mpsc::channel(capacity);

        let poller_cancel = cancel.child_token();
        tokio::spawn(
            StatusPoller::new(
                Arc::clone(&self.backend),
                job_id.clone(),
                self.config.status_poll_interval,
                status_tx,
                poller_cancel.clone(),
            )
            .run(),
        );

        tracker.record(Checkpoint::EventsSubscribeStarted, self.clock.now());
        let subscription = tokio::spawn(
            Subscriber::new(
                Arc::clone(&self.backend),
                job_id.clone(),
                SubscriberConfig {
                    poll: self.config.poll,
                    retry: self.config.retry,
                },
                subscriber_tx,
                cancel.child_token(),
            )
            .with_clock(Arc::clone(&self.clock))
            .with_status(status_rx.clone())
            .run(),
        );

        let playback =
            tokio::spawn(PlaybackDriver::new(self.config.playback, command_rx, reveal_tx).run());

        let coordinator = Coordinator {
            state: RunState::new(job_id.clone()),
            reconstructor: TokenReconstructor::new(),
            tracker,
            clock: Arc::clone(&self.clock),
            playback: command_tx,
            reveals: reveal_rx,
            ui: ui_tx,
            status: Some(status_rx),
            poller_cancel,
        };
        let task = tokio::spawn(coordinator.run(subscriber_rx, subscription, playback));

        RunHandle {
            job_id,
            updates: ui_rx,
            cancel,
            task,
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator {
    state: RunState,
    reconstructor: TokenReconstructor,
    tracker: LatencyTracker,
    clock: Arc<dyn Clock>,
    playback: mpsc::UnboundedSender<PlaybackCommand>,
    reveals: mpsc::Receiver<Reveal>,
    ui: mpsc::Sender<UiUpdate>,
    /// Out-of-band status from the poller. `None` once the poller stops.
    status: Option<watch::Receiver<Option<JobStatus>>>,
    poller_cancel: CancellationToken,
}

impl Coordinator {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<SubscriberEvent>,
        subscription: JoinHandle<Result<SubscriptionEnd, StreamError>>,
        playback: JoinHandle<usize>,
    ) -> RunState {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SubscriberEvent::Phase(phase)) => self.on_phase(phase).await,
                    Some(SubscriberEvent::Event(event)) => self.on_event(event).await,
                    None => break,
                },
                Some(reveal) = self.reveals.recv() => self.on_reveal(reveal).await,
                open = status_changed(self.status.as_mut()) => self.on_status(open),
            }
        }
        self.poller_cancel.cancel();

        let outcome = match subscription.await {
            Ok(Ok(SubscriptionEnd::Completed(status))) => RunOutcome::Finished(status),
            Ok(Ok(SubscriptionEnd::Cancelled)) => RunOutcome::Cancelled,
            Ok(Err(e)) => {
                if let StreamError::JobFailed(_) = &e {
                    self.tracker
                        .record(Checkpoint::JobStatusFinished, self.clock.now());
                }
                RunOutcome::Errored(e.to_string())
            }
            Err(e) => RunOutcome::Errored(format!("Subscriber task failed: {e}")),
        };

        self.flush_playback().await;

        match &outcome {
            RunOutcome::Finished(status) => {
                self.tracker
                    .record(Checkpoint::JobStatusFinished, self.clock.now());
                let latency = self.tracker.report();
                tracing::info!(
                    job_id = %self.state.job_id(),
                    status = %status,
                    chars = self.state.text().chars().count(),
                    "Run finished",
                );
                self.send(UiUpdate::Finished {
                    status: status.clone(),
                    latency,
                })
                .await;
            }
            RunOutcome::Errored(message) => {
                tracing::error!(job_id = %self.state.job_id(), error = %message, "Run failed");
                let latency = self.tracker.report();
                self.send(UiUpdate::Errored {
                    message: message.clone(),
                    latency,
                })
                .await;
            }
            RunOutcome::Cancelled => {
                tracing::info!(job_id = %self.state.job_id(), "Run cancelled");
            }
        }
        self.state.finish(outcome);

        drop(self.playback);
        if let Err(e) = playback.await {
            tracing::warn!(error = %e, "Playback task failed");
        }
        self.state
    }

    async fn on_phase(&mut self, phase: ConnectionPhase) {
        if phase == ConnectionPhase::Streaming {
            self.tracker
                .record(Checkpoint::EventsConnected, self.clock.now());
        }
        self.state.set_phase(phase.clone());
        self.send(UiUpdate::Phase(phase)).await;
    }

    async fn on_event(&mut self, event: StepEvent) {
        let now = self.clock.now();
        self.tracker.record(Checkpoint::FirstEvent, now);
        if let Some(marker) = self.tracker.observe_marker(&event) {
            tracing::debug!(?marker, "Backend latency marker");
        }
        if event.job_status() == Some(JobStatus::Executing) {
            self.tracker.record(Checkpoint::Executing, now);
        }

        if let Some(delta) = self.reconstructor.accept(&event) {
            if self.tracker.record(Checkpoint::FirstToken, now) {
                if let Some(ts) = event.server_timestamp {
                    self.tracker.record_first_token_envelope(ts);
                }
            }
            self.state.append_text(&delta.text);
            if self.playback.send(PlaybackCommand::Enqueue(delta.text)).is_err() {
                tracing::warn!(batch = delta.batch, "Playback stopped, dropping text");
            }
        }

        self.send(UiUpdate::Step(event.clone())).await;
        self.state.record_event(event);
    }

    fn on_status(&mut self, open: bool) {
        if !open {
            self.status = None;
            return;
        }
        let Some(rx) = self.status.as_mut() else {
            return;
        };
        let status = rx.borrow_and_update().clone();
        if status == Some(JobStatus::Executing) {
            self.tracker.record(Checkpoint::Executing, self.clock.now());
        }
    }

    async fn on_reveal(&mut self, reveal: Reveal) {
        self.state.append_revealed(&reveal.text);
        self.send(UiUpdate::Reveal(reveal.text)).await;
    }

    /// Reveal everything still queued and forward it before returning.
    async fn flush_playback(&mut self) {
        let (ack_tx, mut ack_rx) = oneshot::channel();
        if self.playback.send(PlaybackCommand::Flush(ack_tx)).is_ok() {
            loop {
                tokio::select! {
                    biased;
                    Some(reveal) = self.reveals.recv() => self.on_reveal(reveal).await,
                    _ = &mut ack_rx => break,
                }
            }
        }
        while let Ok(reveal) = self.reveals.try_recv() {
            self.on_reveal(reveal).await;
        }
    }

    async fn send(&self, update: UiUpdate) {
        // A dropped receiver only means nobody is watching.
        let _ = self.ui.send(update).await;
    }
}
