//! Subscriber behaviour against a scripted event source on virtual time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use jobstream_client::backoff::RetryConfig;
use jobstream_client::subscriber::{SubscriberConfig, SubscriberEvent};
use jobstream_client::{
    ApiError, ConnectionPhase, EventSource, PollParams, StreamError, Subscriber, SubscriptionEnd,
};
use jobstream_core::status::JobStatus;
use jobstream_core::step_event::StepEvent;
use jobstream_core::types::SequenceId;
use jobstream_events::WireEvent;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Scripted source
// ---------------------------------------------------------------------------

enum Reply {
    Events(Vec<serde_json::Value>),
    Fail(ApiError),
    /// Hold the poll open for the full `max-wait`, then answer empty.
    Hang,
}

#[derive(Default)]
struct ScriptedSource {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<(Option<SequenceId>, PollParams)>>,
}

impl ScriptedSource {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn cursors(&self) -> Vec<Option<SequenceId>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(cursor, _)| cursor.clone())
            .collect()
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    async fn fetch_events(
        &self,
        _job_id: &str,
        cursor: Option<&SequenceId>,
        params: PollParams,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        self.calls.lock().unwrap().push((cursor.cloned(), params));
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Events(events)) => Ok(events),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Hang) | None => {
                tokio::time::sleep(params.max_wait).await;
                Ok(Vec::new())
            }
        }
    }
}

/// Serves a fixed log and honours the cursor, like the real endpoint.
struct LogSource {
    records: Vec<serde_json::Value>,
    cursors: Mutex<Vec<Option<SequenceId>>>,
}

#[async_trait]
impl EventSource for LogSource {
    async fn fetch_events(
        &self,
        _job_id: &str,
        cursor: Option<&SequenceId>,
        params: PollParams,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        self.cursors.lock().unwrap().push(cursor.cloned());
        let newer: Vec<serde_json::Value> = self
            .records
            .iter()
            .filter(|raw| {
                let seq = raw["seqID"].as_str().map(SequenceId::new);
                match (cursor, seq) {
                    (Some(cursor), Some(seq)) => seq > *cursor,
                    _ => true,
                }
            })
            .take(params.limit)
            .cloned()
            .collect();
        if newer.is_empty() {
            tokio::time::sleep(params.max_wait).await;
        }
        Ok(newer)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn gateway_timeout() -> Reply {
    Reply::Fail(ApiError::Status {
        status: 504,
        body: "upstream timed out".into(),
    })
}

fn sequenced(seq: u64, mut event: WireEvent) -> serde_json::Value {
    event.seq_id = Some(SequenceId::new(format!("{seq:020}")));
    serde_json::to_value(event).unwrap()
}

fn tokens(seq: u64, batch: u64, text: &str) -> serde_json::Value {
    sequenced(
        seq,
        WireEvent::step(
            &format!("chat:tokens:{batch}"),
            Some(text),
            false,
            chrono::Utc::now(),
        ),
    )
}

fn status(seq: u64, status: JobStatus) -> serde_json::Value {
    sequenced(seq, WireEvent::status(&status, chrono::Utc::now()))
}

fn config() -> SubscriberConfig {
    SubscriberConfig {
        poll: PollParams {
            max_wait: Duration::from_secs(20),
            limit: 50,
        },
        retry: RetryConfig::default(),
    }
}

fn split(rx: &mut mpsc::Receiver<SubscriberEvent>) -> (Vec<ConnectionPhase>, Vec<StepEvent>) {
    let mut phases = Vec::new();
    let mut events = Vec::new();
    while let Ok(item) = rx.try_recv() {
        match item {
            SubscriberEvent::Phase(phase) => phases.push(phase),
            SubscriberEvent::Event(event) => events.push(event),
        }
    }
    (phases, events)
}

fn seq(n: u64) -> Option<SequenceId> {
    Some(SequenceId::new(format!("{n:020}")))
}

// ---------------------------------------------------------------------------
// Test: transient failures back off 1s, 2s, 4s and then recover
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn recovers_after_transient_failures_without_duplicates() {
    let source = ScriptedSource::new(vec![
        gateway_timeout(),
        gateway_timeout(),
        gateway_timeout(),
        Reply::Events(vec![tokens(1, 1, "Hel"), tokens(2, 2, "lo")]),
        // The server redelivers #2 alongside the terminal status.
        Reply::Events(vec![tokens(2, 2, "lo"), status(3, JobStatus::Succeeded)]),
    ]);
    let (tx, mut rx) = mpsc::channel(64);

    let started = Instant::now();
    let end = Subscriber::new(
        Arc::clone(&source),
        "job-1",
        config(),
        tx,
        CancellationToken::new(),
    )
    .run()
    .await;

    assert_matches!(end, Ok(SubscriptionEnd::Completed(JobStatus::Succeeded)));
    assert_eq!(started.elapsed(), Duration::from_secs(7));

    let (phases, events) = split(&mut rx);
    let retry_delays: Vec<Duration> = phases
        .iter()
        .filter_map(|phase| match phase {
            ConnectionPhase::Retrying { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        retry_delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );
    assert_eq!(phases.last(), Some(&ConnectionPhase::Terminal));

    let text: String = events
        .iter()
        .filter(|e| e.batch_number().is_some())
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(text, "Hello");
    assert_eq!(events.len(), 3);

    // The cursor only moves forward, and only after a successful poll.
    assert_eq!(source.cursors(), vec![None, None, None, None, seq(2)]);
}

// ---------------------------------------------------------------------------
// Test: the fifth consecutive failure ends the subscription
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn gives_up_when_retry_budget_is_exhausted() {
    let source = ScriptedSource::new((0..5).map(|_| gateway_timeout()).collect());
    let (tx, mut rx) = mpsc::channel(64);

    let started = Instant::now();
    let end = Subscriber::new(source, "job-1", config(), tx, CancellationToken::new())
        .run()
        .await;

    assert_matches!(
        end,
        Err(StreamError::RetryBudgetExhausted { failures: 5, .. })
    );
    // 1 + 2 + 4 + 8 seconds of backoff before the final attempt.
    assert_eq!(started.elapsed(), Duration::from_secs(15));

    let (phases, _) = split(&mut rx);
    assert_eq!(phases.last(), Some(&ConnectionPhase::Terminal));
}

// ---------------------------------------------------------------------------
// Test: non-transient errors are not retried
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn fatal_error_ends_immediately() {
    let source = ScriptedSource::new(vec![Reply::Fail(ApiError::Status {
        status: 404,
        body: "no such job".into(),
    })]);
    let (tx, _rx) = mpsc::channel(64);

    let started = Instant::now();
    let end = Subscriber::new(Arc::clone(&source), "job-1", config(), tx, CancellationToken::new())
        .run()
        .await;

    assert_matches!(end, Err(StreamError::Fatal(ApiError::Status { status: 404, .. })));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(source.cursors().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: cancellation interrupts a backoff wait
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_ends_cleanly() {
    let source = ScriptedSource::new((0..5).map(|_| gateway_timeout()).collect());
    let (tx, _rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(
        Subscriber::new(Arc::clone(&source), "job-1", config(), tx, cancel.clone()).run(),
    );
    // Inside the second backoff wait (1s + part of 2s).
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();

    let end = handle.await.unwrap();
    assert_matches!(end, Ok(SubscriptionEnd::Cancelled));
    assert_eq!(source.cursors().len(), 2);
}

// ---------------------------------------------------------------------------
// Test: out-of-band terminal status drains trailing events
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn out_of_band_terminal_status_drains_remaining_events() {
    let source = ScriptedSource::new(vec![
        Reply::Events(vec![tokens(1, 1, "Hel")]),
        Reply::Hang,
        Reply::Events(vec![tokens(2, 2, "lo")]),
    ]);
    let (tx, mut rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(None);

    let handle = tokio::spawn(
        Subscriber::new(
            Arc::clone(&source),
            "job-1",
            config(),
            tx,
            CancellationToken::new(),
        )
        .with_status(status_rx)
        .run(),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    status_tx.send(Some(JobStatus::Succeeded)).unwrap();

    let end = handle.await.unwrap();
    assert_matches!(end, Ok(SubscriptionEnd::Completed(JobStatus::Succeeded)));

    let (_, events) = split(&mut rx);
    let text: String = events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(text, "Hello");

    let calls = source.calls.lock().unwrap();
    // Long-poll, long-poll (interrupted), then drain until empty.
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[1].1.max_wait, Duration::from_secs(20));
    assert_eq!(calls[2].1.max_wait, Duration::ZERO);
    assert_eq!(calls[2].0, seq(1));
    assert_eq!(calls[3].0, seq(2));
}

// ---------------------------------------------------------------------------
// Test: an unrecognised newest record does not pin the cursor
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cursor_moves_past_unrecognised_records() {
    let source = Arc::new(LogSource {
        records: vec![
            tokens(1, 1, "Hel"),
            serde_json::json!({ "seqID": format!("{:020}", 2), "type": "job.unknown" }),
        ],
        cursors: Mutex::new(Vec::new()),
    });
    let (tx, mut rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(
        Subscriber::new(Arc::clone(&source), "job-1", config(), tx, cancel.clone()).run(),
    );
    // One immediate poll, then long-polls at t=0 and t=20s.
    tokio::time::sleep(Duration::from_secs(30)).await;
    cancel.cancel();

    assert_matches!(handle.await.unwrap(), Ok(SubscriptionEnd::Cancelled));
    assert_eq!(
        *source.cursors.lock().unwrap(),
        vec![None, seq(2), seq(2)]
    );

    let (_, events) = split(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message, "Hel");
}

// ---------------------------------------------------------------------------
// Test: a failed terminal status surfaces as an error
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_job_status_is_an_error() {
    let source = ScriptedSource::new(vec![Reply::Events(vec![
        tokens(1, 1, "partial"),
        status(2, JobStatus::Failed),
    ])]);
    let (tx, _rx) = mpsc::channel(64);

    let end = Subscriber::new(source, "job-1", config(), tx, CancellationToken::new())
        .run()
        .await;

    assert_matches!(end, Err(StreamError::JobFailed(JobStatus::Failed)));
}

// ---------------------------------------------------------------------------
// Test: resuming starts from the supplied cursor
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn resume_skips_events_at_or_before_cursor() {
    let source = ScriptedSource::new(vec![Reply::Events(vec![
        tokens(4, 4, "old"),
        tokens(5, 5, "new"),
        status(6, JobStatus::Succeeded),
    ])]);
    let (tx, mut rx) = mpsc::channel(64);

    let end = Subscriber::new(
        Arc::clone(&source),
        "job-1",
        config(),
        tx,
        CancellationToken::new(),
    )
    .resume_from(SequenceId::new(format!("{:020}", 4)))
    .run()
    .await;

    assert_matches!(end, Ok(SubscriptionEnd::Completed(JobStatus::Succeeded)));
    assert_eq!(source.cursors(), vec![seq(4)]);

    let (_, events) = split(&mut rx);
    let messages: Vec<&str> = events
        .iter()
        .filter(|e| e.batch_number().is_some())
        .map(|e| e.message.as_str())
        .collect();
    assert_eq!(messages, vec!["new"]);
}
