//! In-memory per-job event log with long-poll reads.
//!
//! [`EventLog`] is the store behind the events endpoint. It is designed to
//! be shared via `Arc<EventLog>`: producers append through
//! [`append`](EventLog::append) or a [`JobReporter`], and the endpoint
//! handler answers each poll with [`wait_since`](EventLog::wait_since),
//! which parks until something newer than the cursor is appended or the
//! wait bound elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobstream_core::clock::{Clock, SystemClock};
use jobstream_core::status::JobStatus;
use jobstream_core::types::SequenceId;
use tokio::sync::{watch, RwLock};

use crate::emitter::{ReportError, StepReporter, StepUpdate};
use crate::envelope::WireEvent;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Unknown job: {0}")]
    UnknownJob(String),
}

/// Width of the zero-padded sequence ids handed out by the log.
const SEQ_WIDTH: usize = 20;

struct JobLog {
    events: Vec<WireEvent>,
    status: JobStatus,
    next_seq: u64,
    /// Carries the last assigned sequence number to parked readers.
    appended: watch::Sender<u64>,
}

impl JobLog {
    fn new() -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            events: Vec::new(),
            status: JobStatus::Pending,
            next_seq: 1,
            appended,
        }
    }

    fn push(&mut self, mut event: WireEvent) -> SequenceId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let seq_id = SequenceId::new(format!("{seq:0width$}", width = SEQ_WIDTH));
        event.seq_id = Some(seq_id.clone());
        self.events.push(event);
        self.appended.send_replace(seq);
        seq_id
    }

    fn since(&self, cursor: Option<&SequenceId>, limit: usize) -> Vec<WireEvent> {
        self.events
            .iter()
            .filter(|e| match (cursor, e.seq_id.as_ref()) {
                (Some(cursor), Some(seq)) => seq > cursor,
                _ => true,
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

pub struct EventLog {
    jobs: RwLock<HashMap<String, JobLog>>,
    clock: Arc<dyn Clock>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` for every envelope timestamp the log creates.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a new job in `pending` state and return its id.
    pub async fn create_job(&self) -> String {
        let job_id = uuid::Uuid::now_v7().to_string();
        self.insert_job(&job_id).await;
        job_id
    }

    /// Register `job_id` if it is not already known.
    pub async fn insert_job(&self, job_id: &str) {
        self.jobs
            .write()
            .await
            .entry(job_id.to_string())
            .or_insert_with(JobLog::new);
    }

    pub async fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().await.contains_key(job_id)
    }

    /// Append an event and return the sequence id assigned to it.
    pub async fn append(&self, job_id: &str, event: WireEvent) -> Result<SequenceId, LogError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| LogError::UnknownJob(job_id.to_string()))?;
        let seq_id = job.push(event);
        tracing::trace!(job_id, seq_id = %seq_id, "Event appended");
        Ok(seq_id)
    }

    /// Record a status change and append the matching `job.status` event.
    pub async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<SequenceId, LogError> {
        let event = WireEvent::status(&status, self.clock.now());
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| LogError::UnknownJob(job_id.to_string()))?;
        tracing::debug!(job_id, status = %status, "Job status changed");
        job.status = status;
        Ok(job.push(event))
    }

    pub async fn status(&self, job_id: &str) -> Result<JobStatus, LogError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|job| job.status.clone())
            .ok_or_else(|| LogError::UnknownJob(job_id.to_string()))
    }

    /// Up to `limit` events strictly after `cursor`, without waiting.
    pub async fn read_since(
        &self,
        job_id: &str,
        cursor: Option<&SequenceId>,
        limit: usize,
    ) -> Result<Vec<WireEvent>, LogError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|job| job.since(cursor, limit))
            .ok_or_else(|| LogError::UnknownJob(job_id.to_string()))
    }

    /// Long-poll read: like [`read_since`](Self::read_since) but parks for
    /// up to `max_wait` when nothing newer than `cursor` exists yet.
    ///
    /// An empty result means the wait elapsed with no new events.
    pub async fn wait_since(
        &self,
        job_id: &str,
        cursor: Option<&SequenceId>,
        limit: usize,
        max_wait: Duration,
    ) -> Result<Vec<WireEvent>, LogError> {
        let mut appended = {
            let jobs = self.jobs.read().await;
            jobs.get(job_id)
                .map(|job| job.appended.subscribe())
                .ok_or_else(|| LogError::UnknownJob(job_id.to_string()))?
        };
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let events = self.read_since(job_id, cursor, limit).await?;
            if !events.is_empty() {
                return Ok(events);
            }
            match tokio::time::timeout_at(deadline, appended.changed()).await {
                Ok(Ok(())) => continue,
                // Deadline reached, or the job was dropped under us.
                Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
            }
        }
    }

    /// A [`StepReporter`] that appends step events for `job_id`.
    pub fn reporter(self: &Arc<Self>, job_id: impl Into<String>) -> JobReporter {
        JobReporter {
            log: Arc::clone(self),
            job_id: job_id.into(),
        }
    }
}

/// Step sink bound to one job in an [`EventLog`].
#[derive(Clone)]
pub struct JobReporter {
    log: Arc<EventLog>,
    job_id: String,
}

impl JobReporter {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[async_trait]
impl StepReporter for JobReporter {
    async fn report(&self, update: StepUpdate) -> Result<(), ReportError> {
        let event = WireEvent::step(
            &update.step_id,
            update.message.as_deref(),
            update.finished,
            self.log.clock.now(),
        );
        self.log
            .append(&self.job_id, event)
            .await
            .map(|_| ())
            .map_err(|e| ReportError::Sink(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn sequence_ids_are_zero_padded_and_increasing() {
        let log = EventLog::new();
        let job = log.create_job().await;

        let a = log
            .append(&job, WireEvent::step("a", None, false, chrono::Utc::now()))
            .await
            .unwrap();
        let b = log.set_status(&job, JobStatus::Executing).await.unwrap();

        assert_eq!(a.as_str(), "00000000000000000001");
        assert_eq!(b.as_str(), "00000000000000000002");
        assert!(b > a);
        assert_eq!(log.status(&job).await.unwrap(), JobStatus::Executing);
    }

    #[tokio::test]
    async fn created_job_ids_are_time_ordered_uuids() {
        let log = EventLog::new();
        let first = log.create_job().await;
        let second = log.create_job().await;

        let id = uuid::Uuid::parse_str(&first).unwrap();
        assert_eq!(id.get_version_num(), 7);
        assert_ne!(first, second);
        assert!(log.contains(&second).await);
    }

    #[tokio::test]
    async fn read_since_returns_only_newer_events_up_to_limit() {
        let log = EventLog::new();
        log.insert_job("job-1").await;
        for i in 0..5 {
            log.append(
                "job-1",
                WireEvent::step(&format!("s{i}"), None, false, chrono::Utc::now()),
            )
            .await
            .unwrap();
        }

        let cursor = SequenceId::new("2");
        let events = log.read_since("job-1", Some(&cursor), 2).await.unwrap();
        let names: Vec<_> = events.iter().map(|e| e.data["name"].clone()).collect();
        assert_eq!(names, vec!["s2", "s3"]);

        let all = log.read_since("job-1", None, 50).await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let log = EventLog::new();
        assert_matches!(
            log.read_since("nope", None, 10).await,
            Err(LogError::UnknownJob(id)) if id == "nope"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_since_times_out_empty() {
        let log = EventLog::new();
        log.insert_job("job-1").await;

        let events = log
            .wait_since("job-1", None, 10, Duration::from_secs(20))
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_since_wakes_on_append() {
        let log = Arc::new(EventLog::new());
        log.insert_job("job-1").await;

        let writer = Arc::clone(&log);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            writer.set_status("job-1", JobStatus::Succeeded).await.unwrap();
        });

        let started = tokio::time::Instant::now();
        let events = log
            .wait_since("job-1", None, 10, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["status"], "succeeded");
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn reporter_appends_step_envelopes() {
        let log = Arc::new(EventLog::new());
        let job = log.create_job().await;
        let reporter = log.reporter(job.clone());

        reporter
            .report(StepUpdate::started("chat:tokens:1", "Hel"))
            .await
            .unwrap();
        reporter.report(StepUpdate::finished("chat:tokens:1")).await.unwrap();

        let events = log.read_since(&job, None, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["options"]["message"], "Hel");
        assert!(!events[0].is_finish());
        assert!(events[1].is_finish());
    }
}
