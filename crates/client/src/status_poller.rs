//! Out-of-band job status checks.
//!
//! The long-poll stream normally carries status events, but a lost or
//! never-emitted terminal status would leave the subscriber waiting
//! forever. [`StatusPoller`] reads the job status on a fixed period and
//! publishes it on a `watch` channel the subscriber listens to.

use std::sync::Arc;
use std::time::Duration;

use jobstream_core::status::JobStatus;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::source::StatusSource;

pub struct StatusPoller<S: ?Sized> {
    source: Arc<S>,
    job_id: String,
    interval: Duration,
    status: watch::Sender<Option<JobStatus>>,
    cancel: CancellationToken,
}

impl<S: StatusSource + ?Sized> StatusPoller<S> {
    pub fn new(
        source: Arc<S>,
        job_id: impl Into<String>,
        interval: Duration,
        status: watch::Sender<Option<JobStatus>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            job_id: job_id.into(),
            interval,
            status,
            cancel,
        }
    }

    /// Poll until a terminal status is seen, a non-transient error occurs,
    /// or the token is cancelled. Returns the terminal status, if any.
    pub async fn run(self) -> Option<JobStatus> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.source.job_status(&self.job_id) => result,
            };

            match result {
                Ok(status) => {
                    let terminal = status.is_terminal();
                    self.publish(status.clone());
                    if terminal {
                        tracing::debug!(job_id = %self.job_id, status = %status, "Status poller saw terminal status");
                        return Some(status);
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(job_id = %self.job_id, error = %e, "Status check failed, will retry");
                }
                Err(e) => {
                    tracing::error!(job_id = %self.job_id, error = %e, "Status check failed, stopping poller");
                    return None;
                }
            }
        }
    }

    fn publish(&self, status: JobStatus) {
        self.status.send_if_modified(|current| {
            if current.as_ref() == Some(&status) {
                return false;
            }
            *current = Some(status);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedStatus {
        replies: Mutex<VecDeque<Result<JobStatus, ApiError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedStatus {
        fn new(replies: Vec<Result<JobStatus, ApiError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedStatus {
        async fn job_status(&self, _job_id: &str) -> Result<JobStatus, ApiError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(JobStatus::Executing))
        }
    }

    fn gateway_timeout() -> ApiError {
        ApiError::Status {
            status: 504,
            body: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_until_terminal_and_tolerates_transient_errors() {
        let source = ScriptedStatus::new(vec![
            Ok(JobStatus::Pending),
            Err(gateway_timeout()),
            Ok(JobStatus::Executing),
            Ok(JobStatus::Succeeded),
        ]);
        let (tx, rx) = watch::channel(None);
        let poller = StatusPoller::new(
            Arc::clone(&source),
            "job-1",
            Duration::from_secs(2),
            tx,
            CancellationToken::new(),
        );

        let started = tokio::time::Instant::now();
        let terminal = poller.run().await;

        assert_eq!(terminal, Some(JobStatus::Succeeded));
        assert_eq!(*rx.borrow(), Some(JobStatus::Succeeded));
        assert_eq!(*source.calls.lock().unwrap(), 4);
        // First check is immediate, then one per interval.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancellation() {
        let source = ScriptedStatus::new(vec![]);
        let (tx, _rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let poller = StatusPoller::new(source, "job-1", Duration::from_secs(2), tx, cancel.clone());

        let handle = tokio::spawn(poller.run());
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_fatal_error() {
        let source = ScriptedStatus::new(vec![Err(ApiError::Status {
            status: 404,
            body: "no such job".into(),
        })]);
        let (tx, rx) = watch::channel(None);
        let poller = StatusPoller::new(
            source,
            "job-1",
            Duration::from_secs(2),
            tx,
            CancellationToken::new(),
        );

        assert_eq!(poller.run().await, None);
        assert_eq!(*rx.borrow(), None);
    }
}
