//! Fixed-interval job status polling.
//!
//! Reads the status once immediately and then once per interval until the job
//! is terminal, a read fails, or the caller cancels. A failed read ends the
//! poll; it is reported separately from a failed job.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ClientError;
use crate::handlers::types::JobStatusResponse;
use crate::models::{AnalysisReport, JobId, JobStatus};

/// Anything able to read a job's current status.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn read_status(&self, job_id: JobId) -> Result<JobStatusResponse, ClientError>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between reads (default: 5s)
    pub interval: Duration,
    /// Give up after this many reads; unbounded when `None`
    pub max_attempts: Option<u32>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: None,
        }
    }
}

/// How a poll ended when no polling error occurred.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed(AnalysisReport),
    Failed { error_message: String },
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("status read failed: {0}")]
    Read(#[source] ClientError),

    #[error("job {job_id} still running after {attempts} status reads")]
    AttemptsExhausted { job_id: JobId, attempts: u32 },

    #[error("job {0} completed without a report")]
    MissingReport(JobId),
}

pub struct JobPoller<S> {
    source: S,
    config: PollerConfig,
}

impl<S: StatusSource> JobPoller<S> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        Self { source, config }
    }

    /// Poll `job_id` until it is terminal. `on_update` sees every non-terminal
    /// read; nothing is delivered after `cancel` fires.
    pub async fn poll<F>(
        &self,
        job_id: JobId,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> Result<PollOutcome, PollError>
    where
        F: FnMut(&JobStatusResponse) + Send,
    {
        let mut ticker = interval(self.config.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reads: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                _ = ticker.tick() => {}
            }

            // A read still in flight when cancellation fires is dropped unseen
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
                read = self.source.read_status(job_id) => read,
            };
            reads += 1;

            let status = read.map_err(|e| {
                warn!(%job_id, error = %e, "Status read failed; stopping poll");
                PollError::Read(e)
            })?;

            match status.status {
                JobStatus::Completed => {
                    return status
                        .report
                        .map(PollOutcome::Completed)
                        .ok_or(PollError::MissingReport(job_id));
                }
                JobStatus::Failed => {
                    return Ok(PollOutcome::Failed {
                        error_message: status.error_message.unwrap_or_default(),
                    });
                }
                JobStatus::Pending | JobStatus::Processing => {
                    debug!(%job_id, status = %status.status, text = %status.status_text, "Job still running");
                    on_update(&status);
                }
            }

            if self.config.max_attempts.is_some_and(|max| reads >= max) {
                return Err(PollError::AttemptsExhausted {
                    job_id,
                    attempts: reads,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaKind;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedSource {
        responses: Mutex<VecDeque<Result<JobStatusResponse, ClientError>>>,
        reads: AtomicU32,
    }

    impl ScriptedSource {
        fn new(responses: Vec<Result<JobStatusResponse, ClientError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                reads: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn read_status(&self, job_id: JobId) -> Result<JobStatusResponse, ClientError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(status(job_id, JobStatus::Processing)))
        }
    }

    fn status(job_id: JobId, status: JobStatus) -> JobStatusResponse {
        JobStatusResponse {
            job_id,
            status,
            status_text: format!("{} text", status),
            report: None,
            error_message: None,
            media_kind: MediaKind::Video,
            media_reference: "https://media.test/a.mp4".to_string(),
            filename: "a.mp4".to_string(),
            content_type: "video/mp4".to_string(),
            attempts: 1,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn fast() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(10),
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn test_poll_until_completed() {
        let job_id = JobId::new();
        let report = AnalysisReport {
            text: "good form".to_string(),
            timestamp: Utc::now(),
            model_used: "m".to_string(),
            media_kind: MediaKind::Video,
            item_count: 1,
        };
        let mut done = status(job_id, JobStatus::Completed);
        done.report = Some(report.clone());

        let source = ScriptedSource::new(vec![
            Ok(status(job_id, JobStatus::Pending)),
            Ok(status(job_id, JobStatus::Processing)),
            Ok(status(job_id, JobStatus::Processing)),
            Ok(done),
        ]);
        let poller = JobPoller::new(source, fast());

        let mut seen = Vec::new();
        let outcome = poller
            .poll(job_id, &CancellationToken::new(), |s| seen.push(s.status))
            .await
            .unwrap();

        assert_eq!(outcome, PollOutcome::Completed(report));
        assert_eq!(
            seen,
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Processing]
        );
        assert_eq!(poller.source.reads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_job_failure_is_not_a_poll_error() {
        let job_id = JobId::new();
        let mut failed = status(job_id, JobStatus::Failed);
        failed.error_message = Some("engine did not finish processing".to_string());

        let poller = JobPoller::new(ScriptedSource::new(vec![Ok(failed)]), fast());
        let outcome = poller
            .poll(job_id, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(
            outcome,
            PollOutcome::Failed {
                error_message: "engine did not finish processing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_read_error_stops_polling() {
        let job_id = JobId::new();
        let source = ScriptedSource::new(vec![
            Ok(status(job_id, JobStatus::Processing)),
            Err(ClientError::Api {
                status: 503,
                code: "DATABASE_UNAVAILABLE".to_string(),
                message: "down".to_string(),
            }),
        ]);
        let poller = JobPoller::new(source, fast());

        let err = poller
            .poll(job_id, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, PollError::Read(ClientError::Api { status: 503, .. })));
        assert_eq!(poller.source.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let job_id = JobId::new();
        let poller = JobPoller::new(ScriptedSource::new(Vec::new()), fast());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(35)).await;
            trigger.cancel();
        });

        let outcome = poller.poll(job_id, &cancel, |_| {}).await.unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled);

        let reads = poller.source.reads.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(poller.source.reads.load(Ordering::SeqCst), reads);
    }

    #[tokio::test]
    async fn test_max_attempts_bounds_polling() {
        let job_id = JobId::new();
        let poller = JobPoller::new(
            ScriptedSource::new(Vec::new()),
            PollerConfig {
                max_attempts: Some(3),
                ..fast()
            },
        );

        let err = poller
            .poll(job_id, &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::AttemptsExhausted { attempts: 3, .. }));
    }
}
