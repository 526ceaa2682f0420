//! Retry of failed analysis jobs.
//!
//! A retry reuses the original job id and stored media, resets the record to
//! `pending` under a fresh attempt id, and starts a new attempt. The reset is a
//! compare-and-swap on the `failed` status, so concurrent retries of one job
//! start at most one attempt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

use crate::error::JobError;
use crate::models::{AttemptId, JobId, JobStatus};
use crate::orchestrator::{JobOrchestrator, MediaSource};
use crate::repositories::JobStore;

/// Acknowledgement of an accepted retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RetryAccepted {
    #[schema(value_type = String, format = "uuid")]
    pub original_job_id: JobId,
    /// Attempt now processing the job
    #[schema(value_type = String, format = "uuid")]
    pub processing_attempt_id: AttemptId,
    pub status: JobStatus,
}

#[derive(Clone)]
pub struct RetryController {
    store: Arc<dyn JobStore>,
    orchestrator: JobOrchestrator,
}

impl RetryController {
    pub fn new(store: Arc<dyn JobStore>, orchestrator: JobOrchestrator) -> Self {
        Self {
            store,
            orchestrator,
        }
    }

    /// Restart a failed job. Jobs in any other state are rejected unchanged.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn retry(&self, job_id: JobId) -> Result<RetryAccepted, JobError> {
        let record = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        if record.status != JobStatus::Failed {
            return Err(JobError::InvalidState {
                job_id,
                status: record.status,
            });
        }

        let source = MediaSource::from_record(&record).ok_or_else(|| {
            JobError::validation("job has no stored media to retry".to_string())
        })?;

        let attempt_id = AttemptId::new();
        if !self.store.begin_retry(job_id, attempt_id).await? {
            // Another retry won the swap; report whatever state it left behind
            let status = self
                .store
                .get(job_id)
                .await?
                .map(|r| r.status)
                .ok_or(JobError::NotFound(job_id))?;
            warn!(%status, "Retry lost the race for a failed job");
            return Err(JobError::InvalidState { job_id, status });
        }

        info!(
            %attempt_id,
            previous_attempts = record.attempts,
            "Retrying failed analysis job"
        );
        self.orchestrator.spawn_attempt(job_id, attempt_id, source);

        Ok(RetryAccepted {
            original_job_id: job_id,
            processing_attempt_id: attempt_id,
            status: JobStatus::Pending,
        })
    }
}
