//! # AnalysisJob Repository
//!
//! Durable job record store. Every write made by an attempt is keyed by both
//! the job id and the attempt id, so an attempt that lost ownership of a record
//! (because a retry started a newer attempt) can no longer modify it.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use tracing::{debug, info};

use crate::models::analysis_job::{ActiveModel, Column, Entity, Model};
use crate::models::{AnalysisReport, AttemptId, JobId, JobStatus, MediaItems, MediaKind};

/// Status text written when a job is first created.
pub const SUBMITTED_STATUS_TEXT: &str = "submitted";
/// Status text written when a failed job is reset by a retry.
pub const RETRY_STATUS_TEXT: &str = "retry submitted";

/// Fields required to create a job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub media_kind: MediaKind,
    pub media_reference: String,
    pub media_items: MediaItems,
    pub original_filename: String,
    pub content_type: String,
}

/// Partial update applied to a job record by its owning attempt.
///
/// Each variant encodes one legal transition, which keeps the
/// `error_message` / `status` and `report` / `completed` pairing intact.
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    /// Move to (or stay in) a non-terminal status with new progress text
    Progress {
        status: JobStatus,
        status_text: String,
    },
    /// Record the engine's file reference after ingest
    EngineFile {
        reference: String,
        status_text: String,
    },
    /// Terminal success
    Completed {
        report: AnalysisReport,
        status_text: String,
    },
    /// Terminal failure
    Failed { error_message: String },
}

impl JobUpdate {
    pub fn processing(status_text: impl Into<String>) -> Self {
        JobUpdate::Progress {
            status: JobStatus::Processing,
            status_text: status_text.into(),
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        JobUpdate::Failed {
            error_message: error_message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobUpdate::Completed { .. } | JobUpdate::Failed { .. })
    }

    fn into_active_model(self) -> ActiveModel {
        let mut model = ActiveModel {
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };

        match self {
            JobUpdate::Progress {
                status,
                status_text,
            } => {
                model.status = Set(status);
                model.status_text = Set(status_text);
                model.error_message = Set(None);
            }
            JobUpdate::EngineFile {
                reference,
                status_text,
            } => {
                model.status = Set(JobStatus::Processing);
                model.status_text = Set(status_text);
                model.engine_file_reference = Set(Some(reference));
                model.error_message = Set(None);
            }
            JobUpdate::Completed {
                report,
                status_text,
            } => {
                model.status = Set(JobStatus::Completed);
                model.status_text = Set(status_text);
                model.report = Set(Some(report));
                model.error_message = Set(None);
            }
            JobUpdate::Failed { error_message } => {
                model.status = Set(JobStatus::Failed);
                model.status_text = Set("analysis failed".to_string());
                model.error_message = Set(Some(error_message));
            }
        }

        model
    }
}

/// Durable key-value store of job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `pending` record owned by a fresh attempt.
    async fn create(&self, job: NewJob) -> Result<Model, DbErr>;

    /// Apply `update` if `attempt_id` still owns the record. Terminal updates
    /// only apply to non-terminal records. Returns whether a row changed.
    async fn update(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        update: JobUpdate,
    ) -> Result<bool, DbErr>;

    async fn get(&self, job_id: JobId) -> Result<Option<Model>, DbErr>;

    /// Most recent records first.
    async fn list_recent(&self, limit: u64) -> Result<Vec<Model>, DbErr>;

    /// Atomically move a `failed` record back to `pending` under a new attempt.
    /// Returns false when the record was not in the failed state.
    async fn begin_retry(&self, job_id: JobId, attempt_id: AttemptId) -> Result<bool, DbErr>;
}

/// SeaORM-backed job store
#[derive(Clone)]
pub struct AnalysisJobRepository {
    db: DatabaseConnection,
}

impl AnalysisJobRepository {
    /// Create a new AnalysisJobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobStore for AnalysisJobRepository {
    async fn create(&self, job: NewJob) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();
        let job_id = JobId::new();
        let attempt_id = AttemptId::new();

        let record = ActiveModel {
            id: Set(job_id.0),
            attempt_id: Set(attempt_id.0),
            attempts: Set(1),
            status: Set(JobStatus::Pending),
            status_text: Set(SUBMITTED_STATUS_TEXT.to_string()),
            error_message: Set(None),
            media_kind: Set(job.media_kind),
            media_reference: Set(job.media_reference),
            media_items: Set(job.media_items),
            original_filename: Set(job.original_filename),
            content_type: Set(job.content_type),
            engine_file_reference: Set(None),
            report: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let created = record.insert(&self.db).await?;

        info!(
            job_id = %created.id,
            attempt_id = %created.attempt_id,
            media_kind = %created.media_kind,
            "Analysis job created"
        );

        Ok(created)
    }

    async fn update(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        update: JobUpdate,
    ) -> Result<bool, DbErr> {
        let terminal = update.is_terminal();
        let mut query = Entity::update_many()
            .set(update.into_active_model())
            .filter(Column::Id.eq(job_id.0))
            .filter(Column::AttemptId.eq(attempt_id.0));

        if terminal {
            query = query.filter(Column::Status.is_in([JobStatus::Pending, JobStatus::Processing]));
        }

        let result = query.exec(&self.db).await?;
        let applied = result.rows_affected > 0;

        if !applied {
            debug!(
                job_id = %job_id,
                attempt_id = %attempt_id,
                terminal,
                "Job update skipped; attempt no longer owns a writable record"
            );
        }

        Ok(applied)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id.0).one(&self.db).await
    }

    async fn list_recent(&self, limit: u64) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .order_by_desc(Column::CreatedAt)
            .order_by_desc(Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    async fn begin_retry(&self, job_id: JobId, attempt_id: AttemptId) -> Result<bool, DbErr> {
        let reset = ActiveModel {
            attempt_id: Set(attempt_id.0),
            status: Set(JobStatus::Pending),
            status_text: Set(RETRY_STATUS_TEXT.to_string()),
            error_message: Set(None),
            engine_file_reference: Set(None),
            report: Set(None),
            updated_at: Set(Utc::now().fixed_offset()),
            ..Default::default()
        };

        let result = Entity::update_many()
            .set(reset)
            .col_expr(Column::Attempts, Expr::col(Column::Attempts).add(1))
            .filter(Column::Id.eq(job_id.0))
            .filter(Column::Status.eq(JobStatus::Failed))
            .exec(&self.db)
            .await?;

        let reset_applied = result.rows_affected == 1;
        if reset_applied {
            info!(job_id = %job_id, attempt_id = %attempt_id, "Failed job reset for retry");
        }

        Ok(reset_applied)
    }
}
