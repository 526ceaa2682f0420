//! AnalysisJob entity model
//!
//! SeaORM entity for the `analysis_jobs` table. One row is one posture analysis
//! request; it is created `pending`, driven through `processing` by an attempt
//! and finalized as `completed` or `failed`. A retry starts a new attempt on the
//! same row.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::FromJsonQueryResult;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Externally visible identity of a job. Stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

/// Identity of one processing attempt against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl AttemptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<Uuid> for AttemptId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Lifecycle status of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal states see no further automatic transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of media a job analyzes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[sea_orm(string_value = "video")]
    Video,
    #[sea_orm(string_value = "image")]
    Image,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
        }
    }

    /// Whether `content_type` is acceptable for this media kind.
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let prefix = match self {
            MediaKind::Video => "video/",
            MediaKind::Image => "image/",
        };
        essence.len() > prefix.len() && essence.starts_with(prefix)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded source media item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MediaItem {
    /// Publicly fetchable URL of the uploaded object
    pub url: String,
    pub filename: String,
    pub content_type: String,
}

/// Media items stored as JSON. A video job holds exactly one item.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, FromJsonQueryResult)]
#[serde(transparent)]
pub struct MediaItems(pub Vec<MediaItem>);

/// Final analysis report, written once when a job completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult, ToSchema)]
pub struct AnalysisReport {
    /// Report text returned by the engine
    pub text: String,
    /// Time the report was generated
    pub timestamp: DateTime<Utc>,
    /// Engine model that produced the report
    pub model_used: String,
    pub media_kind: MediaKind,
    /// Number of media items analyzed together
    pub item_count: u32,
}

/// AnalysisJob entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "analysis_jobs")]
pub struct Model {
    /// Job identifier (primary key), stable across retries
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Attempt currently owning this record
    pub attempt_id: Uuid,

    /// Number of attempts started for this job
    pub attempts: i32,

    pub status: JobStatus,

    /// Human readable progress description
    pub status_text: String,

    /// Failure description, present only when status is failed
    pub error_message: Option<String>,

    pub media_kind: MediaKind,

    /// Externally reachable URL of the source media (first image for image sets)
    pub media_reference: String,

    #[sea_orm(column_type = "JsonBinary")]
    pub media_items: MediaItems,

    pub original_filename: String,

    pub content_type: String,

    /// File reference returned by the engine's ingest step
    pub engine_file_reference: Option<String>,

    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub report: Option<AnalysisReport>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Status-gated view of a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState<'a> {
    Pending { status_text: &'a str },
    Processing { status_text: &'a str },
    Completed { report: &'a AnalysisReport },
    Failed { error_message: &'a str },
}

impl Model {
    pub fn job_id(&self) -> JobId {
        JobId(self.id)
    }

    pub fn current_attempt(&self) -> AttemptId {
        AttemptId(self.attempt_id)
    }

    /// Resolve the record into its status-gated view.
    ///
    /// A completed record without a report, or a failed record without an
    /// error message, violates the store invariants; both are surfaced as a
    /// failure so callers never observe a half-written terminal state.
    pub fn state(&self) -> JobState<'_> {
        match self.status {
            JobStatus::Pending => JobState::Pending {
                status_text: &self.status_text,
            },
            JobStatus::Processing => JobState::Processing {
                status_text: &self.status_text,
            },
            JobStatus::Completed => match &self.report {
                Some(report) => JobState::Completed { report },
                None => JobState::Failed {
                    error_message: "job completed without a report",
                },
            },
            JobStatus::Failed => JobState::Failed {
                error_message: self
                    .error_message
                    .as_deref()
                    .unwrap_or("job failed without an error message"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_content_types() {
        assert!(MediaKind::Video.accepts_content_type("video/mp4"));
        assert!(MediaKind::Video.accepts_content_type("Video/QuickTime; codecs=avc1"));
        assert!(!MediaKind::Video.accepts_content_type("video/"));
        assert!(!MediaKind::Video.accepts_content_type("text/plain"));
        assert!(!MediaKind::Video.accepts_content_type("image/png"));
        assert!(MediaKind::Image.accepts_content_type("image/jpeg"));
        assert!(!MediaKind::Image.accepts_content_type("video/mp4"));
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!(
            serde_json::to_value(JobStatus::Processing).unwrap(),
            "processing"
        );
    }

    #[test]
    fn test_job_id_parsing() {
        let id = Uuid::new_v4();
        let parsed: JobId = format!(" {} ", id).parse().unwrap();
        assert_eq!(parsed, JobId(id));
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
