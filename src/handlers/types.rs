//! # Common API Types
//!
//! Request and response bodies shared by the API handlers and by the
//! [`crate::client::ApiClient`].

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{ApiError, validation_error};
use crate::models::analysis_job::Model as JobRecord;
use crate::models::{AnalysisReport, JobId, JobState, JobStatus, MediaItem, MediaKind};

/// Request for a presigned upload target
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateUploadRequest {
    #[schema(example = "squat.mp4")]
    pub filename: String,
    #[schema(example = "video/mp4")]
    pub content_type: String,
}

/// Submission of one uploaded video
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitVideoRequest {
    /// Read URL returned by `POST /uploads`
    #[schema(example = "https://media.example.com/videos/2026/10/16/6f1c-squat.mp4")]
    pub media_reference: String,
    #[schema(example = "squat.mp4")]
    pub filename: String,
    #[schema(example = "video/mp4")]
    pub content_type: String,
}

/// Submission of 1 to 3 uploaded images analyzed as a comparison
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitImagesRequest {
    pub images: Vec<MediaItem>,
}

/// Acknowledgement of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobAccepted {
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
}

#[derive(Debug, Deserialize)]
pub struct JobStatusQuery {
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RetryRequest {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub job_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Maximum number of jobs to return
    pub limit: Option<u64>,
}

/// Current view of a job. `report` is present only when completed and
/// `error_message` only when failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobStatusResponse {
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
    pub status: JobStatus,
    #[schema(example = "waiting for engine to process")]
    pub status_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<AnalysisReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub media_kind: MediaKind,
    pub media_reference: String,
    pub filename: String,
    pub content_type: String,
    /// Processing attempts started, including retries
    pub attempts: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl From<JobRecord> for JobStatusResponse {
    fn from(record: JobRecord) -> Self {
        let (report, error_message) = match record.state() {
            JobState::Completed { report } => (Some(report.clone()), None),
            JobState::Failed { error_message } => (None, Some(error_message.to_string())),
            JobState::Pending { .. } | JobState::Processing { .. } => (None, None),
        };

        Self {
            job_id: record.job_id(),
            status: record.status,
            status_text: record.status_text,
            report,
            error_message,
            media_kind: record.media_kind,
            media_reference: record.media_reference,
            filename: record.original_filename,
            content_type: record.content_type,
            attempts: record.attempts,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

/// History entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobSummary {
    #[schema(value_type = String, format = "uuid")]
    pub job_id: JobId,
    pub status: JobStatus,
    pub status_text: String,
    pub media_kind: MediaKind,
    pub media_reference: String,
    pub filename: String,
    pub item_count: usize,
    pub attempts: i32,
    pub has_report: bool,
    pub created_at: String,
}

impl From<JobRecord> for JobSummary {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.job_id(),
            status: record.status,
            status_text: record.status_text,
            media_kind: record.media_kind,
            item_count: record.media_items.0.len().max(1),
            media_reference: record.media_reference,
            filename: record.original_filename,
            attempts: record.attempts,
            has_report: record.report.is_some(),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobsResponse {
    /// Most recent jobs first
    pub jobs: Vec<JobSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    #[schema(example = "ok")]
    pub database: String,
}

/// Parse a job id supplied by a caller, rejecting blank and malformed values.
pub fn parse_job_id(raw: Option<&str>) -> Result<JobId, ApiError> {
    let raw = raw.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return Err(validation_error(
            "Missing job id",
            serde_json::json!({ "job_id": "job_id is required" }),
        ));
    }

    raw.parse().map_err(|_| {
        validation_error(
            "Invalid job id",
            serde_json::json!({ "job_id": "job_id must be a UUID" }),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_parse_job_id() {
        assert_eq!(
            parse_job_id(None).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            parse_job_id(Some("   ")).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            &*parse_job_id(Some("nope")).unwrap_err().code,
            "VALIDATION_FAILED"
        );

        let id = JobId::new();
        assert_eq!(parse_job_id(Some(&id.to_string())).unwrap(), id);
    }
}
