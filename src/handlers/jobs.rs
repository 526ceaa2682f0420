//! # Jobs API Handlers
//!
//! Status reads, retries of failed jobs and the recent-history listing.

use axum::{
    extract::{Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::StatusCode,
    response::Json,
};

use crate::error::{ApiError, JobError, validation_error};
use crate::handlers::types::{
    HistoryQuery, JobStatusQuery, JobStatusResponse, JobSummary, JobsResponse, RetryRequest,
    parse_job_id,
};
use crate::retry::RetryAccepted;
use crate::server::AppState;

/// Read the current state of a job
#[utoipa::path(
    get,
    path = "/jobs/status",
    params(
        ("job_id" = String, Query, description = "Job identifier returned at submission")
    ),
    responses(
        (status = 200, description = "Current job state", body = JobStatusResponse, example = json!({
            "job_id": "550e8400-e29b-41d4-a716-446655440000",
            "status": "processing",
            "status_text": "waiting for engine to process",
            "media_kind": "video",
            "media_reference": "https://media.example.com/videos/2026/10/16/6f1c-squat.mp4",
            "filename": "squat.mp4",
            "content_type": "video/mp4",
            "attempts": 1,
            "created_at": "2026-10-16T08:00:00+00:00",
            "updated_at": "2026-10-16T08:00:12+00:00"
        })),
        (status = 400, description = "Missing or malformed job id", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn job_status(
    State(state): State<AppState>,
    query: Result<Query<JobStatusQuery>, QueryRejection>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let Query(params) = query?;
    let job_id = parse_job_id(params.job_id.as_deref())?;

    let record = state
        .jobs
        .get(job_id)
        .await?
        .ok_or(JobError::NotFound(job_id))?;

    Ok(Json(JobStatusResponse::from(record)))
}

/// Retry a failed job under a new processing attempt
#[utoipa::path(
    post,
    path = "/jobs/retry",
    request_body = RetryRequest,
    responses(
        (status = 202, description = "Retry started", body = RetryAccepted),
        (status = 400, description = "Missing job id or job is not failed", body = ApiError),
        (status = 404, description = "Unknown job", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn retry_job(
    State(state): State<AppState>,
    payload: Result<Json<RetryRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RetryAccepted>), ApiError> {
    let Json(request) = payload?;
    let job_id = parse_job_id(request.job_id.as_deref())?;

    let accepted = state.retry.retry(job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// List the most recent jobs, newest first
#[utoipa::path(
    get,
    path = "/jobs",
    params(
        ("limit" = Option<u64>, Query, description = "Maximum number of jobs to return (default 10, max 50)")
    ),
    responses(
        (status = 200, description = "Recent jobs", body = JobsResponse),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<JobsResponse>, ApiError> {
    let Query(params) = query?;
    let history = &state.config.history;

    if let Some(limit) = params.limit {
        if limit == 0 {
            return Err(validation_error(
                "Invalid limit",
                serde_json::json!({ "limit": "Minimum allowed limit is 1" }),
            ));
        }
        if limit > history.max_limit {
            return Err(validation_error(
                "Invalid limit",
                serde_json::json!({
                    "limit": format!("Maximum allowed limit is {}", history.max_limit)
                }),
            ));
        }
    }

    let records = state
        .jobs
        .list_recent(history.effective_limit(params.limit))
        .await?;

    Ok(Json(JobsResponse {
        jobs: records.into_iter().map(JobSummary::from).collect(),
    }))
}
