//! # Analysis Submission Handlers
//!
//! Accept a video or an image set for analysis. Both return `202 Accepted`
//! with the job id as soon as the record exists; processing continues in the
//! background and is observed through `GET /jobs/status`.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use tracing::info;

use crate::error::ApiError;
use crate::handlers::types::{JobAccepted, SubmitImagesRequest, SubmitVideoRequest};
use crate::orchestrator::SubmitVideo;
use crate::server::AppState;

/// Submit an uploaded video for posture analysis
#[utoipa::path(
    post,
    path = "/analyses/video",
    request_body = SubmitVideoRequest,
    responses(
        (status = 202, description = "Job created; poll its status", body = JobAccepted),
        (status = 400, description = "Invalid submission", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "analyses"
)]
pub async fn submit_video(
    State(state): State<AppState>,
    payload: Result<Json<SubmitVideoRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let Json(request) = payload?;

    let job_id = state
        .orchestrator
        .start_analysis(SubmitVideo {
            media_reference: request.media_reference,
            filename: request.filename,
            content_type: request.content_type,
        })
        .await?;

    info!(%job_id, "Video analysis accepted");
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

/// Submit 1 to 3 uploaded images for a comparative posture analysis
#[utoipa::path(
    post,
    path = "/analyses/images",
    request_body = SubmitImagesRequest,
    responses(
        (status = 202, description = "Job created; poll its status", body = JobAccepted),
        (status = 400, description = "Invalid submission", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "analyses"
)]
pub async fn submit_images(
    State(state): State<AppState>,
    payload: Result<Json<SubmitImagesRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let Json(request) = payload?;
    let count = request.images.len();

    let job_id = state
        .orchestrator
        .start_image_set_analysis(request.images)
        .await?;

    info!(%job_id, images = count, "Image set analysis accepted");
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}
