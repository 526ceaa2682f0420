//! # Upload Target Handler

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};

use crate::error::{ApiError, validation_error};
use crate::handlers::types::CreateUploadRequest;
use crate::server::AppState;
use crate::storage::{StorageError, WriteTarget};

/// Issue a presigned write URL for a direct client upload
#[utoipa::path(
    post,
    path = "/uploads",
    request_body = CreateUploadRequest,
    responses(
        (status = 200, description = "Presigned upload target", body = WriteTarget),
        (status = 400, description = "Invalid filename or content type", body = ApiError),
        (status = 503, description = "Object storage not configured", body = ApiError)
    ),
    tag = "uploads"
)]
pub async fn create_upload(
    State(state): State<AppState>,
    payload: Result<Json<CreateUploadRequest>, JsonRejection>,
) -> Result<Json<WriteTarget>, ApiError> {
    let Json(request) = payload?;

    if request.filename.trim().is_empty() {
        return Err(validation_error(
            "Invalid upload request",
            serde_json::json!({ "filename": "filename is required" }),
        ));
    }

    let store = state.media_store.as_ref().ok_or_else(|| {
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "STORAGE_NOT_CONFIGURED",
            "Object storage is not configured",
        )
    })?;

    let target = store
        .create_write_target(request.filename.trim(), request.content_type.trim())
        .await
        .map_err(|e| match e {
            StorageError::UnsupportedContentType(_) => validation_error(
                "Invalid upload request",
                serde_json::json!({ "content_type": e.to_string() }),
            ),
            other => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "STORAGE_UNAVAILABLE",
                other.to_string(),
            ),
        })?;

    Ok(Json(target))
}
