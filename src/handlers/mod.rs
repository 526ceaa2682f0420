//! # API Handlers
//!
//! HTTP endpoint handlers for the posture analysis API.

use axum::{extract::State, http::StatusCode, response::Json};
use tracing::warn;

use crate::error::ApiError;
use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod analyses;
pub mod jobs;
pub mod types;
pub mod uploads;

use types::HealthResponse;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

/// Liveness plus database reachability
#[utoipa::path(
    get,
    path = "/healthz",
    responses(
        (status = 200, description = "Service and database are healthy", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = ApiError)
    ),
    tag = "root"
)]
pub async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    crate::db::health_check(&state.db).await.map_err(|e| {
        warn!(error = %e, "Health check failed");
        ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "DATABASE_UNAVAILABLE",
            "Database is not reachable",
        )
    })?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        database: "ok".to_string(),
    }))
}
