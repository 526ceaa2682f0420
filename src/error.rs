//! # Error Handling
//!
//! Typed job lifecycle errors plus the unified problem+json surface used by
//! every HTTP handler, with trace ID propagation.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use utoipa::ToSchema;

use crate::models::{JobId, JobStatus};
use crate::telemetry;

/// Failures of the job lifecycle.
///
/// Background attempts turn these into the stored `error_message`; synchronous
/// operations (submission, status, retry) surface them through [`ApiError`].
#[derive(Debug, Error)]
pub enum JobError {
    /// Media fetch or engine network failure
    #[error("transport error: {0}")]
    Transport(String),
    /// Engine reported the ingested file as failed
    #[error("engine failed to ingest media: {0}")]
    EngineIngestFailure(String),
    /// Engine readiness did not arrive within the ceiling
    #[error("engine did not finish processing the media within {ceiling_secs} seconds")]
    EngineTimeout { ceiling_secs: u64 },
    /// Engine rate limited the request, retry also failed
    #[error("engine rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<&'static str>,
    },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {job_id} is {status}; only failed jobs can be retried")]
    InvalidState { job_id: JobId, status: JobStatus },
    #[error("job store error: {0}")]
    Store(#[from] sea_orm::DbErr),
}

impl JobError {
    pub fn validation(message: impl Into<String>) -> Self {
        JobError::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field(field: &'static str, message: impl Into<String>) -> Self {
        JobError::Validation {
            message: message.into(),
            field: Some(field),
        }
    }

    /// Stable label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            JobError::Transport(_) => "transport",
            JobError::EngineIngestFailure(_) => "engine_ingest_failure",
            JobError::EngineTimeout { .. } => "engine_timeout",
            JobError::RateLimited(_) => "rate_limited",
            JobError::Validation { .. } => "validation",
            JobError::NotFound(_) => "not_found",
            JobError::InvalidState { .. } => "invalid_state",
            JobError::Store(_) => "store",
        }
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Request trace ID if one is installed, otherwise a short correlation ID
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::Validation { message, field } => match field {
                Some(field) => validation_error(&message, json!({ field: message.clone() })),
                None => ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message),
            },
            JobError::NotFound(job_id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Job {} not found", job_id),
            ),
            JobError::InvalidState { job_id, status } => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_STATE",
                format!("Job {} is {}; only failed jobs can be retried", job_id, status),
            )
            .with_details(json!({ "job_id": job_id, "status": status })),
            JobError::Store(db_err) => db_err.into(),
            JobError::RateLimited(message) => {
                ApiError::new(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", message)
            }
            other => {
                tracing::error!(error = %other, "Job operation failed");
                ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "ENGINE_ERROR",
                    other.to_string(),
                )
            }
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err.body_text()),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err.body_text()),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "VALIDATION_FAILED",
            format!("Invalid query string: {}", rejection.body_text()),
        )
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
