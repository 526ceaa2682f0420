//! # Server Configuration
//!
//! Router assembly, shared state wiring and the serve loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::engine::{AnalysisEngine, GeminiEngine};
use crate::handlers;
use crate::orchestrator::{AttemptPolicy, JobOrchestrator};
use crate::repositories::{AnalysisJobRepository, JobStore};
use crate::retry::RetryController;
use crate::storage::{MediaStore, S3MediaStore};
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub jobs: Arc<dyn JobStore>,
    pub orchestrator: JobOrchestrator,
    pub retry: RetryController,
    /// Absent when no bucket is configured; `/uploads` then answers 503
    pub media_store: Option<Arc<dyn MediaStore>>,
}

impl AppState {
    /// Wire the store, orchestrator and retry controller around `engine`.
    pub fn new(
        config: AppConfig,
        db: DatabaseConnection,
        engine: Arc<dyn AnalysisEngine>,
        media_store: Option<Arc<dyn MediaStore>>,
    ) -> anyhow::Result<Self> {
        let jobs: Arc<dyn JobStore> = Arc::new(AnalysisJobRepository::new(db.clone()));
        let media_origin = config.storage.public_base()?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        let orchestrator = JobOrchestrator::new(
            jobs.clone(),
            engine,
            http,
            AttemptPolicy::from_config(&config.orchestrator),
            media_origin,
        );
        let retry = RetryController::new(jobs.clone(), orchestrator.clone());

        Ok(Self {
            config: Arc::new(config),
            db,
            jobs,
            orchestrator,
            retry,
            media_store,
        })
    }

    /// State backed by the Gemini engine and S3 storage from `config`.
    pub async fn from_config(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<Self> {
        let engine_client = reqwest::Client::builder()
            .build()
            .context("failed to build engine HTTP client")?;
        let engine: Arc<dyn AnalysisEngine> = Arc::new(GeminiEngine::new(
            engine_client,
            &config.engine,
            Duration::from_secs(config.orchestrator.generate_timeout_seconds),
        ));

        let media_store: Option<Arc<dyn MediaStore>> = if config.storage.bucket.trim().is_empty() {
            None
        } else {
            Some(Arc::new(
                S3MediaStore::from_config(&config.storage)
                    .await
                    .context("failed to configure object storage")?,
            ))
        };

        Self::new(config, db, engine, media_store)
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/uploads", post(handlers::uploads::create_upload))
        .route("/analyses/video", post(handlers::analyses::submit_video))
        .route("/analyses/images", post(handlers::analyses::submit_images))
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/status", get(handlers::jobs::job_status))
        .route("/jobs/retry", post(handlers::jobs::retry_job))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(telemetry::trace_context_middleware))
        .layer(cors)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() || allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect::<Vec<axum::http::HeaderValue>>();
    layer.allow_origin(origins)
}

/// Starts the server with the given configuration
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .with_context(|| format!("invalid bind address '{}'", config.api_bind_addr))?;
    let profile = config.profile.clone();

    let app = create_app(AppState::from_config(config, db).await?);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::uploads::create_upload,
        crate::handlers::analyses::submit_video,
        crate::handlers::analyses::submit_images,
        crate::handlers::jobs::job_status,
        crate::handlers::jobs::retry_job,
        crate::handlers::jobs::list_jobs,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::JobStatus,
            crate::models::MediaKind,
            crate::models::MediaItem,
            crate::models::AnalysisReport,
            crate::storage::WriteTarget,
            crate::retry::RetryAccepted,
            crate::handlers::types::HealthResponse,
            crate::handlers::types::CreateUploadRequest,
            crate::handlers::types::SubmitVideoRequest,
            crate::handlers::types::SubmitImagesRequest,
            crate::handlers::types::JobAccepted,
            crate::handlers::types::RetryRequest,
            crate::handlers::types::JobStatusResponse,
            crate::handlers::types::JobSummary,
            crate::handlers::types::JobsResponse,
            crate::error::ApiError,
        )
    ),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "uploads", description = "Direct-to-storage upload targets"),
        (name = "analyses", description = "Posture analysis submissions"),
        (name = "jobs", description = "Job status, retry and history"),
    ),
    info(
        title = "Posture Analysis API",
        description = "Asynchronous sports posture analysis of uploaded videos and images",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
