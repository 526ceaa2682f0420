//! Test utilities shared by the integration tests.
//!
//! In-memory SQLite with migrations, a scripted analysis engine, fast attempt
//! policies and a helper that spawns the HTTP API on a random port.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use posture_analysis::config::AppConfig;
use posture_analysis::engine::{
    AnalysisEngine, EngineError, EngineFileRef, GenerateInput, IngestState,
};
use posture_analysis::models::JobId;
use posture_analysis::models::analysis_job::Model as JobRecord;
use posture_analysis::orchestrator::{AttemptPolicy, JobOrchestrator};
use posture_analysis::repositories::{AnalysisJobRepository, JobStore};
use posture_analysis::server::{AppState, create_app};
use posture_analysis::storage::MediaStore;
use sea_orm::{Database, DatabaseConnection};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

pub const MODEL_NAME: &str = "scripted-model";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// What the next generate call does.
#[derive(Debug, Clone)]
pub enum GenerateStep {
    Text(String),
    RateLimited,
    Fail(String),
    Panic,
    Delay(Duration, String),
}

/// Engine double driven by queued responses.
#[derive(Default)]
pub struct ScriptedEngine {
    states: Mutex<VecDeque<IngestState>>,
    stuck_processing: bool,
    /// Status and message `ingest` rejects every upload with
    ingest_rejection: Option<(u16, String)>,
    generate: Mutex<VecDeque<GenerateStep>>,
    pub ingest_calls: AtomicU32,
    pub generate_calls: AtomicU32,
    /// Sizes of the files handed to `ingest`
    pub ingested_sizes: Mutex<Vec<u64>>,
    pub ingested_paths: Mutex<Vec<PathBuf>>,
    /// Number of inline parts per generate call; 0 for file input
    pub inline_counts: Mutex<Vec<usize>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// File states returned by successive probes; `Active` once exhausted.
    pub fn with_states(mut self, states: Vec<IngestState>) -> Self {
        self.states = Mutex::new(states.into());
        self
    }

    /// Every probe reports the file as still processing.
    pub fn stuck_processing(mut self) -> Self {
        self.stuck_processing = true;
        self
    }

    /// Every upload is answered with an API error.
    pub fn rejecting_ingest(mut self, status: u16, message: &str) -> Self {
        self.ingest_rejection = Some((status, message.to_string()));
        self
    }

    /// Generate results in call order; a default report once exhausted.
    pub fn with_generate(mut self, steps: Vec<GenerateStep>) -> Self {
        self.generate = Mutex::new(steps.into());
        self
    }

    pub fn generate_count(&self) -> u32 {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn ingest_count(&self) -> u32 {
        self.ingest_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisEngine for ScriptedEngine {
    fn model_name(&self) -> &str {
        MODEL_NAME
    }

    async fn ingest(
        &self,
        media: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<EngineFileRef, EngineError> {
        let n = self.ingest_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((status, message)) = &self.ingest_rejection {
            return Err(EngineError::Api {
                status: *status,
                message: message.clone(),
            });
        }
        let size = tokio::fs::metadata(media).await?.len();
        self.ingested_sizes.lock().unwrap().push(size);
        self.ingested_paths.lock().unwrap().push(media.to_path_buf());

        Ok(EngineFileRef {
            name: format!("files/{}-{}", display_name, n),
            uri: format!("https://engine.test/files/{}", n),
            mime_type: mime_type.to_string(),
        })
    }

    async fn file_state(&self, _file: &EngineFileRef) -> Result<IngestState, EngineError> {
        if self.stuck_processing {
            return Ok(IngestState::Processing);
        }
        Ok(self
            .states
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(IngestState::Active))
    }

    async fn generate(
        &self,
        input: GenerateInput<'_>,
        _prompt: &str,
    ) -> Result<String, EngineError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let parts = match input {
            GenerateInput::File(_) => 0,
            GenerateInput::Inline(media) => media.len(),
        };
        self.inline_counts.lock().unwrap().push(parts);

        let step = self
            .generate
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| GenerateStep::Text("posture report".to_string()));

        match step {
            GenerateStep::Text(text) => Ok(text),
            GenerateStep::RateLimited => Err(EngineError::RateLimited {
                retry_after_secs: Some(1),
            }),
            GenerateStep::Fail(message) => Err(EngineError::Api {
                status: 500,
                message,
            }),
            GenerateStep::Panic => panic!("scripted engine panic"),
            GenerateStep::Delay(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(text)
            }
        }
    }
}

/// Millisecond-scale attempt policy writing transient files under `scratch_dir`.
pub fn fast_policy(scratch_dir: &Path) -> AttemptPolicy {
    AttemptPolicy {
        ready_ceiling: Duration::from_millis(200),
        ready_interval: Duration::from_millis(10),
        rate_limit_backoff: Duration::from_millis(20),
        fetch_timeout: Duration::from_secs(5),
        generate_timeout: Duration::from_secs(5),
        max_concurrent: 4,
        max_media_bytes: 1024 * 1024,
        scratch_dir: scratch_dir.to_path_buf(),
    }
}

pub fn job_store(db: &DatabaseConnection) -> Arc<dyn JobStore> {
    Arc::new(AnalysisJobRepository::new(db.clone()))
}

pub fn orchestrator(
    store: Arc<dyn JobStore>,
    engine: Arc<ScriptedEngine>,
    policy: AttemptPolicy,
) -> JobOrchestrator {
    JobOrchestrator::new(store, engine, reqwest::Client::new(), policy, None)
}

/// Poll the store until the job is completed or failed.
pub async fn wait_for_terminal(store: &Arc<dyn JobStore>, job_id: JobId) -> Result<JobRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = store
            .get(job_id)
            .await?
            .context("job record disappeared")?;
        if record.status.is_terminal() {
            return Ok(record);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("job {} still {} after 10s", job_id, record.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Number of entries in `dir`.
pub fn file_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

pub struct TestServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl TestServerHandle {
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            handle.await.context("server task join failed")??;
        }
        Ok(())
    }
}

impl Drop for TestServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub struct TestApp {
    pub url: String,
    pub state: AppState,
    pub engine: Arc<ScriptedEngine>,
    pub handle: TestServerHandle,
}

/// Spawn the API on a random port backed by in-memory SQLite and `engine`.
pub async fn spawn_test_app(
    config: AppConfig,
    engine: ScriptedEngine,
    media_store: Option<Arc<dyn MediaStore>>,
    scratch_dir: &Path,
) -> Result<TestApp> {
    let db = setup_test_db().await?;
    let engine = Arc::new(engine);

    let mut config = config;
    config.orchestrator.scratch_dir = Some(scratch_dir.to_path_buf());
    config.orchestrator.rate_limit_backoff_seconds = 0;

    let state = AppState::new(config, db, engine.clone(), media_store)?;
    let app = create_app(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}", listener.local_addr()?);

    let (ready_tx, ready_rx) = oneshot::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server_task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = ready_tx.send(());
        server.await.context("axum server error")
    });
    ready_rx.await.context("server task to signal readiness")?;

    Ok(TestApp {
        url,
        state,
        engine,
        handle: TestServerHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(server_task),
        },
    })
}
