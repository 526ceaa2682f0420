//! Job Orchestrator
//!
//! Creates analysis job records and drives each processing attempt through
//! fetch, engine ingest, readiness wait and report generation in a detached
//! task. Every store write carries the attempt id, so an attempt that no
//! longer owns its record stops without touching it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use scopeguard::defer;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

use crate::config::OrchestratorConfig;
use crate::engine::{
    AnalysisEngine, EngineError, EngineFileRef, GenerateInput, InlineMedia, ReadyOutcome,
    prompt::build_prompt,
};
use crate::error::JobError;
use crate::models::{
    AnalysisReport, AttemptId, JobId, JobStatus, MediaItem, MediaItems, MediaKind,
    analysis_job::Model as JobRecord,
};
use crate::repositories::{JobStore, JobUpdate, NewJob};

/// Most images accepted in one comparison job.
pub const MAX_IMAGES_PER_JOB: usize = 3;

pub const STATUS_QUEUED: &str = "queued for processing";
pub const STATUS_DOWNLOADING: &str = "downloading media";
pub const STATUS_FETCHING_IMAGES: &str = "fetching images";
pub const STATUS_UPLOADED: &str = "uploaded to engine";
pub const STATUS_WAITING_FOR_ENGINE: &str = "waiting for engine to process";
pub const STATUS_GENERATING: &str = "generating report";
pub const STATUS_COMPLETED: &str = "analysis complete";

/// Timing and resource limits for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptPolicy {
    pub ready_ceiling: Duration,
    pub ready_interval: Duration,
    pub rate_limit_backoff: Duration,
    pub fetch_timeout: Duration,
    pub generate_timeout: Duration,
    pub max_concurrent: usize,
    pub max_media_bytes: u64,
    pub scratch_dir: PathBuf,
}

impl Default for AttemptPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl AttemptPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            ready_ceiling: Duration::from_secs(config.ready_ceiling_seconds),
            ready_interval: Duration::from_secs(config.ready_poll_interval_seconds),
            rate_limit_backoff: Duration::from_secs(config.rate_limit_backoff_seconds),
            fetch_timeout: Duration::from_secs(config.fetch_timeout_seconds),
            generate_timeout: Duration::from_secs(config.generate_timeout_seconds),
            max_concurrent: config.max_concurrent_jobs,
            max_media_bytes: config.max_media_bytes,
            scratch_dir: config
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}

/// A single video submission.
#[derive(Debug, Clone)]
pub struct SubmitVideo {
    pub media_reference: String,
    pub filename: String,
    pub content_type: String,
}

/// What an attempt analyzes.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaSource {
    Video(MediaItem),
    Images(Vec<MediaItem>),
}

impl MediaSource {
    /// Rebuild the source from a stored record.
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        match record.media_kind {
            MediaKind::Video => {
                let item = record.media_items.0.first().cloned().unwrap_or(MediaItem {
                    url: record.media_reference.clone(),
                    filename: record.original_filename.clone(),
                    content_type: record.content_type.clone(),
                });
                Some(MediaSource::Video(item))
            }
            MediaKind::Image if record.media_items.0.is_empty() => None,
            MediaKind::Image => Some(MediaSource::Images(record.media_items.0.clone())),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaSource::Video(_) => MediaKind::Video,
            MediaSource::Images(_) => MediaKind::Image,
        }
    }

    pub fn item_count(&self) -> usize {
        match self {
            MediaSource::Video(_) => 1,
            MediaSource::Images(items) => items.len(),
        }
    }
}

/// Why an attempt stopped without producing a report.
#[derive(Debug)]
enum AttemptError {
    /// The record is owned by a newer attempt or already terminal
    Superseded,
    Failed(JobError),
}

impl From<JobError> for AttemptError {
    fn from(error: JobError) -> Self {
        AttemptError::Failed(error)
    }
}

impl From<sea_orm::DbErr> for AttemptError {
    fn from(error: sea_orm::DbErr) -> Self {
        AttemptError::Failed(JobError::Store(error))
    }
}

/// Local copy of fetched media, removed when dropped.
struct TransientFile {
    path: PathBuf,
}

impl TransientFile {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Transient media removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove transient media"),
        }
    }
}

/// Drives analysis jobs from submission to a terminal state.
#[derive(Clone)]
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    engine: Arc<dyn AnalysisEngine>,
    http: reqwest::Client,
    policy: Arc<AttemptPolicy>,
    semaphore: Arc<Semaphore>,
    /// Origin submitted media must come from, when configured
    media_origin: Option<Url>,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        engine: Arc<dyn AnalysisEngine>,
        http: reqwest::Client,
        policy: AttemptPolicy,
        media_origin: Option<Url>,
    ) -> Self {
        Self {
            store,
            engine,
            http,
            semaphore: Arc::new(Semaphore::new(policy.max_concurrent.max(1))),
            policy: Arc::new(policy),
            media_origin,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Create a pending job for one uploaded video and start processing it.
    /// Returns as soon as the record exists.
    pub async fn start_analysis(&self, submission: SubmitVideo) -> Result<JobId, JobError> {
        let item = self.validate_item(
            MediaKind::Video,
            MediaItem {
                url: submission.media_reference,
                filename: submission.filename,
                content_type: submission.content_type,
            },
            "media_reference",
        )?;

        let record = self
            .store
            .create(NewJob {
                media_kind: MediaKind::Video,
                media_reference: item.url.clone(),
                original_filename: item.filename.clone(),
                content_type: item.content_type.clone(),
                media_items: MediaItems(vec![item.clone()]),
            })
            .await?;

        self.accept(&record, MediaSource::Video(item));
        Ok(record.job_id())
    }

    /// Create a pending job comparing 1 to 3 images and start processing it.
    pub async fn start_image_set_analysis(
        &self,
        images: Vec<MediaItem>,
    ) -> Result<JobId, JobError> {
        if images.is_empty() || images.len() > MAX_IMAGES_PER_JOB {
            return Err(JobError::invalid_field(
                "images",
                format!(
                    "between 1 and {} images are required, got {}",
                    MAX_IMAGES_PER_JOB,
                    images.len()
                ),
            ));
        }

        let images = images
            .into_iter()
            .map(|item| self.validate_item(MediaKind::Image, item, "images"))
            .collect::<Result<Vec<_>, _>>()?;

        let first = &images[0];
        let record = self
            .store
            .create(NewJob {
                media_kind: MediaKind::Image,
                media_reference: first.url.clone(),
                original_filename: first.filename.clone(),
                content_type: first.content_type.clone(),
                media_items: MediaItems(images.clone()),
            })
            .await?;

        self.accept(&record, MediaSource::Images(images));
        Ok(record.job_id())
    }

    fn accept(&self, record: &JobRecord, source: MediaSource) {
        let labels = vec![("media_kind", source.kind().to_string())];
        counter!("analysis_jobs_submitted_total", &labels).increment(1);
        self.spawn_attempt(record.job_id(), record.current_attempt(), source);
    }

    /// Run an attempt in a detached, supervised task.
    pub fn spawn_attempt(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        source: MediaSource,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.supervise(job_id, attempt_id, source).await })
    }

    /// Wait for a concurrency slot, run the attempt, and turn a panic into a failed record.
    async fn supervise(&self, job_id: JobId, attempt_id: AttemptId, source: MediaSource) {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                let queued = JobUpdate::Progress {
                    status: JobStatus::Pending,
                    status_text: STATUS_QUEUED.to_string(),
                };
                if let Err(e) = self.store.update(job_id, attempt_id, queued).await {
                    warn!(%job_id, error = %e, "Failed to record queued status");
                }
                match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.finalize_failure(job_id, attempt_id, "analysis service is shutting down")
                            .await;
                        return;
                    }
                }
            }
            Err(TryAcquireError::Closed) => {
                self.finalize_failure(job_id, attempt_id, "analysis service is shutting down")
                    .await;
                return;
            }
        };

        let span = info_span!(
            "analysis_attempt",
            job_id = %job_id,
            attempt_id = %attempt_id,
            media_kind = %source.kind()
        );
        let worker = self.clone();
        let handle = tokio::spawn(
            async move { worker.run_attempt(job_id, attempt_id, source).await }.instrument(span),
        );

        if let Err(join_error) = handle.await {
            error!(%job_id, %attempt_id, error = %join_error, "Analysis attempt aborted");
            let labels = vec![("reason", "panic".to_string())];
            counter!("analysis_jobs_failed_total", &labels).increment(1);
            self.finalize_failure(
                job_id,
                attempt_id,
                "analysis attempt aborted unexpectedly",
            )
            .await;
        }

        drop(permit);
    }

    /// Execute one attempt to a terminal write. Errors never escape; they become
    /// the record's `error_message`.
    pub async fn run_attempt(&self, job_id: JobId, attempt_id: AttemptId, source: MediaSource) {
        let started = Instant::now();
        gauge!("analysis_attempts_in_flight").increment(1.0);
        defer! {
            gauge!("analysis_attempts_in_flight").decrement(1.0);
        }

        info!(items = source.item_count(), "Analysis attempt started");

        let outcome = match &source {
            MediaSource::Video(item) => self.process_video(job_id, attempt_id, item).await,
            MediaSource::Images(items) => self.process_images(job_id, attempt_id, items).await,
        };

        let result = match outcome {
            Ok(report) => {
                let completed = JobUpdate::Completed {
                    report,
                    status_text: STATUS_COMPLETED.to_string(),
                };
                match self.store.update(job_id, attempt_id, completed).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(AttemptError::Superseded),
                    Err(e) => Err(AttemptError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        let kind_labels = vec![("media_kind", source.kind().to_string())];
        match result {
            Ok(()) => {
                counter!("analysis_jobs_completed_total", &kind_labels).increment(1);
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Analysis completed");
            }
            Err(AttemptError::Superseded) => {
                info!("Attempt no longer owns the job record; stopping");
            }
            Err(AttemptError::Failed(err)) => {
                let labels = vec![("reason", err.reason().to_string())];
                counter!("analysis_jobs_failed_total", &labels).increment(1);
                warn!(reason = err.reason(), error = %err, "Analysis attempt failed");
                self.finalize_failure(job_id, attempt_id, &err.to_string())
                    .await;
            }
        }

        histogram!("analysis_attempt_duration_seconds", &kind_labels)
            .record(started.elapsed().as_secs_f64());
    }

    async fn process_video(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        item: &MediaItem,
    ) -> Result<AnalysisReport, AttemptError> {
        self.progress(job_id, attempt_id, JobUpdate::processing(STATUS_DOWNLOADING))
            .await?;

        let transient = TransientFile {
            path: self
                .policy
                .scratch_dir
                .join(format!("{}-{}.media", job_id, attempt_id)),
        };
        let mut file = tokio::fs::File::create(transient.path())
            .await
            .map_err(|e| JobError::Transport(format!("cannot create transient file: {}", e)))?;
        let bytes = self.fetch_media(&item.url, &mut file).await?;
        file.flush()
            .await
            .map_err(|e| JobError::Transport(format!("cannot write transient file: {}", e)))?;
        drop(file);
        debug!(bytes, "Media downloaded");

        let engine_file = self
            .engine
            .ingest(transient.path(), &item.content_type, &item.filename)
            .await
            .map_err(ingest_failure)?;
        self.progress(
            job_id,
            attempt_id,
            JobUpdate::EngineFile {
                reference: engine_file.name.clone(),
                status_text: STATUS_UPLOADED.to_string(),
            },
        )
        .await?;

        self.progress(job_id, attempt_id, JobUpdate::processing(STATUS_WAITING_FOR_ENGINE))
            .await?;
        self.await_engine(&engine_file).await?;

        self.progress(job_id, attempt_id, JobUpdate::processing(STATUS_GENERATING))
            .await?;
        let prompt = build_prompt(MediaKind::Video, 1);
        let text = self
            .generate_with_retry(job_id, attempt_id, GenerateInput::File(&engine_file), &prompt)
            .await?;

        Ok(self.report(text, MediaKind::Video, 1))
    }

    async fn process_images(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        items: &[MediaItem],
    ) -> Result<AnalysisReport, AttemptError> {
        self.progress(job_id, attempt_id, JobUpdate::processing(STATUS_FETCHING_IMAGES))
            .await?;

        let mut media = Vec::with_capacity(items.len());
        for item in items {
            let mut data = Vec::new();
            self.fetch_media(&item.url, &mut data).await?;
            media.push(InlineMedia {
                mime_type: item.content_type.clone(),
                data,
            });
        }

        self.progress(job_id, attempt_id, JobUpdate::processing(STATUS_GENERATING))
            .await?;
        let prompt = build_prompt(MediaKind::Image, items.len());
        let text = self
            .generate_with_retry(job_id, attempt_id, GenerateInput::Inline(&media), &prompt)
            .await?;

        Ok(self.report(text, MediaKind::Image, items.len()))
    }

    fn report(&self, text: String, media_kind: MediaKind, item_count: usize) -> AnalysisReport {
        AnalysisReport {
            text,
            timestamp: Utc::now(),
            model_used: self.engine.model_name().to_string(),
            media_kind,
            item_count: item_count as u32,
        }
    }

    async fn progress(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        update: JobUpdate,
    ) -> Result<(), AttemptError> {
        if self.store.update(job_id, attempt_id, update).await? {
            Ok(())
        } else {
            Err(AttemptError::Superseded)
        }
    }

    /// Stream `url` into `sink`, enforcing the fetch timeout and size limit.
    async fn fetch_media<W>(&self, url: &str, sink: &mut W) -> Result<u64, JobError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let limit = self.policy.max_media_bytes;
        let download = async {
            let mut response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| JobError::Transport(format!("media fetch failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(JobError::Transport(format!(
                    "media fetch returned status {}",
                    response.status()
                )));
            }
            if response.content_length().is_some_and(|len| len > limit) {
                return Err(too_large(limit));
            }

            let mut written: u64 = 0;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| JobError::Transport(format!("media download interrupted: {}", e)))?
            {
                written += chunk.len() as u64;
                if written > limit {
                    return Err(too_large(limit));
                }
                sink.write_all(&chunk)
                    .await
                    .map_err(|e| JobError::Transport(format!("cannot buffer media: {}", e)))?;
            }
            Ok(written)
        };

        tokio::time::timeout(self.policy.fetch_timeout, download)
            .await
            .map_err(|_| {
                JobError::Transport(format!(
                    "media fetch timed out after {} seconds",
                    self.policy.fetch_timeout.as_secs()
                ))
            })?
    }

    async fn await_engine(&self, file: &EngineFileRef) -> Result<(), JobError> {
        let outcome = self
            .engine
            .await_ready(file, self.policy.ready_ceiling, self.policy.ready_interval)
            .await
            .map_err(engine_failure)?;

        match outcome {
            ReadyOutcome::Ready => Ok(()),
            ReadyOutcome::Failed(reason) => Err(JobError::EngineIngestFailure(reason)),
            ReadyOutcome::TimedOut => Err(JobError::EngineTimeout {
                ceiling_secs: self.policy.ready_ceiling.as_secs(),
            }),
        }
    }

    /// Generate once; on a rate limit wait the configured backoff and try exactly once more.
    async fn generate_with_retry(
        &self,
        job_id: JobId,
        attempt_id: AttemptId,
        input: GenerateInput<'_>,
        prompt: &str,
    ) -> Result<String, AttemptError> {
        match self.generate_once(input, prompt).await {
            Err(e) if e.is_rate_limited() => {
                counter!("analysis_engine_rate_limited_total").increment(1);
                warn!(
                    backoff_secs = self.policy.rate_limit_backoff.as_secs(),
                    "Engine rate limited generate call; retrying once"
                );
                self.progress(
                    job_id,
                    attempt_id,
                    JobUpdate::processing(format!(
                        "engine busy, retrying in {} seconds",
                        self.policy.rate_limit_backoff.as_secs()
                    )),
                )
                .await?;
                tokio::time::sleep(self.policy.rate_limit_backoff).await;
                self.progress(job_id, attempt_id, JobUpdate::processing(STATUS_GENERATING))
                    .await?;

                self.generate_once(input, prompt).await.map_err(|e| {
                    let error = if e.is_rate_limited() {
                        JobError::RateLimited(
                            "engine still rate limited after one retry".to_string(),
                        )
                    } else {
                        engine_failure(e)
                    };
                    AttemptError::Failed(error)
                })
            }
            other => other.map_err(|e| engine_failure(e).into()),
        }
    }

    async fn generate_once(
        &self,
        input: GenerateInput<'_>,
        prompt: &str,
    ) -> Result<String, EngineError> {
        match tokio::time::timeout(self.policy.generate_timeout, self.engine.generate(input, prompt))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Api {
                status: 504,
                message: format!(
                    "report generation timed out after {} seconds",
                    self.policy.generate_timeout.as_secs()
                ),
            }),
        }
    }

    /// Write the terminal failure for an attempt. Store errors are only logged.
    async fn finalize_failure(&self, job_id: JobId, attempt_id: AttemptId, message: &str) {
        match self
            .store
            .update(job_id, attempt_id, JobUpdate::failed(message))
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(%job_id, %attempt_id, "Failure not recorded; attempt no longer owns the job"),
            Err(e) => error!(%job_id, %attempt_id, error = %e, "Failed to record job failure"),
        }
    }

    /// Normalize and check one submitted media item.
    fn validate_item(
        &self,
        kind: MediaKind,
        item: MediaItem,
        url_field: &'static str,
    ) -> Result<MediaItem, JobError> {
        let item = MediaItem {
            url: item.url.trim().to_string(),
            filename: item.filename.trim().to_string(),
            content_type: item.content_type.trim().to_string(),
        };

        if item.url.is_empty() {
            return Err(JobError::invalid_field(url_field, "media URL is required"));
        }
        if item.filename.is_empty() {
            return Err(JobError::invalid_field("filename", "filename is required"));
        }
        if item.content_type.is_empty() {
            return Err(JobError::invalid_field("content_type", "content type is required"));
        }

        let url = Url::parse(&item.url).map_err(|e| {
            JobError::invalid_field(url_field, format!("media URL is invalid: {}", e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(JobError::invalid_field(
                url_field,
                "media URL must use http or https",
            ));
        }
        if let Some(origin) = &self.media_origin
            && url.origin() != origin.origin()
        {
            return Err(JobError::invalid_field(
                url_field,
                "media URL must point at the configured media storage",
            ));
        }

        if !kind.accepts_content_type(&item.content_type) {
            return Err(JobError::invalid_field(
                "content_type",
                format!(
                    "content type '{}' is not a {} type",
                    item.content_type,
                    kind.as_str()
                ),
            ));
        }

        Ok(item)
    }
}

fn too_large(limit: u64) -> JobError {
    JobError::Transport(format!("media exceeds the {} byte limit", limit))
}

fn engine_failure(error: EngineError) -> JobError {
    match error {
        EngineError::RateLimited { .. } => JobError::RateLimited(error.to_string()),
        other => JobError::Transport(other.to_string()),
    }
}

/// The engine answering the upload with an error status rejected the media itself.
fn ingest_failure(error: EngineError) -> JobError {
    match error {
        EngineError::Api { status, message } => {
            JobError::EngineIngestFailure(format!("status {}: {}", status, message))
        }
        other => engine_failure(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::analysis_job::Model;

    fn record(kind: MediaKind, items: Vec<MediaItem>) -> Model {
        let now = Utc::now().fixed_offset();
        Model {
            id: uuid::Uuid::new_v4(),
            attempt_id: uuid::Uuid::new_v4(),
            attempts: 1,
            status: JobStatus::Failed,
            status_text: String::new(),
            error_message: Some("x".to_string()),
            media_kind: kind,
            media_reference: "https://m.test/a".to_string(),
            media_items: MediaItems(items),
            original_filename: "a".to_string(),
            content_type: "video/mp4".to_string(),
            engine_file_reference: None,
            report: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_media_source_from_record() {
        let video = record(MediaKind::Video, Vec::new());
        assert_eq!(
            MediaSource::from_record(&video),
            Some(MediaSource::Video(MediaItem {
                url: "https://m.test/a".to_string(),
                filename: "a".to_string(),
                content_type: "video/mp4".to_string(),
            }))
        );

        let images = record(MediaKind::Image, Vec::new());
        assert_eq!(MediaSource::from_record(&images), None);
    }

    #[test]
    fn test_policy_from_config() {
        let policy = AttemptPolicy::default();
        assert_eq!(policy.ready_ceiling, Duration::from_secs(300));
        assert_eq!(policy.ready_interval, Duration::from_secs(10));
        assert_eq!(policy.rate_limit_backoff, Duration::from_secs(30));
        assert_eq!(policy.max_concurrent, 8);
    }

    #[test]
    fn test_engine_failure_mapping() {
        assert!(matches!(
            engine_failure(EngineError::RateLimited {
                retry_after_secs: None
            }),
            JobError::RateLimited(_)
        ));
        assert!(matches!(
            engine_failure(EngineError::EmptyResponse),
            JobError::Transport(_)
        ));
    }

    #[test]
    fn test_ingest_failure_mapping() {
        match ingest_failure(EngineError::Api {
            status: 400,
            message: "unsupported mime type".to_string(),
        }) {
            JobError::EngineIngestFailure(message) => {
                assert_eq!(message, "status 400: unsupported mime type")
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
        assert!(matches!(
            ingest_failure(EngineError::RateLimited {
                retry_after_secs: Some(5)
            }),
            JobError::RateLimited(_)
        ));
        assert!(matches!(
            ingest_failure(EngineError::MalformedResponse("no upload url".to_string())),
            JobError::Transport(_)
        ));
    }
}
