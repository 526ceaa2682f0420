//! Direct PUT of object bytes to a presigned write URL.
//!
//! The body is streamed in chunks so progress can be reported as bytes leave
//! the client. Server errors and network failures are retried with doubling
//! backoff; client errors are returned immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream;
use reqwest::{Body, header::CONTENT_LENGTH, header::CONTENT_TYPE};
use tracing::{debug, warn};

use super::StorageError;

/// Snapshot of an in-flight upload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub speed_bytes_per_sec: f64,
    /// Estimated seconds remaining, unknown until some bytes were sent
    pub eta_seconds: Option<f64>,
}

pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub chunk_size: usize,
    pub initial_backoff: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_retries: 3,
            chunk_size: 256 * 1024,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

struct ProgressTracker {
    total: u64,
    started: Instant,
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    fn report(&self, loaded: u64) {
        let Some(callback) = &self.callback else {
            return;
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            loaded as f64 / elapsed
        } else {
            0.0
        };
        let percentage = if self.total == 0 {
            100.0
        } else {
            loaded as f64 * 100.0 / self.total as f64
        };
        let eta_seconds = (speed > 0.0).then(|| (self.total - loaded) as f64 / speed);

        callback(UploadProgress {
            loaded,
            total: self.total,
            percentage,
            speed_bytes_per_sec: speed,
            eta_seconds,
        });
    }
}

/// Upload `data` with a single PUT per attempt, reporting progress through `on_progress`.
pub async fn put_object(
    client: &reqwest::Client,
    write_url: &str,
    data: Vec<u8>,
    content_type: &str,
    options: &UploadOptions,
    on_progress: Option<ProgressCallback>,
) -> Result<(), StorageError> {
    let data: Arc<[u8]> = data.into();
    let total = data.len() as u64;
    let attempts = options.max_retries + 1;
    let mut backoff = options.initial_backoff;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        let tracker = Arc::new(ProgressTracker {
            total,
            started: Instant::now(),
            callback: on_progress.clone(),
        });

        let result = client
            .put(write_url)
            .timeout(options.timeout)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, total)
            .body(chunked_body(data.clone(), options.chunk_size.max(1), tracker.clone()))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                // An empty body yields no chunks to report from
                if total == 0 {
                    tracker.report(0);
                }
                debug!(attempt, bytes = total, "Object upload completed");
                return Ok(());
            }
            Ok(response) if response.status().is_client_error() => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(StorageError::UploadRejected { status, body });
            }
            Ok(response) => {
                last_error = format!("storage responded with status {}", response.status());
            }
            Err(err) => {
                last_error = if err.is_timeout() {
                    format!("upload timed out after {:?}", options.timeout)
                } else {
                    err.to_string()
                };
            }
        }

        if attempt < attempts {
            warn!(attempt, error = %last_error, retry_in_ms = backoff.as_millis() as u64, "Object upload attempt failed");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    Err(StorageError::UploadFailed {
        attempts,
        message: last_error,
    })
}

fn chunked_body(data: Arc<[u8]>, chunk_size: usize, tracker: Arc<ProgressTracker>) -> Body {
    let chunks = stream::unfold(0usize, move |offset| {
        let data = data.clone();
        let tracker = tracker.clone();
        async move {
            if offset >= data.len() {
                return None;
            }
            let end = (offset + chunk_size).min(data.len());
            tracker.report(end as u64);
            Some((Ok::<_, std::io::Error>(data[offset..end].to_vec()), end))
        }
    });
    Body::wrap_stream(chunks)
}
