//! # API Client
//!
//! Thin reqwest client for the service's own HTTP API, covering the whole
//! client flow: request an upload target, PUT the bytes directly to storage,
//! submit the analysis and poll its status with [`poller::JobPoller`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::handlers::types::{
    CreateUploadRequest, JobAccepted, JobStatusResponse, JobSummary, JobsResponse, RetryRequest,
    SubmitImagesRequest, SubmitVideoRequest,
};
use crate::models::{JobId, MediaItem};
use crate::retry::RetryAccepted;
use crate::storage::upload::ProgressCallback;
use crate::storage::{StorageError, UploadOptions, WriteTarget, put_object};

pub mod poller;

pub use poller::{JobPoller, PollError, PollOutcome, PollerConfig, StatusSource};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API returned {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("direct upload failed: {0}")]
    Upload(#[from] StorageError),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Network(e) => e.status().map(|s| s.as_u16()),
            ClientError::Upload(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn request_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<WriteTarget, ClientError> {
        let response = self
            .http
            .post(self.url("/uploads"))
            .json(&CreateUploadRequest {
                filename: filename.to_string(),
                content_type: content_type.to_string(),
            })
            .send()
            .await?;
        decode(response).await
    }

    /// PUT `data` to the presigned target, reporting progress through `on_progress`.
    pub async fn upload_media(
        &self,
        target: &WriteTarget,
        data: Vec<u8>,
        content_type: &str,
        options: &UploadOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), ClientError> {
        debug!(object_key = %target.object_key, bytes = data.len(), "Uploading media");
        put_object(
            &self.http,
            &target.write_url,
            data,
            content_type,
            options,
            on_progress,
        )
        .await?;
        Ok(())
    }

    pub async fn submit_video(&self, request: &SubmitVideoRequest) -> Result<JobId, ClientError> {
        let response = self
            .http
            .post(self.url("/analyses/video"))
            .json(request)
            .send()
            .await?;
        let accepted: JobAccepted = decode(response).await?;
        Ok(accepted.job_id)
    }

    pub async fn submit_images(&self, images: Vec<MediaItem>) -> Result<JobId, ClientError> {
        let response = self
            .http
            .post(self.url("/analyses/images"))
            .json(&SubmitImagesRequest { images })
            .send()
            .await?;
        let accepted: JobAccepted = decode(response).await?;
        Ok(accepted.job_id)
    }

    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusResponse, ClientError> {
        let response = self
            .http
            .get(self.url("/jobs/status"))
            .query(&[("job_id", job_id.to_string())])
            .send()
            .await?;
        decode(response).await
    }

    pub async fn retry(&self, job_id: JobId) -> Result<RetryAccepted, ClientError> {
        let response = self
            .http
            .post(self.url("/jobs/retry"))
            .json(&RetryRequest {
                job_id: Some(job_id.to_string()),
            })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn recent_jobs(&self, limit: Option<u64>) -> Result<Vec<JobSummary>, ClientError> {
        let mut request = self.http.get(self.url("/jobs"));
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }
        let jobs: JobsResponse = decode(request.send().await?).await?;
        Ok(jobs.jobs)
    }
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn read_status(&self, job_id: JobId) -> Result<JobStatusResponse, ClientError> {
        self.job_status(job_id).await
    }
}

/// Decode a success body, or turn a problem+json body into [`ClientError::Api`].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let problem: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
    let field = |name: &str| problem.get(name).and_then(|v| v.as_str()).map(str::to_string);

    Err(ClientError::Api {
        status: status.as_u16(),
        code: field("code").unwrap_or_else(|| default_code(status)),
        message: field("message").unwrap_or(body),
    })
}

fn default_code(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("UNKNOWN")
        .to_ascii_uppercase()
        .replace(' ', "_")
}
