//! Gemini-style REST engine adapter.
//!
//! Files are uploaded through the resumable upload protocol, probed via the
//! files resource and referenced from `generateContent` calls.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Body, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use super::{AnalysisEngine, EngineError, EngineFileRef, GenerateInput, IngestState};
use crate::config::EngineConfig;

/// Default Retry-After hint when the engine omits one
const DEFAULT_RETRY_AFTER_SECS: u64 = 30;
/// Longest error body kept in error messages
const ERROR_SNIPPET_CHARS: usize = 300;

pub struct GeminiEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
    generate_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<FileError>,
}

#[derive(Debug, Deserialize)]
struct FileError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    file: FileResource,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GeminiEngine {
    pub fn new(client: reqwest::Client, config: &EngineConfig, generate_timeout: Duration) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            request_timeout: config.request_timeout(),
            generate_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn start_upload(
        &self,
        length: u64,
        mime_type: &str,
        display_name: &str,
    ) -> Result<String, EngineError> {
        let response = self
            .client
            .post(self.url("upload/v1beta/files"))
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.request_timeout)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", length.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await?;

        let response = check_status(response).await?;

        response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| EngineError::MalformedResponse("missing upload URL".to_string()))
    }
}

#[async_trait]
impl AnalysisEngine for GeminiEngine {
    fn model_name(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, media))]
    async fn ingest(
        &self,
        media: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<EngineFileRef, EngineError> {
        let file = tokio::fs::File::open(media).await?;
        let length = file.metadata().await?.len();

        let upload_url = self.start_upload(length, mime_type, display_name).await?;

        // Upload timeout scales with the payload: 1 s per MiB on top of the base.
        let upload_timeout = self.request_timeout + Duration::from_secs(length / (1024 * 1024));

        let response = self
            .client
            .post(upload_url)
            .timeout(upload_timeout)
            .header("Content-Length", length.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;

        let uploaded: UploadResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

        debug!(name = %uploaded.file.name, bytes = length, "Media ingested by engine");

        Ok(EngineFileRef {
            mime_type: if uploaded.file.mime_type.is_empty() {
                mime_type.to_string()
            } else {
                uploaded.file.mime_type
            },
            name: uploaded.file.name,
            uri: uploaded.file.uri,
        })
    }

    async fn file_state(&self, file: &EngineFileRef) -> Result<IngestState, EngineError> {
        let response = self
            .client
            .get(self.url(&format!("v1beta/{}", file.name)))
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.request_timeout)
            .send()
            .await?;

        let resource: FileResource = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

        Ok(match resource.state.as_deref() {
            Some("ACTIVE") => IngestState::Active,
            Some("FAILED") => IngestState::Failed(
                resource
                    .error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "engine could not process the file".to_string()),
            ),
            _ => IngestState::Processing,
        })
    }

    #[instrument(skip(self, input, prompt))]
    async fn generate(
        &self,
        input: GenerateInput<'_>,
        prompt: &str,
    ) -> Result<String, EngineError> {
        let mut parts: Vec<Value> = match input {
            GenerateInput::File(file) => vec![json!({
                "file_data": { "mime_type": file.mime_type, "file_uri": file.uri }
            })],
            GenerateInput::Inline(media) => media
                .iter()
                .map(|item| {
                    json!({
                        "inline_data": {
                            "mime_type": item.mime_type,
                            "data": STANDARD.encode(&item.data),
                        }
                    })
                })
                .collect(),
        };
        parts.push(json!({ "text": prompt }));

        let response = self
            .client
            .post(self.url(&format!("v1beta/models/{}:generateContent", self.model)))
            .query(&[("key", self.api_key.as_str())])
            .timeout(self.generate_timeout)
            .json(&json!({ "contents": [{ "role": "user", "parts": parts }] }))
            .send()
            .await?;

        let body: GenerateResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::MalformedResponse(e.to_string()))?;

        let text: String = body
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");

        if text.trim().is_empty() {
            return Err(EngineError::EmptyResponse);
        }

        Ok(text)
    }
}

/// Map non-success responses into [`EngineError`].
async fn check_status(response: Response) -> Result<Response, EngineError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
        warn!(retry_after, "Engine rate limited request");
        return Err(EngineError::RateLimited {
            retry_after_secs: Some(retry_after),
        });
    }

    let body = response.text().await.unwrap_or_default();
    let message: String = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or(body)
        .chars()
        .take(ERROR_SNIPPET_CHARS)
        .collect();

    Err(EngineError::Api {
        status: status.as_u16(),
        message,
    })
}
