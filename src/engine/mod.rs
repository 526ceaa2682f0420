//! # Analysis Engine
//!
//! Seam to the external generative engine: ingest a media file, probe its
//! processing state, and generate a report from either an ingested file or
//! inline media parts.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep};

pub mod gemini;
pub mod prompt;

pub use gemini::GeminiEngine;

/// Handle to a file the engine has ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFileRef {
    /// Engine-side resource name, persisted on the job record
    pub name: String,
    /// URI used to reference the file in generate calls
    pub uri: String,
    pub mime_type: String,
}

/// Processing state reported for an ingested file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestState {
    Processing,
    Active,
    Failed(String),
}

/// Result of waiting for an ingested file to become usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    Ready,
    Failed(String),
    TimedOut,
}

/// Media sent inline with a generate call.
#[derive(Debug, Clone)]
pub struct InlineMedia {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Content a report is generated from.
#[derive(Debug, Clone, Copy)]
pub enum GenerateInput<'a> {
    File(&'a EngineFileRef),
    Inline(&'a [InlineMedia]),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine rate limit exceeded")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("engine request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("engine network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to read media for upload: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed engine response: {0}")]
    MalformedResponse(String),

    #[error("engine returned no report text")]
    EmptyResponse,
}

impl EngineError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, EngineError::RateLimited { .. })
    }
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    /// Model identifier recorded in reports.
    fn model_name(&self) -> &str;

    /// Upload a local media file to the engine.
    async fn ingest(
        &self,
        media: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<EngineFileRef, EngineError>;

    async fn file_state(&self, file: &EngineFileRef) -> Result<IngestState, EngineError>;

    /// Probe `file` every `interval` until it is active, failed, or `ceiling` elapses.
    async fn await_ready(
        &self,
        file: &EngineFileRef,
        ceiling: Duration,
        interval: Duration,
    ) -> Result<ReadyOutcome, EngineError> {
        let deadline = Instant::now() + ceiling;

        loop {
            match self.file_state(file).await? {
                IngestState::Active => return Ok(ReadyOutcome::Ready),
                IngestState::Failed(reason) => return Ok(ReadyOutcome::Failed(reason)),
                IngestState::Processing => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadyOutcome::TimedOut);
            }
            sleep(interval.min(deadline - now)).await;
        }
    }

    /// Generate report text. Returns [`EngineError::RateLimited`] when throttled.
    async fn generate(&self, input: GenerateInput<'_>, prompt: &str)
    -> Result<String, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct SequenceEngine {
        states: Mutex<Vec<IngestState>>,
    }

    #[async_trait]
    impl AnalysisEngine for SequenceEngine {
        fn model_name(&self) -> &str {
            "sequence"
        }

        async fn ingest(
            &self,
            _media: &Path,
            _mime_type: &str,
            _display_name: &str,
        ) -> Result<EngineFileRef, EngineError> {
            unreachable!("not used")
        }

        async fn file_state(&self, _file: &EngineFileRef) -> Result<IngestState, EngineError> {
            let mut states = self.states.lock().unwrap();
            Ok(if states.len() > 1 {
                states.remove(0)
            } else {
                states[0].clone()
            })
        }

        async fn generate(
            &self,
            _input: GenerateInput<'_>,
            _prompt: &str,
        ) -> Result<String, EngineError> {
            unreachable!("not used")
        }
    }

    fn file() -> EngineFileRef {
        EngineFileRef {
            name: "files/x".to_string(),
            uri: "mem://files/x".to_string(),
            mime_type: "video/mp4".to_string(),
        }
    }

    #[tokio::test]
    async fn test_await_ready_after_processing() {
        let engine = SequenceEngine {
            states: Mutex::new(vec![
                IngestState::Processing,
                IngestState::Processing,
                IngestState::Active,
            ]),
        };

        let outcome = engine
            .await_ready(&file(), Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(outcome, ReadyOutcome::Ready);
    }

    #[tokio::test]
    async fn test_await_ready_reports_failure() {
        let engine = SequenceEngine {
            states: Mutex::new(vec![IngestState::Failed("codec".to_string())]),
        };

        let outcome = engine
            .await_ready(&file(), Duration::from_secs(1), Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(outcome, ReadyOutcome::Failed("codec".to_string()));
    }

    #[tokio::test]
    async fn test_await_ready_times_out() {
        let engine = SequenceEngine {
            states: Mutex::new(vec![IngestState::Processing]),
        };

        let started = std::time::Instant::now();
        let outcome = engine
            .await_ready(&file(), Duration::from_millis(40), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome, ReadyOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
