//! # Media Storage
//!
//! Object storage seam. The service hands clients a short-lived write URL plus
//! the stable read URL the object will be reachable at; clients upload bytes
//! directly with [`upload::put_object`].

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::MediaKind;

pub mod s3;
pub mod upload;

pub use s3::S3MediaStore;
pub use upload::{UploadOptions, UploadProgress, put_object};

static RE_UNSAFE_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid filename regex"));

const MAX_FILENAME_CHARS: usize = 100;

/// Where a client writes an object and where it can be read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WriteTarget {
    /// Presigned URL accepting a single PUT of the object bytes
    pub write_url: String,
    /// Stable URL the object is readable from once uploaded
    pub read_url: String,
    pub expires_in_seconds: u64,
    #[schema(example = "videos/2026/10/16/6f1c...-squat.mp4")]
    pub object_key: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("unsupported content type '{0}'; expected video/* or image/*")]
    UnsupportedContentType(String),

    #[error("storage is not configured: {0}")]
    NotConfigured(String),

    #[error("failed to presign upload: {0}")]
    Presign(String),

    #[error("upload rejected with status {status}: {body}")]
    UploadRejected { status: u16, body: String },

    #[error("upload failed after {attempts} attempts: {message}")]
    UploadFailed { attempts: u32, message: String },

    #[error("storage network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn create_write_target(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<WriteTarget, StorageError>;
}

/// Media kind implied by a content type, if it is one the service accepts.
pub fn media_kind_for(content_type: &str) -> Option<MediaKind> {
    [MediaKind::Video, MediaKind::Image]
        .into_iter()
        .find(|kind| kind.accepts_content_type(content_type))
}

/// Replace characters outside `[A-Za-z0-9._-]` and bound the length.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned = RE_UNSAFE_FILENAME_CHARS.replace_all(filename.trim(), "_");
    let cleaned: String = cleaned
        .trim_matches(|c| c == '_' || c == '.')
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect();

    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// `{videos|images}/YYYY/MM/DD/{uuid}-{filename}`
pub fn object_key(kind: MediaKind, filename: &str, now: DateTime<Utc>) -> String {
    let prefix = match kind {
        MediaKind::Video => "videos",
        MediaKind::Image => "images",
    };
    format!(
        "{}/{}/{}-{}",
        prefix,
        now.format("%Y/%m/%d"),
        Uuid::new_v4().simple(),
        sanitize_filename(filename)
    )
}
