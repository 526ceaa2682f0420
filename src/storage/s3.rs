//! S3-compatible media store issuing presigned PUT URLs through the AWS SDK.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region, RequestChecksumCalculation};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use chrono::Utc;
use tracing::debug;
use url::Url;

use super::{MediaStore, StorageError, WriteTarget, media_kind_for, object_key};
use crate::config::StorageConfig;

pub struct S3MediaStore {
    client: Client,
    bucket: String,
    /// Base URL objects live under, bucket included
    object_base: Url,
    public_base: Option<Url>,
    expires_in_seconds: u64,
}

impl S3MediaStore {
    /// Builds the store from `config`. Static keys are used when configured,
    /// otherwise credentials come from the default AWS provider chain.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, StorageError> {
        let bucket = config.bucket.trim();
        if bucket.is_empty() {
            return Err(StorageError::NotConfigured("bucket missing".to_string()));
        }

        let endpoint = config
            .endpoint
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| StorageError::NotConfigured(e.to_string()))?;
        let public_base = config
            .public_base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| StorageError::NotConfigured(e.to_string()))?;

        let region = Region::new(config.region.clone());
        let mut builder = match (&config.access_key_id, &config.secret_access_key) {
            (Some(access_key_id), Some(secret_access_key)) => {
                let credentials = Credentials::new(
                    access_key_id,
                    secret_access_key,
                    config.session_token.clone(),
                    None,
                    "posture-analysis",
                );
                aws_sdk_s3::Config::builder()
                    .credentials_provider(credentials)
                    .region(region)
                    .behavior_version_latest()
            }
            (None, None) => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
            _ => {
                return Err(StorageError::NotConfigured(
                    "access key id and secret access key must be set together".to_string(),
                ));
            }
        };

        // Checksums would be baked into the presigned URL for an empty body
        builder = builder
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .force_path_style(config.path_style);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint.as_str().trim_end_matches('/'));
        }

        let object_base = object_base(bucket, &config.region, endpoint.as_ref(), config.path_style)?;

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
            object_base,
            public_base,
            expires_in_seconds: config.presign_expiry_seconds,
        })
    }

    /// URL the object is publicly readable from.
    pub fn read_url(&self, key: &str) -> String {
        let mut url = self.public_base.clone().unwrap_or_else(|| self.object_base.clone());
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(key.split('/'));
        }
        url.into()
    }

    /// Presigned PUT for `key`, signed as of `start_time`. The uploader must
    /// send the same `content_type`.
    pub async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        start_time: SystemTime,
    ) -> Result<String, StorageError> {
        let presigning = PresigningConfig::builder()
            .start_time(start_time)
            .expires_in(Duration::from_secs(self.expires_in_seconds))
            .build()
            .map_err(|e| StorageError::Presign(e.to_string()))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::Presign(DisplayErrorContext(&e).to_string()))?;

        Ok(request.uri().to_string())
    }
}

/// Where objects of `bucket` are addressed when no public base is configured.
fn object_base(
    bucket: &str,
    region: &str,
    endpoint: Option<&Url>,
    path_style: bool,
) -> Result<Url, StorageError> {
    let raw = match endpoint {
        Some(endpoint) if path_style => {
            format!("{}/{}", endpoint.as_str().trim_end_matches('/'), bucket)
        }
        Some(endpoint) => {
            let authority = match (endpoint.host_str(), endpoint.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => {
                    return Err(StorageError::NotConfigured(format!(
                        "endpoint '{}' has no host",
                        endpoint
                    )));
                }
            };
            format!("{}://{}.{}", endpoint.scheme(), bucket, authority)
        }
        None if path_style => format!("https://s3.{}.amazonaws.com/{}", region, bucket),
        None => format!("https://{}.s3.{}.amazonaws.com", bucket, region),
    };
    Url::parse(&raw).map_err(|e| StorageError::NotConfigured(e.to_string()))
}

#[async_trait]
impl MediaStore for S3MediaStore {
    async fn create_write_target(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<WriteTarget, StorageError> {
        let kind = media_kind_for(content_type)
            .ok_or_else(|| StorageError::UnsupportedContentType(content_type.to_string()))?;
        let key = object_key(kind, filename, Utc::now());

        debug!(object_key = %key, media_kind = %kind, "Issuing presigned write URL");

        Ok(WriteTarget {
            write_url: self.presign_put(&key, content_type, SystemTime::now()).await?,
            read_url: self.read_url(&key),
            expires_in_seconds: self.expires_in_seconds,
            object_key: key,
        })
    }
}
