//! # Data Models
//!
//! This module contains the data models used throughout the analysis service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod analysis_job;

pub use analysis_job::Entity as AnalysisJob;
pub use analysis_job::{
    AnalysisReport, AttemptId, JobId, JobState, JobStatus, MediaItem, MediaItems, MediaKind,
};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "posture-analysis".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
