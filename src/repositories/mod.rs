//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations behind the
//! store interfaces the job lifecycle depends on.

pub mod analysis_job;

pub use analysis_job::{AnalysisJobRepository, JobStore, JobUpdate, NewJob};
