//! # Posture Analysis Library
//!
//! Core of the posture analysis service: job records and their store, the
//! background orchestrator driving the analysis engine, retries, object
//! storage upload targets, the HTTP API and a small client with a status
//! poller.

pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod repositories;
pub mod retry;
pub mod server;
pub mod storage;
pub mod telemetry;
pub use migration;
