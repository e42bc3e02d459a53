//! Checkpoint Edge Library
//!
//! Node-local services of an edge checkpoint device running next to a
//! capture/inference pipeline.
//!
//! ## Architecture
//!
//! 1. RecordStore - SSoT for detection records, health log and delivery cursors
//! 2. HealthMonitor - periodic component checks with an append-only log
//! 3. Dispatcher - delivers records to the central collector (WebSocket, HTTP fallback, offline)
//! 4. StorageMonitor - free-space and retention cleanup of capture files
//! 5. Startup - dependency-ordered bring-up and shutdown
//! 6. WebAPI - read-only status endpoints
//!
//! ## Design Principles
//!
//! - SSoT: RecordStore is the single source of truth shared by all loops
//! - A record is marked sent only after the collector acknowledged it
//! - No network failure ever aborts the process

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health_monitor;
pub mod models;
pub mod readiness;
pub mod record_store;
pub mod startup;
pub mod state;
pub mod storage_monitor;
pub mod web_api;
pub mod worker;

pub use error::{Error, Result};
pub use state::AppState;
