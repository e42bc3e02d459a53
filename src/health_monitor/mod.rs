//! Health Monitor
//!
//! ## Responsibilities
//!
//! - Run a registry of independent component checks on a fixed interval
//! - Bound every check with a timeout and isolate its failures
//! - Persist each result to the append-only health log as soon as it exists
//! - Aggregate results into a node-level status (worst wins)
//! - Defer monitoring until the capture/inference pipeline is ready (bounded wait)

pub mod checks;
pub mod service;
pub mod types;

pub use checks::{standard_checks, CheckDeps, HealthCheck};
pub use service::HealthMonitor;
pub use types::{
    aggregate, AggregatedHealth, CheckOutcome, CheckResult, HealthMonitorConfig, OverallStatus,
};
