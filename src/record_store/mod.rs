//! Record Store
//!
//! ## Responsibilities
//!
//! - Detection records produced by the inference pipeline (with delivery flag)
//! - Append-only health check log written by the Health Monitor
//! - Per-stream delivery cursors kept by the Communication Dispatcher
//!
//! The store is the single source of truth shared by all loops. Components
//! receive a cloned `RecordStore` handle at construction.

pub mod repository;
pub mod schema;
pub mod types;

pub use repository::{RecordStore, MAX_PAGE_LIMIT};
pub use types::{
    format_ts, parse_ts, BoundingBox, CheckStatus, DetectionInsert, DetectionRecord,
    HealthCheckInsert, HealthCheckLogEntry, HealthComponent, LogFilter, LogPage, PlateText,
    StreamKind,
};
