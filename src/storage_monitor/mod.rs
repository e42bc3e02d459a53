//! Storage Monitor
//!
//! ## Responsibilities
//!
//! - Keep the capture volume above the minimum free space
//! - Enforce the retention period on capture files
//! - Prefer deleting files whose records were delivered (joined via the record store)
//! - Publish a storage status snapshot and the last cleanup summary
//!
//! Capture files are matched to detection records by their full path, as
//! written to `annotated_image_path` by the inference pipeline.

pub mod service;
pub mod space;
pub mod types;

pub use service::{order_candidates, scan_capture_dir, StorageMonitor};
pub use space::{DiskSpace, SpaceProbe, SysinfoSpaceProbe};
pub use types::{
    CaptureFile, CleanupSummary, CleanupTrigger, FileError, StorageMonitorConfig, StorageStatus,
};
