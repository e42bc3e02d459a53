//! Storage Monitor type definitions

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Storage retention configuration
#[derive(Debug, Clone)]
pub struct StorageMonitorConfig {
    /// Annotated capture images written by the inference pipeline
    pub capture_dir: PathBuf,
    pub min_free_space_gb: f64,
    pub retention_days: u32,
    /// Files deleted between free-space re-checks
    pub batch_size: usize,
    pub interval: Duration,
    /// Files modified more recently than this are treated as still open
    pub in_use_grace: Duration,
}

impl StorageMonitorConfig {
    pub fn min_free_bytes(&self) -> u64 {
        (self.min_free_space_gb * BYTES_PER_GB) as u64
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days as u64 * 24 * 60 * 60)
    }
}

impl Default for StorageMonitorConfig {
    fn default() -> Self {
        Self {
            capture_dir: PathBuf::from("/var/lib/checkpoint/captures"),
            min_free_space_gb: 2.0,
            retention_days: 30,
            batch_size: 50,
            interval: Duration::from_secs(300),
            in_use_grace: Duration::from_secs(30),
        }
    }
}

/// A file found under the capture directory
#[derive(Debug, Clone)]
pub struct CaptureFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    /// Joined from the record store; files without a record count as sent
    pub sent: bool,
}

impl CaptureFile {
    pub fn key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Why a reconcile pass deleted anything
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTrigger {
    None,
    LowSpace,
    Retention,
    LowSpaceAndRetention,
}

impl CleanupTrigger {
    pub fn from_conditions(low_space: bool, expired: bool) -> Self {
        match (low_space, expired) {
            (false, false) => Self::None,
            (true, false) => Self::LowSpace,
            (false, true) => Self::Retention,
            (true, true) => Self::LowSpaceAndRetention,
        }
    }
}

/// Per-file deletion failure (non-fatal)
#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub path: String,
    pub error: String,
}

/// Result of one reconcile pass
#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    pub trigger: CleanupTrigger,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub sent_deleted: usize,
    pub sent_bytes_freed: u64,
    pub unsent_deleted: usize,
    pub unsent_bytes_freed: u64,
    /// Already gone when deletion was attempted (counted as success)
    pub already_missing: usize,
    /// Recently modified, left for a later pass
    pub skipped_in_use: usize,
    pub errors: Vec<FileError>,
    /// Free space condition still violated after the pass
    pub still_low_on_space: bool,
}

impl CleanupSummary {
    pub fn new(trigger: CleanupTrigger) -> Self {
        Self {
            trigger,
            started_at: Utc::now(),
            duration_ms: 0,
            files_deleted: 0,
            bytes_freed: 0,
            sent_deleted: 0,
            sent_bytes_freed: 0,
            unsent_deleted: 0,
            unsent_bytes_freed: 0,
            already_missing: 0,
            skipped_in_use: 0,
            errors: Vec::new(),
            still_low_on_space: false,
        }
    }

    pub fn record_deleted(&mut self, file: &CaptureFile) {
        self.files_deleted += 1;
        self.bytes_freed += file.size;
        if file.sent {
            self.sent_deleted += 1;
            self.sent_bytes_freed += file.size;
        } else {
            self.unsent_deleted += 1;
            self.unsent_bytes_freed += file.size;
        }
    }
}

/// Derived each cycle; never persisted
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub capture_dir: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub min_free_bytes: u64,
    pub capture_bytes: u64,
    pub file_count: usize,
    pub sent_files: usize,
    pub unsent_files: usize,
    pub oldest_file_at: Option<DateTime<Utc>>,
    pub newest_file_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

impl StorageStatus {
    pub fn is_low_on_space(&self) -> bool {
        self.free_bytes < self.min_free_bytes
    }
}
