//! Record Store type definitions
//!
//! ## 概要
//! detection_records / health_check_logs / dispatch_cursors の行型と列挙型

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-width UTC timestamp format; lexical order equals chronological order
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

// ============================================================
// Detection Records
// ============================================================

/// Recognized plate text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateText {
    pub text: String,
    pub confidence: f32,
}

/// Bounding box of a detected object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// One inference result awaiting (or past) delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub device_id: String,
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub vehicle_count: i32,
    pub plate_count: i32,
    pub plate_texts: Vec<PlateText>,
    pub detections: Vec<BoundingBox>,
    pub annotated_image_path: Option<String>,
    pub processing_ms: Option<i32>,
    /// Delivery flag; only the dispatcher sets it
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DetectionRecord {
    /// Payload portion forwarded to the collector
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "record_id": self.id,
            "created_at": format_ts(&self.created_at),
            "vehicle_count": self.vehicle_count,
            "plate_count": self.plate_count,
            "plate_texts": self.plate_texts,
            "detections": self.detections,
            "annotated_image_path": self.annotated_image_path,
            "processing_ms": self.processing_ms,
        })
    }
}

/// Insert request produced by the inference pipeline
#[derive(Debug, Clone, Default)]
pub struct DetectionInsert {
    pub device_id: String,
    pub checkpoint_id: String,
    /// Defaults to now
    pub created_at: Option<DateTime<Utc>>,
    pub vehicle_count: i32,
    pub plate_texts: Vec<PlateText>,
    pub detections: Vec<BoundingBox>,
    pub annotated_image_path: Option<String>,
    pub processing_ms: Option<i32>,
}

// ============================================================
// Health Check Logs
// ============================================================

/// Health check result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Warning,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warning => "WARNING",
            Self::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strict parse for operator input; unknown values are an error
impl std::str::FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PASS" => Ok(Self::Pass),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("unknown check status '{}'", s)),
        }
    }
}

/// Lenient read of stored rows: anything unrecognised counts as a failure
impl From<&str> for CheckStatus {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "PASS" => Self::Pass,
            "WARNING" | "WARN" => Self::Warning,
            _ => Self::Fail,
        }
    }
}

/// Monitored component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthComponent {
    Camera,
    Disk,
    CpuRam,
    Models,
    Ocr,
    Database,
    Network,
    Other(String),
}

impl HealthComponent {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Camera => "camera",
            Self::Disk => "disk",
            Self::CpuRam => "cpu_ram",
            Self::Models => "models",
            Self::Ocr => "ocr",
            Self::Database => "database",
            Self::Network => "network",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl std::fmt::Display for HealthComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for HealthComponent {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "camera" => Self::Camera,
            "disk" => Self::Disk,
            "cpu_ram" | "cpu" | "ram" => Self::CpuRam,
            "models" => Self::Models,
            "ocr" => Self::Ocr,
            "database" | "db" => Self::Database,
            "network" => Self::Network,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Append-only health log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub component: HealthComponent,
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HealthCheckLogEntry {
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "log_id": self.id,
            "timestamp": format_ts(&self.timestamp),
            "component": self.component.as_str(),
            "status": self.status.as_str(),
            "message": self.message,
            "details": self.details,
        })
    }
}

/// Insert request for a health log entry
#[derive(Debug, Clone)]
pub struct HealthCheckInsert {
    pub timestamp: DateTime<Utc>,
    pub component: HealthComponent,
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

/// Health log query filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogFilter {
    pub component: Option<String>,
    pub status: Option<CheckStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// One page of health logs (newest first)
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub items: Vec<HealthCheckLogEntry>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

impl LogPage {
    pub fn total_pages(&self) -> i64 {
        if self.limit == 0 {
            return 0;
        }
        (self.total + self.limit as i64 - 1) / self.limit as i64
    }
}

// ============================================================
// Dispatch Cursors
// ============================================================

/// Stream identifiers used for per-stream delivery bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Detection,
    Health,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detection => "detection",
            Self::Health => "health",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
