//! Application configuration
//!
//! ## Responsibilities
//!
//! - Read the process environment exactly once at startup
//! - Validate every value eagerly; malformed settings abort startup with `Error::Config`
//! - Hand each component its own typed sub-config (no component reads env vars itself)
//!
//! A blank or missing `COLLECTOR_URL` is a valid configuration: the node runs
//! permanently offline and keeps processing locally.

use crate::dispatcher::{CollectorEndpoint, DispatcherConfig, OfflinePolicy};
use crate::error::{Error, Result};
use crate::health_monitor::HealthMonitorConfig;
use crate::record_store::HealthComponent;
use crate::storage_monitor::StorageMonitorConfig;
use reqwest::Url;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Path appended to the collector base URL for the duplex channel
pub const DEFAULT_WS_PATH: &str = "/ws/edge";

/// Identity stamped on every outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub checkpoint_id: String,
}

/// Optional features; a disabled feature is wired to a no-op implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    pub status_api: bool,
    pub ocr_check: bool,
    pub storage_monitor: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            status_api: true,
            ocr_check: true,
            storage_monitor: true,
        }
    }
}

/// Status API listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Complete, validated configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite URL of the record store
    pub database_url: String,
    pub device: DeviceIdentity,
    /// Inference pipeline status endpoint (None = assume ready)
    pub inference_status_url: Option<Url>,
    /// OCR engine model directory
    pub ocr_model_dir: Option<PathBuf>,
    /// Bounded wait for the inference pipeline before monitoring starts
    pub startup_wait: Duration,
    pub dispatcher: DispatcherConfig,
    pub health: HealthMonitorConfig,
    pub storage: StorageMonitorConfig,
    pub features: FeatureFlags,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Build from the process environment
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Build from an explicit key/value map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let env = EnvReader { vars };

        let device = DeviceIdentity {
            device_id: env.non_empty("DEVICE_ID", "edge-001")?,
            checkpoint_id: env.non_empty("CHECKPOINT_ID", "checkpoint-001")?,
        };

        let collector = match env.optional("COLLECTOR_URL") {
            Some(raw) => Some(parse_collector(&raw, env.optional("COLLECTOR_WS_URL"))?),
            None => None,
        };

        let offline_policy = match env.optional("OFFLINE_POLICY") {
            Some(raw) => OfflinePolicy::from_str(&raw).map_err(Error::Config)?,
            None => OfflinePolicy::default(),
        };

        let dispatcher = DispatcherConfig {
            device: device.clone(),
            collector,
            detection_poll_interval: env.secs("DETECTION_POLL_INTERVAL_SECS", 5)?,
            health_poll_interval: env.secs("HEALTH_SEND_INTERVAL_SECS", 30)?,
            batch_size: env.positive("SEND_BATCH_SIZE", 50u32)?,
            handshake_timeout: env.secs("HANDSHAKE_TIMEOUT_SECS", 10)?,
            send_timeout: env.secs("SEND_TIMEOUT_SECS", 15)?,
            liveness_interval: env.secs("LIVENESS_INTERVAL_SECS", 30)?,
            reconnect_base: env.secs("RECONNECT_BASE_SECS", 5)?,
            reconnect_max: env.secs("RECONNECT_MAX_SECS", 300)?,
            stop_timeout: env.secs("STOP_TIMEOUT_SECS", 10)?,
            offline_policy,
            reject_retry_limit: env.positive("REJECT_RETRY_LIMIT", 5u32)?,
        };
        if dispatcher.reconnect_max < dispatcher.reconnect_base {
            return Err(Error::Config(
                "RECONNECT_MAX_SECS must be >= RECONNECT_BASE_SECS".to_string(),
            ));
        }

        let core_components = env
            .list("CORE_CHECKS", "camera,models")
            .iter()
            .map(|s| HealthComponent::from(s.as_str()))
            .collect::<Vec<_>>();

        let health = HealthMonitorConfig {
            check_interval: env.secs("HEALTH_CHECK_INTERVAL_SECS", 60)?,
            check_timeout: env.secs("HEALTH_CHECK_TIMEOUT_SECS", 10)?,
            core_components,
            readiness_poll_interval: env.secs("READINESS_POLL_SECS", 5)?,
            readiness_max_wait: env.secs("READINESS_MAX_WAIT_SECS", 300)?,
            cpu_warn_percent: env.percent("CPU_WARN_PERCENT", 85.0)?,
            cpu_fail_percent: env.percent("CPU_FAIL_PERCENT", 98.0)?,
            ram_warn_percent: env.percent("RAM_WARN_PERCENT", 85.0)?,
            ram_fail_percent: env.percent("RAM_FAIL_PERCENT", 95.0)?,
            model_paths: env
                .list("MODEL_PATHS", "")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            network_probe_addr: env.non_empty("NETWORK_PROBE_ADDR", "1.1.1.1:443")?,
        };

        let min_free_space_gb: f64 = env.parse("MIN_FREE_SPACE_GB", 2.0)?;
        if !min_free_space_gb.is_finite() || min_free_space_gb < 0.0 {
            return Err(Error::Config(format!(
                "MIN_FREE_SPACE_GB must be >= 0, got {}",
                min_free_space_gb
            )));
        }

        let storage = StorageMonitorConfig {
            capture_dir: PathBuf::from(env.non_empty("CAPTURE_DIR", "/var/lib/checkpoint/captures")?),
            min_free_space_gb,
            retention_days: env.positive("RETENTION_DAYS", 30u32)?,
            batch_size: env.positive("CLEANUP_BATCH_SIZE", 50usize)?,
            interval: env.secs("STORAGE_MONITOR_INTERVAL_SECS", 300)?,
            in_use_grace: Duration::from_secs(env.parse("IN_USE_GRACE_SECS", 30u64)?),
        };

        let features = FeatureFlags {
            status_api: env.flag("ENABLE_STATUS_API", true)?,
            ocr_check: env.flag("ENABLE_OCR_CHECK", true)?,
            storage_monitor: env.flag("ENABLE_STORAGE_MONITOR", true)?,
        };

        let server = ServerConfig {
            host: env.non_empty("HOST", "0.0.0.0")?,
            port: env.parse("PORT", 8090u16)?,
        };

        let inference_status_url = match env.optional("INFERENCE_STATUS_URL") {
            Some(raw) => Some(parse_http_url("INFERENCE_STATUS_URL", &raw)?),
            None => None,
        };

        Ok(Self {
            database_url: env.non_empty("DATABASE_URL", "sqlite:///var/lib/checkpoint/records.db")?,
            device,
            inference_status_url,
            ocr_model_dir: env.optional("OCR_MODEL_DIR").map(PathBuf::from),
            startup_wait: env.secs("STARTUP_WAIT_SECS", 120)?,
            dispatcher,
            health,
            storage,
            features,
            server,
        })
    }

    /// Offline mode is decided by configuration alone
    pub fn is_offline(&self) -> bool {
        self.dispatcher.collector.is_none()
    }
}

fn parse_http_url(key: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::Config(format!("{}: invalid URL '{}': {}", key, raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Config(format!(
            "{}: unsupported scheme '{}' (expected http/https)",
            key, other
        ))),
    }
}

/// Collector base URL plus the duplex URL (derived unless overridden)
fn parse_collector(raw: &str, ws_override: Option<String>) -> Result<CollectorEndpoint> {
    let base_url = parse_http_url("COLLECTOR_URL", raw)?;

    let ws_url = match ws_override {
        Some(ws) => {
            let url = Url::parse(&ws)
                .map_err(|e| Error::Config(format!("COLLECTOR_WS_URL: invalid URL '{}': {}", ws, e)))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(Error::Config(format!(
                    "COLLECTOR_WS_URL: unsupported scheme '{}' (expected ws/wss)",
                    url.scheme()
                )));
            }
            url
        }
        None => derive_ws_url(&base_url)?,
    };

    Ok(CollectorEndpoint { base_url, ws_url })
}

fn derive_ws_url(base: &Url) -> Result<Url> {
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive duplex URL from '{}'", base)))?;
    let path = format!("{}{}", base.path().trim_end_matches('/'), DEFAULT_WS_PATH);
    ws.set_path(&path);
    Ok(ws)
}

// ============================================================
// Env helpers
// ============================================================

struct EnvReader<'a> {
    vars: &'a HashMap<String, String>,
}

impl EnvReader<'_> {
    /// Trimmed value; blank counts as unset
    fn optional(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn non_empty(&self, key: &str, default: &str) -> Result<String> {
        match self.vars.get(key) {
            None => Ok(default.to_string()),
            Some(v) if v.trim().is_empty() => {
                Err(Error::Config(format!("{} must not be empty", key)))
            }
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| Error::Config(format!("{}: cannot parse '{}': {}", key, raw, e))),
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr + PartialOrd + Default + Copy,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(Error::Config(format!("{} must be greater than zero", key)));
        }
        Ok(value)
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration> {
        self.positive(key, default).map(Duration::from_secs)
    }

    fn percent(&self, key: &str, default: f32) -> Result<f32> {
        let value: f32 = self.parse(key, default)?;
        if !(value > 0.0 && value <= 100.0) {
            return Err(Error::Config(format!("{} must be in (0, 100], got {}", key, value)));
        }
        Ok(value)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::Config(format!("{}: expected a boolean, got '{}'", key, v))),
            },
        }
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        self.optional(key)
            .unwrap_or_else(|| default.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
