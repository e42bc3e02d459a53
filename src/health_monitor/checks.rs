//! Health checks
//!
//! Each check is an independent, side-effect free probe of one component.
//! A check may return an error, hang or even panic; the monitor turns all of
//! those into a FAIL result for that component only.

use super::types::{CheckOutcome, HealthMonitorConfig};
use crate::error::Result;
use crate::readiness::{OcrEngine, ReadinessProbe};
use crate::record_store::{HealthComponent, RecordStore};
use crate::storage_monitor::SpaceProbe;
use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn component(&self) -> HealthComponent;

    async fn run(&self) -> Result<CheckOutcome>;
}

/// Collaborators needed to build the standard registry
pub struct CheckDeps {
    pub store: RecordStore,
    pub readiness: Arc<dyn ReadinessProbe>,
    pub ocr: Arc<dyn OcrEngine>,
    pub space: Arc<dyn SpaceProbe>,
    pub capture_dir: PathBuf,
    pub min_free_bytes: u64,
    /// Collector base URL, if configured
    pub collector: Option<Url>,
}

/// camera, disk, cpu_ram, models, ocr, database, network
pub fn standard_checks(config: &HealthMonitorConfig, deps: CheckDeps) -> Vec<Arc<dyn HealthCheck>> {
    let probe_timeout = config.check_timeout / 2;
    vec![
        Arc::new(CameraCheck {
            readiness: deps.readiness,
        }),
        Arc::new(DiskSpaceCheck {
            space: deps.space,
            capture_dir: deps.capture_dir,
            min_free_bytes: deps.min_free_bytes,
        }),
        Arc::new(CpuRamCheck::new(UsageThresholds {
            cpu_warn: config.cpu_warn_percent,
            cpu_fail: config.cpu_fail_percent,
            ram_warn: config.ram_warn_percent,
            ram_fail: config.ram_fail_percent,
        })),
        Arc::new(ModelsCheck {
            paths: config.model_paths.clone(),
        }),
        Arc::new(OcrCheck { engine: deps.ocr }),
        Arc::new(DatabaseCheck { store: deps.store }),
        Arc::new(NetworkCheck {
            probe_addr: config.network_probe_addr.clone(),
            collector: deps.collector,
            timeout: probe_timeout,
        }),
    ]
}

// ============================================================
// camera
// ============================================================

pub struct CameraCheck {
    readiness: Arc<dyn ReadinessProbe>,
}

#[async_trait]
impl HealthCheck for CameraCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::Camera
    }

    async fn run(&self) -> Result<CheckOutcome> {
        let state = self.readiness.readiness().await;
        let details = json!({
            "initialized": state.initialized,
            "streaming": state.streaming,
        });

        let outcome = match (state.initialized, state.streaming) {
            (true, true) => CheckOutcome::pass("Camera streaming"),
            (true, false) => CheckOutcome::warning("Camera initialized but not streaming"),
            _ => CheckOutcome::fail("Camera not initialized"),
        };
        Ok(outcome.with_details(details))
    }
}

// ============================================================
// disk
// ============================================================

pub struct DiskSpaceCheck {
    space: Arc<dyn SpaceProbe>,
    capture_dir: PathBuf,
    min_free_bytes: u64,
}

#[async_trait]
impl HealthCheck for DiskSpaceCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::Disk
    }

    async fn run(&self) -> Result<CheckOutcome> {
        let space = self.space.space(&self.capture_dir)?;
        let free_gb = space.free_bytes as f64 / GB;
        let details = json!({
            "path": self.capture_dir.display().to_string(),
            "total_bytes": space.total_bytes,
            "free_bytes": space.free_bytes,
            "min_free_bytes": self.min_free_bytes,
        });

        let warn_below = self.min_free_bytes.saturating_add(self.min_free_bytes / 2);
        let outcome = if space.free_bytes < self.min_free_bytes {
            CheckOutcome::fail(format!("Low disk space: {:.2} GB free", free_gb))
        } else if space.free_bytes < warn_below {
            CheckOutcome::warning(format!("Disk space getting low: {:.2} GB free", free_gb))
        } else {
            CheckOutcome::pass(format!("{:.2} GB free", free_gb))
        };
        Ok(outcome.with_details(details))
    }
}

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

// ============================================================
// cpu_ram
// ============================================================

#[derive(Debug, Clone, Copy)]
pub struct UsageThresholds {
    pub cpu_warn: f32,
    pub cpu_fail: f32,
    pub ram_warn: f32,
    pub ram_fail: f32,
}

pub fn classify_usage(cpu_percent: f32, ram_percent: f32, t: &UsageThresholds) -> CheckOutcome {
    let summary = format!("CPU {:.1}%, RAM {:.1}%", cpu_percent, ram_percent);
    if cpu_percent >= t.cpu_fail || ram_percent >= t.ram_fail {
        CheckOutcome::fail(format!("Resource exhaustion: {}", summary))
    } else if cpu_percent >= t.cpu_warn || ram_percent >= t.ram_warn {
        CheckOutcome::warning(format!("High resource usage: {}", summary))
    } else {
        CheckOutcome::pass(summary)
    }
}

pub struct CpuRamCheck {
    /// Kept between cycles so CPU usage is measured over the check interval
    system: Mutex<System>,
    thresholds: UsageThresholds,
}

impl CpuRamCheck {
    pub fn new(thresholds: UsageThresholds) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Mutex::new(system),
            thresholds,
        }
    }
}

#[async_trait]
impl HealthCheck for CpuRamCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::CpuRam
    }

    async fn run(&self) -> Result<CheckOutcome> {
        let (cpu, ram, memory_total, memory_used) = {
            let mut sys = self
                .system
                .lock()
                .map_err(|_| crate::Error::Internal("system sampler poisoned".to_string()))?;
            sys.refresh_cpu();
            sys.refresh_memory();

            let cpus = sys.cpus();
            let cpu = if cpus.is_empty() {
                0.0
            } else {
                cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
            };
            let total = sys.total_memory();
            let used = sys.used_memory();
            let ram = if total == 0 {
                0.0
            } else {
                used as f32 / total as f32 * 100.0
            };
            (cpu, ram, total, used)
        };

        Ok(classify_usage(cpu, ram, &self.thresholds).with_details(json!({
            "cpu_percent": cpu,
            "memory_percent": ram,
            "memory_total_bytes": memory_total,
            "memory_used_bytes": memory_used,
        })))
    }
}

// ============================================================
// models
// ============================================================

pub struct ModelsCheck {
    paths: Vec<PathBuf>,
}

impl ModelsCheck {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl HealthCheck for ModelsCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::Models
    }

    async fn run(&self) -> Result<CheckOutcome> {
        if self.paths.is_empty() {
            return Ok(CheckOutcome::warning("No model artifacts configured"));
        }

        let mut missing = Vec::new();
        let mut empty = Vec::new();
        for path in &self.paths {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => {}
                Ok(_) => empty.push(path.display().to_string()),
                Err(_) => missing.push(path.display().to_string()),
            }
        }

        let details = json!({
            "configured": self.paths.len(),
            "missing": missing,
            "empty": empty,
        });
        let outcome = if !missing.is_empty() {
            CheckOutcome::fail(format!("{} model artifact(s) missing", missing.len()))
        } else if !empty.is_empty() {
            CheckOutcome::warning(format!("{} model artifact(s) empty", empty.len()))
        } else {
            CheckOutcome::pass(format!("{} model artifact(s) present", self.paths.len()))
        };
        Ok(outcome.with_details(details))
    }
}

// ============================================================
// ocr
// ============================================================

pub struct OcrCheck {
    engine: Arc<dyn OcrEngine>,
}

#[async_trait]
impl HealthCheck for OcrCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::Ocr
    }

    async fn run(&self) -> Result<CheckOutcome> {
        let engine = self.engine.describe();
        match self.engine.initialize().await {
            Ok(()) => Ok(CheckOutcome::pass(format!("OCR engine ready ({})", engine))),
            Err(e) => Ok(CheckOutcome::fail(format!("OCR engine failed to initialize: {}", e))
                .with_details(json!({ "engine": engine }))),
        }
    }
}

// ============================================================
// database
// ============================================================

pub struct DatabaseCheck {
    store: RecordStore,
}

#[async_trait]
impl HealthCheck for DatabaseCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::Database
    }

    async fn run(&self) -> Result<CheckOutcome> {
        match self.store.ping().await {
            Ok(latency) => Ok(CheckOutcome::pass(format!(
                "Record store reachable ({} ms)",
                latency.as_millis()
            ))
            .with_details(json!({ "latency_ms": latency.as_millis() as u64 }))),
            Err(e) => Ok(CheckOutcome::fail(format!("Record store unreachable: {}", e))),
        }
    }
}

// ============================================================
// network
// ============================================================

pub struct NetworkCheck {
    probe_addr: String,
    collector: Option<Url>,
    timeout: Duration,
}

/// `host:port` of a URL, using the scheme's default port
pub fn socket_addr_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

async fn tcp_reachable(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[async_trait]
impl HealthCheck for NetworkCheck {
    fn component(&self) -> HealthComponent {
        HealthComponent::Network
    }

    async fn run(&self) -> Result<CheckOutcome> {
        let external = tcp_reachable(&self.probe_addr, self.timeout).await;
        let collector_addr = self.collector.as_ref().and_then(socket_addr_of);

        let Some(collector_addr) = collector_addr else {
            let details = json!({ "external": external, "collector": "not configured" });
            let outcome = if external {
                CheckOutcome::pass("External network reachable")
            } else {
                CheckOutcome::fail(format!("{} unreachable", self.probe_addr))
            };
            return Ok(outcome.with_details(details));
        };

        let collector = tcp_reachable(&collector_addr, self.timeout).await;
        let details = json!({ "external": external, "collector": collector });
        let outcome = match (external, collector) {
            (true, true) => CheckOutcome::pass("External network and collector reachable"),
            (false, true) => CheckOutcome::warning("Collector reachable, external network not"),
            (true, false) => {
                CheckOutcome::warning(format!("Collector {} unreachable", collector_addr))
            }
            (false, false) => CheckOutcome::fail("No network connectivity"),
        };
        Ok(outcome.with_details(details))
    }
}
