//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use checkpoint_edge::config::DeviceIdentity;
use checkpoint_edge::dispatcher::{
    ChannelConnector, CollectorChannel, CollectorEndpoint, DataType, DispatcherConfig, Envelope,
    OfflinePolicy, Protocol, TransportError,
};
use checkpoint_edge::record_store::{DetectionInsert, RecordStore};
use checkpoint_edge::storage_monitor::{DiskSpace, SpaceProbe};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn device() -> DeviceIdentity {
    DeviceIdentity {
        device_id: "edge-test".into(),
        checkpoint_id: "cp-test".into(),
    }
}

pub async fn temp_store() -> (tempfile::TempDir, RecordStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("records.db").display());
    (dir, RecordStore::open(&url).await.unwrap())
}

pub fn detection(path: Option<&Path>) -> DetectionInsert {
    DetectionInsert {
        device_id: "edge-test".into(),
        checkpoint_id: "cp-test".into(),
        vehicle_count: 1,
        annotated_image_path: path.map(|p| p.display().to_string()),
        ..Default::default()
    }
}

/// Fast timings so loops turn over within a test
pub fn fast_config(policy: OfflinePolicy) -> DispatcherConfig {
    let mut config = DispatcherConfig::offline(device());
    config.collector = Some(CollectorEndpoint {
        base_url: "http://collector.test:8080".parse().unwrap(),
        ws_url: "ws://collector.test:8080/ws/edge".parse().unwrap(),
    });
    config.detection_poll_interval = Duration::from_millis(20);
    config.health_poll_interval = Duration::from_millis(20);
    config.batch_size = 2;
    config.handshake_timeout = Duration::from_millis(200);
    config.send_timeout = Duration::from_millis(200);
    config.liveness_interval = Duration::from_secs(30);
    config.reconnect_base = Duration::from_millis(30);
    config.reconnect_max = Duration::from_millis(100);
    config.stop_timeout = Duration::from_secs(1);
    config.offline_policy = policy;
    config
}

/// Poll `f` until it holds or `limit` elapses
pub async fn eventually<F, Fut>(limit: Duration, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if f().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f().await
}

// ============================================================
// Fake collector
// ============================================================

#[derive(Debug, Default)]
pub struct CollectorState {
    pub primary_up: bool,
    pub fallback_up: bool,
    /// Fail this many upcoming sends with a transport error
    pub fail_next: u32,
    pub connect_attempts: u32,
    /// (data type, message id, protocol) in delivery order
    pub delivered: Vec<(DataType, String, Protocol)>,
    /// Message ids answered with a rejection
    pub refuse: HashSet<String>,
    pub rejections: u32,
}

#[derive(Clone, Default)]
pub struct FakeCollector {
    pub state: Arc<Mutex<CollectorState>>,
}

impl FakeCollector {
    pub fn up() -> Self {
        let collector = Self::default();
        collector.set_up(true, true);
        collector
    }

    pub fn set_up(&self, primary: bool, fallback: bool) {
        let mut state = self.state.lock().unwrap();
        state.primary_up = primary;
        state.fallback_up = fallback;
    }

    pub fn delivered_ids(&self, data_type: DataType) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .delivered
            .iter()
            .filter(|(t, _, _)| *t == data_type)
            .map(|(_, id, _)| id.clone())
            .collect()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().unwrap().connect_attempts
    }

    pub fn connector(&self) -> Arc<dyn ChannelConnector> {
        Arc::new(self.clone())
    }

    fn open(&self, protocol: Protocol) -> Result<Box<dyn CollectorChannel>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        let up = match protocol {
            Protocol::Primary => state.primary_up,
            _ => state.fallback_up,
        };
        if !up {
            return Err(TransportError::Connect("connection refused".into()));
        }
        Ok(Box::new(FakeChannel {
            protocol,
            collector: self.clone(),
        }))
    }
}

#[async_trait]
impl ChannelConnector for FakeCollector {
    async fn connect_primary(
        &self,
        _registration: &Envelope,
    ) -> Result<Box<dyn CollectorChannel>, TransportError> {
        self.open(Protocol::Primary)
    }

    async fn connect_fallback(
        &self,
        _registration: &Envelope,
    ) -> Result<Box<dyn CollectorChannel>, TransportError> {
        self.open(Protocol::Fallback)
    }
}

struct FakeChannel {
    protocol: Protocol,
    collector: FakeCollector,
}

impl FakeChannel {
    fn is_up(state: &CollectorState, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Primary => state.primary_up,
            _ => state.fallback_up,
        }
    }
}

#[async_trait]
impl CollectorChannel for FakeChannel {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut state = self.collector.state.lock().unwrap();
        if !Self::is_up(&state, self.protocol) {
            return Err(TransportError::ConnectionClosed);
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Send("broken pipe".into()));
        }
        if state.refuse.contains(&envelope.message_id) {
            state.rejections += 1;
            return Err(TransportError::Rejected("422 invalid payload".into()));
        }
        state
            .delivered
            .push((envelope.data_type, envelope.message_id.clone(), self.protocol));
        Ok(())
    }

    async fn ping(&mut self, _envelope: &Envelope) -> Result<(), TransportError> {
        let state = self.collector.state.lock().unwrap();
        if Self::is_up(&state, self.protocol) {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    async fn close(&mut self) {}
}

// ============================================================
// Fake disk
// ============================================================

/// Free space = capacity minus the bytes currently under `dir`
pub struct DirBackedSpace {
    pub dir: PathBuf,
    pub capacity: u64,
}

fn bytes_under(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let path = e.path();
            if path.is_dir() {
                bytes_under(&path)
            } else {
                e.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

impl SpaceProbe for DirBackedSpace {
    fn space(&self, _path: &Path) -> checkpoint_edge::Result<DiskSpace> {
        Ok(DiskSpace {
            total_bytes: self.capacity,
            free_bytes: self.capacity.saturating_sub(bytes_under(&self.dir)),
        })
    }
}

/// Write `size` bytes and backdate the modification time
pub fn write_capture(dir: &Path, name: &str, size: usize, age: Duration) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; size]).unwrap();
    let modified = std::time::SystemTime::now() - age;
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
    path
}
