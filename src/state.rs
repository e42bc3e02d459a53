//! Application state
//!
//! Shared, read-mostly handles for the status API. Handlers only read cached
//! snapshots; they never trigger checks, network probes or disk sweeps.

use crate::config::DeviceIdentity;
use crate::dispatcher::Dispatcher;
use crate::health_monitor::HealthMonitor;
use crate::record_store::RecordStore;
use crate::storage_monitor::StorageMonitor;
use std::sync::Arc;
use std::time::Instant;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub device: DeviceIdentity,
    pub store: RecordStore,
    pub health: Arc<HealthMonitor>,
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Option<Arc<StorageMonitor>>,
    pub started_at: Instant,
}
