//! Startup Coordinator
//!
//! Brings the subsystem up in dependency order, each step gated on the
//! previous one being minimally operational:
//!
//! 1. capture/inference pipeline reports `initialized` (bounded wait)
//! 2. Health Monitor initialized and monitoring scheduled
//! 3. Communication Dispatcher negotiated and started
//! 4. Storage Monitor started
//!
//! `RunningServices::shutdown` stops them in reverse order.

use crate::dispatcher::Dispatcher;
use crate::health_monitor::HealthMonitor;
use crate::readiness::{wait_for_readiness, ReadinessProbe};
use crate::storage_monitor::StorageMonitor;
use std::sync::Arc;
use std::time::Duration;

/// Components to start; constructed by the composition root
pub struct Services {
    pub readiness: Arc<dyn ReadinessProbe>,
    pub health: Arc<HealthMonitor>,
    pub dispatcher: Arc<Dispatcher>,
    /// None when the storage monitor feature is disabled
    pub storage: Option<Arc<StorageMonitor>>,
}

#[derive(Debug, Clone, Copy)]
pub struct StartupOptions {
    pub pipeline_wait: Duration,
    pub poll_interval: Duration,
}

/// Handles of the started services
pub struct RunningServices {
    pub health: Arc<HealthMonitor>,
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Option<Arc<StorageMonitor>>,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("health monitor failed to initialize")]
    HealthMonitor,
    #[error("dispatcher failed to start")]
    Dispatcher,
    #[error("storage monitor failed to start")]
    StorageMonitor,
}

pub async fn start_services(
    services: Services,
    options: StartupOptions,
) -> std::result::Result<RunningServices, StartupError> {
    // 1. pipeline
    let initialized = wait_for_readiness(
        services.readiness.as_ref(),
        |r| r.initialized,
        options.poll_interval,
        options.pipeline_wait,
    )
    .await;
    if initialized {
        tracing::info!("Capture pipeline initialized");
    } else {
        tracing::warn!("Continuing startup without capture pipeline");
    }

    // 2. health monitor
    if !services.health.initialize().await {
        return Err(StartupError::HealthMonitor);
    }
    services.health.start_monitoring(None).await;

    // 3. dispatcher
    services.dispatcher.initialize().await;
    if !services.dispatcher.start().await {
        services.health.stop_monitoring().await;
        return Err(StartupError::Dispatcher);
    }

    // 4. storage monitor
    if let Some(storage) = &services.storage {
        if !storage.start(None).await {
            services.dispatcher.stop().await;
            services.health.stop_monitoring().await;
            return Err(StartupError::StorageMonitor);
        }
    }

    tracing::info!("All services started");
    Ok(RunningServices {
        health: services.health,
        dispatcher: services.dispatcher,
        storage: services.storage,
    })
}

impl RunningServices {
    pub async fn shutdown(&self) {
        if let Some(storage) = &self.storage {
            storage.stop().await;
        }
        self.dispatcher.stop().await;
        self.health.stop_monitoring().await;
        tracing::info!("All services stopped");
    }
}
