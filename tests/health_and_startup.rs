//! Health check isolation and the startup sequence

mod common;

use async_trait::async_trait;
use checkpoint_edge::dispatcher::{Dispatcher, OfflinePolicy};
use checkpoint_edge::error::{Error, Result};
use checkpoint_edge::health_monitor::{
    aggregate, CheckOutcome, HealthCheck, HealthMonitor, HealthMonitorConfig, OverallStatus,
};
use checkpoint_edge::readiness::{AssumeReady, PipelineReadiness, SharedReadiness};
use checkpoint_edge::record_store::{CheckStatus, HealthComponent, LogFilter, RecordStore};
use checkpoint_edge::startup::{start_services, Services, StartupOptions};
use checkpoint_edge::storage_monitor::StorageMonitor;
use common::{eventually, fast_config, temp_store, DirBackedSpace};
use std::sync::Arc;
use std::time::Duration;

enum Behaviour {
    Pass,
    Error,
    Panic,
    Hang,
}

struct Scripted(HealthComponent, Behaviour);

#[async_trait]
impl HealthCheck for Scripted {
    fn component(&self) -> HealthComponent {
        self.0.clone()
    }

    async fn run(&self) -> Result<CheckOutcome> {
        match self.1 {
            Behaviour::Pass => Ok(CheckOutcome::pass("fine")),
            Behaviour::Error => Err(Error::Internal("probe exploded".into())),
            Behaviour::Panic => panic!("check bug"),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(CheckOutcome::pass("too late"))
            }
        }
    }
}

fn scripted(component: HealthComponent, behaviour: Behaviour) -> Arc<dyn HealthCheck> {
    Arc::new(Scripted(component, behaviour))
}

fn monitor_config() -> HealthMonitorConfig {
    HealthMonitorConfig {
        check_interval: Duration::from_millis(50),
        check_timeout: Duration::from_millis(100),
        core_components: vec![HealthComponent::Camera],
        readiness_poll_interval: Duration::from_millis(10),
        readiness_max_wait: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_failing_checks_do_not_affect_others() {
    let (_dir, store) = temp_store().await;
    let monitor = HealthMonitor::new(
        monitor_config(),
        store,
        Arc::new(AssumeReady),
        vec![
            scripted(HealthComponent::Disk, Behaviour::Error),
            scripted(HealthComponent::Ocr, Behaviour::Panic),
            scripted(HealthComponent::Network, Behaviour::Hang),
            scripted(HealthComponent::Camera, Behaviour::Pass),
        ],
    );
    assert!(monitor.initialize().await);

    let health = monitor.run_all_checks().await;
    assert_eq!(health.checks.len(), 4);
    let status_of = |c: HealthComponent| {
        health
            .checks
            .iter()
            .find(|r| r.component == c)
            .map(|r| r.status)
    };
    assert_eq!(status_of(HealthComponent::Disk), Some(CheckStatus::Fail));
    assert_eq!(status_of(HealthComponent::Ocr), Some(CheckStatus::Fail));
    assert_eq!(status_of(HealthComponent::Network), Some(CheckStatus::Fail));
    assert_eq!(status_of(HealthComponent::Camera), Some(CheckStatus::Pass));
    // non-core failures only
    assert_eq!(health.overall, OverallStatus::Unhealthy);

    let logs = monitor
        .get_logs(&LogFilter::default(), 10, 1)
        .await
        .unwrap();
    assert_eq!(logs.total, 4);
}

#[tokio::test]
async fn test_aggregation_ignores_result_order() {
    let (_dir, store) = temp_store().await;
    let monitor = HealthMonitor::new(
        monitor_config(),
        store,
        Arc::new(AssumeReady),
        vec![
            scripted(HealthComponent::Camera, Behaviour::Error),
            scripted(HealthComponent::Disk, Behaviour::Pass),
        ],
    );
    let health = monitor.run_all_checks().await;
    assert_eq!(health.overall, OverallStatus::Critical);

    let registered = monitor.registered();
    let mut reversed = health.checks.clone();
    reversed.reverse();
    let core = [HealthComponent::Camera];
    assert_eq!(
        aggregate(&registered, &health.checks, &core),
        aggregate(&registered, &reversed, &core)
    );
}

#[tokio::test]
async fn test_monitoring_waits_for_pipeline_then_runs() {
    let (_dir, store) = temp_store().await;
    let readiness = SharedReadiness::new();
    let monitor = HealthMonitor::new(
        monitor_config(),
        store.clone(),
        readiness.clone(),
        vec![scripted(HealthComponent::Camera, Behaviour::Pass)],
    );
    assert!(monitor.start_monitoring(None).await);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.list_health_logs(&LogFilter::default(), 10, 1).await.unwrap().total, 0);

    readiness.update(PipelineReadiness::READY).await;
    let ran = eventually(Duration::from_secs(5), || async {
        store.list_health_logs(&LogFilter::default(), 10, 1).await.unwrap().total > 0
    })
    .await;
    monitor.stop_monitoring().await;
    assert!(ran);
}

async fn services(store: &RecordStore, capture_dir: &std::path::Path) -> Services {
    let readiness = SharedReadiness::new();
    let health = Arc::new(HealthMonitor::new(
        monitor_config(),
        store.clone(),
        readiness.clone(),
        vec![scripted(HealthComponent::Camera, Behaviour::Pass)],
    ));
    let mut config = fast_config(OfflinePolicy::Retain);
    config.collector = None;
    let dispatcher = Arc::new(Dispatcher::new(config, store.clone()).unwrap());
    let storage = Arc::new(StorageMonitor::new(
        checkpoint_edge::storage_monitor::StorageMonitorConfig {
            capture_dir: capture_dir.to_path_buf(),
            min_free_space_gb: 0.0,
            interval: Duration::from_millis(50),
            ..Default::default()
        },
        store.clone(),
        Arc::new(DirBackedSpace {
            dir: capture_dir.to_path_buf(),
            capacity: 1 << 30,
        }),
    ));
    Services {
        readiness,
        health,
        dispatcher,
        storage: Some(storage),
    }
}

#[tokio::test]
async fn test_startup_proceeds_without_pipeline_and_shuts_down() {
    let (_dir, store) = temp_store().await;
    let captures = tempfile::tempdir().unwrap();
    let services = services(&store, captures.path()).await;

    // pipeline never reports initialized: startup continues after the bounded wait
    let running = start_services(
        services,
        StartupOptions {
            pipeline_wait: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
        },
    )
    .await
    .unwrap();

    assert!(running.health.is_monitoring().await);
    assert!(running.dispatcher.is_running().await);
    assert!(running.dispatcher.status().await.permanent_offline);
    let storage = running.storage.clone().unwrap();
    assert!(storage.is_running().await);

    running.shutdown().await;
    assert!(!running.health.is_monitoring().await);
    assert!(!running.dispatcher.is_running().await);
    assert!(!storage.is_running().await);
}

#[tokio::test]
async fn test_startup_fails_without_checks() {
    let (_dir, store) = temp_store().await;
    let captures = tempfile::tempdir().unwrap();
    let mut services = services(&store, captures.path()).await;
    services.health = Arc::new(HealthMonitor::new(
        monitor_config(),
        store.clone(),
        Arc::new(AssumeReady),
        vec![],
    ));

    let result = start_services(
        services,
        StartupOptions {
            pipeline_wait: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
        },
    )
    .await;
    assert!(result.is_err());
}
