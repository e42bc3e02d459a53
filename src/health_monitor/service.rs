//! Health Monitor service

use super::checks::HealthCheck;
use super::types::{aggregate, AggregatedHealth, CheckOutcome, CheckResult, HealthMonitorConfig};
use crate::error::Result;
use crate::readiness::{wait_for_readiness, PipelineReadiness, ReadinessProbe};
use crate::record_store::{HealthCheckInsert, HealthComponent, LogFilter, LogPage, RecordStore};
use crate::worker::Workers;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// One pass over the registry; cloned into the monitoring loop
#[derive(Clone)]
struct CheckCycle {
    store: RecordStore,
    checks: Arc<Vec<Arc<dyn HealthCheck>>>,
    core: Arc<Vec<HealthComponent>>,
    check_timeout: Duration,
    latest: Arc<RwLock<Option<AggregatedHealth>>>,
}

impl CheckCycle {
    fn registered(&self) -> Vec<HealthComponent> {
        self.checks.iter().map(|c| c.component()).collect()
    }

    async fn run(&self) -> AggregatedHealth {
        let mut results = Vec::with_capacity(self.checks.len());

        for check in self.checks.iter() {
            let result = run_isolated(check.clone(), self.check_timeout).await;
            self.persist(&result).await;
            results.push(result);
        }

        let health = AggregatedHealth {
            overall: aggregate(&self.registered(), &results, &self.core),
            checks: results,
            missing: Vec::new(),
            evaluated_at: Utc::now(),
        };

        let previous = self
            .latest
            .read()
            .await
            .as_ref()
            .map(|h| h.overall);
        if previous != Some(health.overall) {
            tracing::info!(
                overall = %health.overall,
                previous = ?previous,
                "Node health changed"
            );
        }
        *self.latest.write().await = Some(health.clone());
        health
    }

    /// Written immediately after the check; a store failure is logged, never fatal
    async fn persist(&self, result: &CheckResult) {
        let insert = HealthCheckInsert {
            timestamp: result.checked_at,
            component: result.component.clone(),
            status: result.status,
            message: result.message.clone(),
            details: result.details.clone(),
        };
        if let Err(e) = self.store.insert_health_log(&insert).await {
            tracing::error!(
                component = %result.component,
                error = %e,
                "Failed to persist health check result"
            );
        }
    }
}

/// Runs one check in its own task with a deadline. Errors, panics and hangs become FAIL.
async fn run_isolated(check: Arc<dyn HealthCheck>, timeout: Duration) -> CheckResult {
    let component = check.component();
    let started = Instant::now();
    let mut handle = tokio::spawn(async move { check.run().await });

    let outcome = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(Ok(outcome))) => outcome,
        Ok(Ok(Err(e))) => CheckOutcome::fail(format!("check failed: {}", e)),
        Ok(Err(join_error)) if join_error.is_panic() => CheckOutcome::fail("check panicked"),
        Ok(Err(_)) => CheckOutcome::fail("check cancelled"),
        Err(_) => {
            handle.abort();
            CheckOutcome::fail(format!("timed out after {}s", timeout.as_secs_f32()))
        }
    };

    match outcome.status {
        crate::record_store::CheckStatus::Pass => {
            tracing::debug!(component = %component, message = %outcome.message, "Check passed")
        }
        status => tracing::warn!(
            component = %component,
            status = %status,
            message = %outcome.message,
            "Check not passing"
        ),
    }

    CheckResult {
        component,
        status: outcome.status,
        message: outcome.message,
        details: outcome.details,
        duration_ms: started.elapsed().as_millis() as u64,
        checked_at: Utc::now(),
    }
}

pub struct HealthMonitor {
    config: HealthMonitorConfig,
    readiness: Arc<dyn ReadinessProbe>,
    cycle: CheckCycle,
    workers: Mutex<Option<Workers>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthMonitorConfig,
        store: RecordStore,
        readiness: Arc<dyn ReadinessProbe>,
        checks: Vec<Arc<dyn HealthCheck>>,
    ) -> Self {
        let cycle = CheckCycle {
            store,
            checks: Arc::new(checks),
            core: Arc::new(config.core_components.clone()),
            check_timeout: config.check_timeout,
            latest: Arc::new(RwLock::new(None)),
        };
        Self {
            config,
            readiness,
            cycle,
            workers: Mutex::new(None),
        }
    }

    /// Registry non-empty and the log store writable
    pub async fn initialize(&self) -> bool {
        if self.cycle.checks.is_empty() {
            tracing::error!("Health monitor has no registered checks");
            return false;
        }
        if let Err(e) = self.cycle.store.ping().await {
            tracing::error!(error = %e, "Health log store unreachable");
            return false;
        }
        tracing::info!(
            checks = ?self.registered(),
            core = ?self.config.core_components,
            "Health monitor initialized"
        );
        true
    }

    pub fn registered(&self) -> Vec<HealthComponent> {
        self.cycle.registered()
    }

    /// Run every check once, persisting each result, and aggregate
    pub async fn run_all_checks(&self) -> AggregatedHealth {
        self.cycle.run().await
    }

    /// Gate on pipeline readiness (bounded), then check every `interval`.
    /// False if already running.
    pub async fn start_monitoring(&self, interval: Option<Duration>) -> bool {
        let mut slot = self.workers.lock().await;
        if slot.is_some() {
            tracing::warn!("Health monitoring already running");
            return false;
        }

        let interval = interval.unwrap_or(self.config.check_interval);
        let poll = self.config.readiness_poll_interval;
        let max_wait = self.config.readiness_max_wait;
        let readiness = self.readiness.clone();
        let cycle = self.cycle.clone();

        let mut workers = Workers::new();
        let mut signal = workers.signal();
        workers.spawn("health-monitor", async move {
            tokio::select! {
                ready = wait_for_readiness(readiness.as_ref(), PipelineReadiness::is_ready, poll, max_wait) => {
                    if ready {
                        tracing::info!("Pipeline ready, health monitoring started");
                    } else {
                        tracing::warn!("Starting health monitoring without pipeline readiness");
                    }
                }
                _ = signal.stopped() => return,
            }

            loop {
                if signal.is_stopped() {
                    break;
                }
                cycle.run().await;
                if signal.sleep(interval).await {
                    break;
                }
            }
            tracing::info!("Health monitoring stopped");
        });

        *slot = Some(workers);
        tracing::info!(interval_secs = interval.as_secs(), "Health monitoring scheduled");
        true
    }

    pub async fn stop_monitoring(&self) {
        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            // one in-flight check plus slack
            workers.shutdown(self.config.check_timeout * 2).await;
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    pub async fn get_logs(&self, filter: &LogFilter, limit: u32, page: u32) -> Result<LogPage> {
        self.cycle.store.list_health_logs(filter, limit, page).await
    }

    /// Last aggregated result, if a cycle has completed
    pub async fn latest(&self) -> Option<AggregatedHealth> {
        self.cycle.latest.read().await.clone()
    }

    /// Snapshot including checks that have not reported yet
    pub async fn snapshot(&self) -> AggregatedHealth {
        let registered = self.registered();
        match self.latest().await {
            Some(mut health) => {
                health.missing = registered
                    .into_iter()
                    .filter(|c| !health.checks.iter().any(|r| &r.component == c))
                    .collect();
                health
            }
            None => AggregatedHealth {
                overall: aggregate(&registered, &[], &self.config.core_components),
                checks: Vec::new(),
                missing: registered,
                evaluated_at: Utc::now(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health_monitor::types::OverallStatus;
    use crate::readiness::AssumeReady;
    use crate::record_store::CheckStatus;
    use async_trait::async_trait;

    struct Fixed(HealthComponent, CheckStatus);

    #[async_trait]
    impl HealthCheck for Fixed {
        fn component(&self) -> HealthComponent {
            self.0.clone()
        }

        async fn run(&self) -> Result<CheckOutcome> {
            Ok(CheckOutcome {
                status: self.1,
                message: format!("{} fixed", self.0),
                details: None,
            })
        }
    }

    async fn temp_store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("health.db").display());
        (dir, RecordStore::open(&url).await.unwrap())
    }

    fn monitor(store: RecordStore, checks: Vec<Arc<dyn HealthCheck>>) -> HealthMonitor {
        let config = HealthMonitorConfig {
            check_timeout: Duration::from_millis(200),
            core_components: vec![HealthComponent::Camera],
            ..Default::default()
        };
        HealthMonitor::new(config, store, Arc::new(AssumeReady), checks)
    }

    #[tokio::test]
    async fn test_every_result_is_persisted() {
        let (_dir, store) = temp_store().await;
        let hm = monitor(
            store.clone(),
            vec![
                Arc::new(Fixed(HealthComponent::Camera, CheckStatus::Pass)),
                Arc::new(Fixed(HealthComponent::Disk, CheckStatus::Warning)),
            ],
        );
        assert!(hm.initialize().await);

        let health = hm.run_all_checks().await;
        assert_eq!(health.overall, OverallStatus::Degraded);

        let logs = hm.get_logs(&LogFilter::default(), 10, 1).await.unwrap();
        assert_eq!(logs.total, 2);
        assert_eq!(hm.latest().await.unwrap().overall, OverallStatus::Degraded);
    }

    #[tokio::test]
    async fn test_snapshot_before_first_cycle_is_unknown() {
        let (_dir, store) = temp_store().await;
        let hm = monitor(
            store,
            vec![Arc::new(Fixed(HealthComponent::Camera, CheckStatus::Pass))],
        );
        let snapshot = hm.snapshot().await;
        assert_eq!(snapshot.overall, OverallStatus::Unknown);
        assert_eq!(snapshot.missing, vec![HealthComponent::Camera]);
    }

    #[tokio::test]
    async fn test_empty_registry_does_not_initialize() {
        let (_dir, store) = temp_store().await;
        assert!(!monitor(store, vec![]).initialize().await);
    }

    #[tokio::test]
    async fn test_start_monitoring_runs_and_stops() {
        let (_dir, store) = temp_store().await;
        let hm = monitor(
            store,
            vec![Arc::new(Fixed(HealthComponent::Camera, CheckStatus::Pass))],
        );
        assert!(hm.start_monitoring(Some(Duration::from_millis(20))).await);
        assert!(!hm.start_monitoring(None).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        hm.stop_monitoring().await;
        assert!(!hm.is_monitoring().await);

        let logs = hm.get_logs(&LogFilter::default(), 100, 1).await.unwrap();
        assert!(logs.total >= 2, "expected several cycles, got {}", logs.total);
    }
}
