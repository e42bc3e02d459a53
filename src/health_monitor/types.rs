//! Health Monitor type definitions

use crate::record_store::{CheckStatus, HealthComponent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    /// Per-check deadline
    pub check_timeout: Duration,
    /// A FAIL in any of these makes the node CRITICAL
    pub core_components: Vec<HealthComponent>,
    pub readiness_poll_interval: Duration,
    /// Monitoring starts anyway once this elapses
    pub readiness_max_wait: Duration,
    pub cpu_warn_percent: f32,
    pub cpu_fail_percent: f32,
    pub ram_warn_percent: f32,
    pub ram_fail_percent: f32,
    pub model_paths: Vec<PathBuf>,
    /// host:port reached by the network check
    pub network_probe_addr: String,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            check_timeout: Duration::from_secs(10),
            core_components: vec![HealthComponent::Camera, HealthComponent::Models],
            readiness_poll_interval: Duration::from_secs(5),
            readiness_max_wait: Duration::from_secs(300),
            cpu_warn_percent: 85.0,
            cpu_fail_percent: 98.0,
            ram_warn_percent: 85.0,
            ram_fail_percent: 95.0,
            model_paths: Vec::new(),
            network_probe_addr: "1.1.1.1:443".to_string(),
        }
    }
}

/// What a single check reports
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Pass,
            message: message.into(),
            details: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warning,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Fail,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Outcome of one check in one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub component: HealthComponent,
    pub status: CheckStatus,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub duration_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// Node-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unknown,
    Unhealthy,
    Critical,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatedHealth {
    pub overall: OverallStatus,
    pub checks: Vec<CheckResult>,
    /// Registered checks with no result this cycle
    pub missing: Vec<HealthComponent>,
    pub evaluated_at: DateTime<Utc>,
}

/// Worst wins: CRITICAL > UNHEALTHY > UNKNOWN > DEGRADED > HEALTHY
pub fn aggregate(
    registered: &[HealthComponent],
    results: &[CheckResult],
    core: &[HealthComponent],
) -> OverallStatus {
    if registered.is_empty() && results.is_empty() {
        return OverallStatus::Unknown;
    }

    let mut overall = OverallStatus::Healthy;
    for result in results {
        let status = match result.status {
            CheckStatus::Fail if core.contains(&result.component) => OverallStatus::Critical,
            CheckStatus::Fail => OverallStatus::Unhealthy,
            CheckStatus::Warning => OverallStatus::Degraded,
            CheckStatus::Pass => OverallStatus::Healthy,
        };
        overall = overall.max(status);
    }

    let all_reported = registered
        .iter()
        .all(|c| results.iter().any(|r| &r.component == c));
    if !all_reported {
        overall = overall.max(OverallStatus::Unknown);
    }

    overall
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(component: HealthComponent, status: CheckStatus) -> CheckResult {
        CheckResult {
            component,
            status,
            message: String::new(),
            details: None,
            duration_ms: 0,
            checked_at: Utc::now(),
        }
    }

    fn all_components() -> Vec<HealthComponent> {
        vec![
            HealthComponent::Camera,
            HealthComponent::Disk,
            HealthComponent::Network,
        ]
    }

    #[test]
    fn test_all_pass_is_healthy() {
        let results: Vec<_> = all_components()
            .into_iter()
            .map(|c| result(c, CheckStatus::Pass))
            .collect();
        assert_eq!(
            aggregate(&all_components(), &results, &[HealthComponent::Camera]),
            OverallStatus::Healthy
        );
    }

    #[test]
    fn test_core_failure_is_critical_otherwise_unhealthy() {
        let results = vec![
            result(HealthComponent::Camera, CheckStatus::Fail),
            result(HealthComponent::Disk, CheckStatus::Pass),
            result(HealthComponent::Network, CheckStatus::Pass),
        ];
        assert_eq!(
            aggregate(&all_components(), &results, &[HealthComponent::Camera]),
            OverallStatus::Critical
        );
        assert_eq!(
            aggregate(&all_components(), &results, &[HealthComponent::Models]),
            OverallStatus::Unhealthy
        );
    }

    #[test]
    fn test_warning_is_degraded() {
        let results = vec![
            result(HealthComponent::Camera, CheckStatus::Pass),
            result(HealthComponent::Disk, CheckStatus::Warning),
            result(HealthComponent::Network, CheckStatus::Pass),
        ];
        assert_eq!(
            aggregate(&all_components(), &results, &[]),
            OverallStatus::Degraded
        );
    }

    #[test]
    fn test_missing_result_is_unknown_unless_something_failed() {
        let partial = vec![result(HealthComponent::Camera, CheckStatus::Warning)];
        assert_eq!(
            aggregate(&all_components(), &partial, &[]),
            OverallStatus::Unknown
        );

        let failed = vec![result(HealthComponent::Disk, CheckStatus::Fail)];
        assert_eq!(
            aggregate(&all_components(), &failed, &[]),
            OverallStatus::Unhealthy
        );
        assert_eq!(aggregate(&[], &[], &[]), OverallStatus::Unknown);
    }
}
