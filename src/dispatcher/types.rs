//! Communication Dispatcher type definitions
//!
//! ## 概要
//! 接続状態・プロトコル・送信統計・設定

use crate::config::DeviceIdentity;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================
// Offline Policy
// ============================================================

/// What the sender loops do with records while permanently offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicy {
    /// Leave records unsent so they are replayed once a collector appears
    Retain,
    /// Treat local processing as completion (sent=true, sent_at=now)
    MarkProcessed,
}

impl Default for OfflinePolicy {
    fn default() -> Self {
        Self::Retain
    }
}

impl std::fmt::Display for OfflinePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retain => write!(f, "retain"),
            Self::MarkProcessed => write!(f, "mark_processed"),
        }
    }
}

impl std::str::FromStr for OfflinePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "mark_processed" | "mark-processed" => Ok(Self::MarkProcessed),
            other => Err(format!(
                "OFFLINE_POLICY: expected 'retain' or 'mark_processed', got '{}'",
                other
            )),
        }
    }
}

// ============================================================
// Protocol / Phase
// ============================================================

/// Channel currently carrying traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Unset,
    Primary,
    Fallback,
    Offline,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Unset
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "unset"),
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Uninitialized,
    Negotiating,
    ConnectedPrimary,
    ConnectedFallback,
    Offline,
}

impl Default for ConnectionPhase {
    fn default() -> Self {
        Self::Uninitialized
    }
}

impl ConnectionPhase {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Uninitialized | Self::Negotiating => Protocol::Unset,
            Self::ConnectedPrimary => Protocol::Primary,
            Self::ConnectedFallback => Protocol::Fallback,
            Self::Offline => Protocol::Offline,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::ConnectedPrimary | Self::ConnectedFallback)
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::ConnectedPrimary => write!(f, "connected_primary"),
            Self::ConnectedFallback => write!(f, "connected_fallback"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

// ============================================================
// Status snapshot
// ============================================================

/// Per-stream counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub sent: u64,
    pub failed: u64,
    pub locally_processed: u64,
    /// Health entries skipped after repeated rejection
    pub dead_lettered: u64,
    /// Consecutive failed attempts since the last success
    pub retry_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Dispatcher state shared by the connection owner, both loops and the status API
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStatus {
    pub phase: ConnectionPhase,
    pub protocol: Protocol,
    pub connected: bool,
    /// No collector configured: offline for the life of the process
    pub permanent_offline: bool,
    /// Failed negotiation/send attempts since the last successful connect
    pub retry_count: u32,
    /// Incremented on every successful (re)connect; loops replay when it changes
    pub connection_epoch: u64,
    pub detection: StreamStats,
    pub health: StreamStats,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
}

impl DispatcherStatus {
    /// The only way phase changes; keeps `protocol` and `connected` consistent with it
    pub fn enter(&mut self, phase: ConnectionPhase) {
        self.phase = phase;
        self.protocol = phase.protocol();
        self.connected = phase.is_connected();
        if self.connected {
            self.next_probe_at = None;
        }
    }
}

// ============================================================
// Config
// ============================================================

/// Collector addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorEndpoint {
    /// Base URL of the request/response API
    pub base_url: Url,
    /// Duplex channel URL
    pub ws_url: Url,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub device: DeviceIdentity,
    /// None = permanent offline
    pub collector: Option<CollectorEndpoint>,
    pub detection_poll_interval: Duration,
    pub health_poll_interval: Duration,
    pub batch_size: u32,
    pub handshake_timeout: Duration,
    pub send_timeout: Duration,
    /// Idle time after which the owner sends a liveness ping
    pub liveness_interval: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Join deadline for `stop`
    pub stop_timeout: Duration,
    pub offline_policy: OfflinePolicy,
    /// Refusals after which a health entry is dead-lettered
    pub reject_retry_limit: u32,
}

impl DispatcherConfig {
    /// Defaults used when nothing is configured; the collector stays absent
    pub fn offline(device: DeviceIdentity) -> Self {
        Self {
            device,
            collector: None,
            detection_poll_interval: Duration::from_secs(defaults::DETECTION_POLL_SECS),
            health_poll_interval: Duration::from_secs(defaults::HEALTH_POLL_SECS),
            batch_size: defaults::BATCH_SIZE,
            handshake_timeout: Duration::from_secs(defaults::HANDSHAKE_TIMEOUT_SECS),
            send_timeout: Duration::from_secs(defaults::SEND_TIMEOUT_SECS),
            liveness_interval: Duration::from_secs(defaults::LIVENESS_INTERVAL_SECS),
            reconnect_base: Duration::from_secs(defaults::RECONNECT_BASE_SECS),
            reconnect_max: Duration::from_secs(defaults::RECONNECT_MAX_SECS),
            stop_timeout: Duration::from_secs(defaults::STOP_TIMEOUT_SECS),
            offline_policy: OfflinePolicy::default(),
            reject_retry_limit: defaults::REJECT_RETRY_LIMIT,
        }
    }
}

pub mod defaults {
    pub const DETECTION_POLL_SECS: u64 = 5;
    pub const HEALTH_POLL_SECS: u64 = 30;
    pub const BATCH_SIZE: u32 = 50;
    pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
    pub const SEND_TIMEOUT_SECS: u64 = 15;
    pub const LIVENESS_INTERVAL_SECS: u64 = 30;
    pub const RECONNECT_BASE_SECS: u64 = 5;
    pub const RECONNECT_MAX_SECS: u64 = 300;
    pub const STOP_TIMEOUT_SECS: u64 = 10;
    pub const REJECT_RETRY_LIMIT: u32 = 5;
    /// Depth of the send request queue feeding the connection owner
    pub const COMMAND_QUEUE_DEPTH: usize = 64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_protocol_never_connected() {
        let mut status = DispatcherStatus::default();
        status.enter(ConnectionPhase::ConnectedPrimary);
        assert!(status.connected);
        assert_eq!(status.protocol, Protocol::Primary);

        status.enter(ConnectionPhase::Offline);
        assert_eq!(status.protocol, Protocol::Offline);
        assert!(!status.connected);

        status.enter(ConnectionPhase::Negotiating);
        assert_eq!(status.protocol, Protocol::Unset);
        assert!(!status.connected);
    }

    #[test]
    fn test_offline_policy_parse() {
        assert_eq!("RETAIN".parse::<OfflinePolicy>(), Ok(OfflinePolicy::Retain));
        assert_eq!(
            "mark-processed".parse::<OfflinePolicy>(),
            Ok(OfflinePolicy::MarkProcessed)
        );
        assert!("discard".parse::<OfflinePolicy>().is_err());
        assert_eq!(OfflinePolicy::MarkProcessed.to_string(), "mark_processed");
    }
}
