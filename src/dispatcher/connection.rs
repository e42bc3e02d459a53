//! Connection owner
//!
//! A single task owns the collector channel. Sender loops never touch the
//! network directly: they submit `Command::Send` over an mpsc queue and await
//! the oneshot reply. Negotiation, re-probing and liveness pings happen only
//! inside this task, so two loops can never renegotiate concurrently.
//!
//! ```text
//! Uninitialized ─initialize─▶ Negotiating ─primary ok──▶ ConnectedPrimary
//!                                 │        ─fallback ok─▶ ConnectedFallback
//!                                 └─both fail─▶ Offline ─backoff─▶ Negotiating
//! Connected* ─send/ping failure─▶ Offline (probe scheduled)
//! ```

use super::backoff::reconnect_delay;
use super::channel::{ChannelConnector, CollectorChannel, TransportError};
use super::envelope::Envelope;
use super::types::{ConnectionPhase, DispatcherConfig, DispatcherStatus};
use crate::worker::StopSignal;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;

/// Idle wakeup when nothing is scheduled
const IDLE_WAKEUP: Duration = Duration::from_secs(3600);

/// Why a send was not delivered
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No channel is up; no network I/O was attempted
    #[error("offline")]
    Offline,
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Connection owner has shut down
    #[error("connection owner stopped")]
    Closed,
}

pub(crate) enum Command {
    Send {
        envelope: Envelope,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
}

/// Cloneable submission handle used by the sender loops
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { envelope, reply })
            .await
            .map_err(|_| SendError::Closed)?;
        rx.await.map_err(|_| SendError::Closed)?
    }
}

pub struct ConnectionOwner {
    config: Arc<DispatcherConfig>,
    /// None when no collector is configured
    connector: Option<Arc<dyn ChannelConnector>>,
    status: Arc<RwLock<DispatcherStatus>>,
    channel: Option<Box<dyn CollectorChannel>>,
    next_probe: Option<Instant>,
    last_activity: Instant,
}

impl ConnectionOwner {
    pub fn new(
        config: Arc<DispatcherConfig>,
        connector: Option<Arc<dyn ChannelConnector>>,
        status: Arc<RwLock<DispatcherStatus>>,
    ) -> Self {
        Self {
            config,
            connector,
            status,
            channel: None,
            next_probe: None,
            last_activity: Instant::now(),
        }
    }

    /// Primary handshake, then fallback handshake, each bounded; otherwise Offline.
    /// Never returns an error: an unreachable collector is a state, not a failure.
    pub async fn negotiate(&mut self) -> bool {
        let Some(connector) = self.connector.clone() else {
            let mut status = self.status.write().await;
            status.permanent_offline = true;
            status.enter(ConnectionPhase::Offline);
            tracing::info!("No collector configured, running permanently offline");
            return false;
        };

        self.drop_channel().await;
        self.status.write().await.enter(ConnectionPhase::Negotiating);

        let registration = Envelope::registration(&self.config.device);
        let timeout = self.config.handshake_timeout;

        match tokio::time::timeout(timeout, connector.connect_primary(&registration)).await {
            Ok(Ok(channel)) => {
                self.on_connected(channel, ConnectionPhase::ConnectedPrimary).await;
                return true;
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Primary channel handshake failed, trying fallback")
            }
            Err(_) => tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Primary channel handshake timed out, trying fallback"
            ),
        }

        match tokio::time::timeout(timeout, connector.connect_fallback(&registration)).await {
            Ok(Ok(channel)) => {
                self.on_connected(channel, ConnectionPhase::ConnectedFallback).await;
                true
            }
            Ok(Err(e)) => {
                self.on_unreachable(format!("fallback handshake failed: {}", e)).await;
                false
            }
            Err(_) => {
                self.on_unreachable(format!(
                    "fallback handshake timed out after {}s",
                    timeout.as_secs()
                ))
                .await;
                false
            }
        }
    }

    async fn on_connected(&mut self, channel: Box<dyn CollectorChannel>, phase: ConnectionPhase) {
        let protocol = channel.protocol();
        self.channel = Some(channel);
        self.next_probe = None;
        self.last_activity = Instant::now();

        let mut status = self.status.write().await;
        status.enter(phase);
        status.retry_count = 0;
        status.connection_epoch += 1;
        status.last_connected_at = Some(Utc::now());
        status.last_error = None;

        tracing::info!(
            protocol = %protocol,
            epoch = status.connection_epoch,
            "Connected to collector"
        );
    }

    /// Enter Offline and schedule the next probe on backoff
    async fn on_unreachable(&mut self, reason: String) {
        self.drop_channel().await;

        let mut status = self.status.write().await;
        let delay = reconnect_delay(
            status.retry_count,
            self.config.reconnect_base,
            self.config.reconnect_max,
        );
        status.retry_count = status.retry_count.saturating_add(1);
        status.enter(ConnectionPhase::Offline);
        status.last_error = Some(reason.clone());
        status.next_probe_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        self.next_probe = Some(Instant::now() + delay);

        tracing::warn!(
            reason = %reason,
            retry_count = status.retry_count,
            retry_in_secs = delay.as_secs(),
            "Collector unreachable"
        );
    }

    async fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
    }

    async fn handle_send(&mut self, envelope: Envelope) -> Result<(), SendError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(SendError::Offline);
        };

        let timeout = self.config.send_timeout;
        let result = match tokio::time::timeout(timeout, channel.send(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(TransportError::Rejected(reason)) => {
                // the connection itself is fine; the item stays unsent
                self.last_activity = Instant::now();
                tracing::warn!(
                    message_id = %envelope.message_id,
                    reason = %reason,
                    "Collector rejected message"
                );
                Err(SendError::Transport(TransportError::Rejected(reason)))
            }
            Err(e) => {
                self.on_unreachable(format!("send failed: {}", e)).await;
                Err(SendError::Transport(e))
            }
        }
    }

    async fn send_liveness_ping(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        let envelope = Envelope::ping(&self.config.device);
        let timeout = self.config.send_timeout;

        match tokio::time::timeout(timeout, channel.ping(&envelope)).await {
            Ok(Ok(())) => {
                self.last_activity = Instant::now();
                tracing::debug!("Liveness ping acknowledged");
            }
            Ok(Err(e)) => self.on_unreachable(format!("liveness ping failed: {}", e)).await,
            Err(_) => {
                self.on_unreachable(format!(
                    "liveness ping timed out after {}s",
                    timeout.as_secs()
                ))
                .await
            }
        }
    }

    fn next_wakeup(&self) -> Instant {
        if self.channel.is_some() {
            return self.last_activity + self.config.liveness_interval;
        }
        match (self.connector.is_some(), self.next_probe) {
            (true, Some(at)) => at,
            _ => Instant::now() + IDLE_WAKEUP,
        }
    }

    async fn on_timer(&mut self) {
        if self.channel.is_some() {
            if self.last_activity.elapsed() >= self.config.liveness_interval {
                self.send_liveness_ping().await;
            }
            return;
        }
        if let Some(at) = self.next_probe {
            if Instant::now() >= at {
                tracing::info!("Re-probing collector");
                self.negotiate().await;
            }
        }
    }

    /// Serve send requests until stopped, then close the channel
    pub async fn run(mut self, mut rx: mpsc::Receiver<Command>, mut stop: StopSignal) {
        loop {
            if stop.is_stopped() {
                break;
            }
            let wake = self.next_wakeup();

            tokio::select! {
                _ = stop.stopped() => break,
                command = rx.recv() => match command {
                    Some(Command::Send { envelope, reply }) => {
                        let result = self.handle_send(envelope).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(wake) => self.on_timer().await,
            }
        }

        self.drop_channel().await;
        tracing::info!("Connection owner stopped");
    }
}
