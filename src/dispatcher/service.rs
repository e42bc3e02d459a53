//! Communication Dispatcher service
//!
//! ## Responsibilities
//!
//! - Negotiate the collector channel once at `initialize` (never fails on network)
//! - Run the connection owner plus two sender loops (detections, health logs)
//! - Replay the backlog oldest-first whenever a new connection comes up
//! - Keep records unsent on any failure; only a delivered item is marked sent
//! - Hold refused items on a per-item backoff so they never block newer records
//! - Process records locally with zero network I/O when no collector is configured

use super::backoff::HeldItems;
use super::channel::{ChannelConnector, NetworkConnector, TransportError};
use super::connection::{ConnectionHandle, ConnectionOwner, SendError};
use super::envelope::Envelope;
use super::types::{defaults, DispatcherConfig, DispatcherStatus, OfflinePolicy, StreamStats};
use crate::error::Result;
use crate::record_store::{RecordStore, StreamKind};
use crate::worker::{StopSignal, Workers};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};

pub struct Dispatcher {
    config: Arc<DispatcherConfig>,
    store: RecordStore,
    connector: Option<Arc<dyn ChannelConnector>>,
    status: Arc<RwLock<DispatcherStatus>>,
    /// Negotiated owner waiting to be moved into its task by `start`
    owner: Mutex<Option<ConnectionOwner>>,
    workers: Mutex<Option<Workers>>,
}

impl Dispatcher {
    /// Production wiring: network connector when a collector is configured
    pub fn new(config: DispatcherConfig, store: RecordStore) -> Result<Self> {
        let connector = match &config.collector {
            Some(endpoint) => {
                Some(NetworkConnector::new(endpoint.clone(), config.send_timeout)?.into_shared())
            }
            None => None,
        };
        Ok(Self::with_connector(config, store, connector))
    }

    /// Explicit connector; `None` means permanently offline
    pub fn with_connector(
        config: DispatcherConfig,
        store: RecordStore,
        connector: Option<Arc<dyn ChannelConnector>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            connector,
            status: Arc::new(RwLock::new(DispatcherStatus::default())),
            owner: Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    /// Negotiate once and record the resulting state. Always returns true.
    pub async fn initialize(&self) -> bool {
        let mut owner = ConnectionOwner::new(
            self.config.clone(),
            self.connector.clone(),
            self.status.clone(),
        );
        owner.negotiate().await;

        let status = self.status.read().await;
        tracing::info!(
            phase = %status.phase,
            protocol = %status.protocol,
            offline_policy = %self.config.offline_policy,
            "Dispatcher initialized"
        );
        drop(status);

        *self.owner.lock().await = Some(owner);
        true
    }

    /// Spawn the connection owner and both sender loops. False if already running.
    pub async fn start(&self) -> bool {
        let mut workers_slot = self.workers.lock().await;
        if workers_slot.is_some() {
            tracing::warn!("Dispatcher already running");
            return false;
        }

        let pending = self.owner.lock().await.take();
        let owner = match pending {
            Some(owner) => owner,
            None => {
                self.initialize().await;
                match self.owner.lock().await.take() {
                    Some(owner) => owner,
                    None => return false,
                }
            }
        };

        let (tx, rx) = mpsc::channel(defaults::COMMAND_QUEUE_DEPTH);
        let handle = ConnectionHandle::new(tx);
        let mut workers = Workers::new();

        workers.spawn("connection-owner", owner.run(rx, workers.signal()));

        for kind in [StreamKind::Detection, StreamKind::Health] {
            let sender = StreamSender {
                kind,
                config: self.config.clone(),
                store: self.store.clone(),
                handle: handle.clone(),
                status: self.status.clone(),
                seen_epoch: 0,
                local_mark: 0,
                held: HeldItems::new(self.config.reconnect_base, self.config.reconnect_max),
            };
            let name = match kind {
                StreamKind::Detection => "detection-sender",
                StreamKind::Health => "health-sender",
            };
            workers.spawn(name, sender.run(workers.signal()));
        }

        *workers_slot = Some(workers);
        tracing::info!("Dispatcher started");
        true
    }

    /// Stop all loops (joined within the configured timeout) and close the channel
    pub async fn stop(&self) {
        let workers = self.workers.lock().await.take();
        let Some(workers) = workers else {
            return;
        };
        let aborted = workers.shutdown(self.config.stop_timeout).await;

        let mut status = self.status.write().await;
        status.enter(super::types::ConnectionPhase::Uninitialized);
        tracing::info!(aborted = aborted, "Dispatcher stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Snapshot for dashboards
    pub async fn status(&self) -> DispatcherStatus {
        self.status.read().await.clone()
    }
}

// ============================================================
// Sender loop
// ============================================================

/// Item pulled from the store, ready to send
struct Pending {
    id: i64,
    envelope: Envelope,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    fetched: usize,
    delivered: usize,
    /// Stopped early on a transport or store failure
    interrupted: bool,
}

/// One loop per stream; detections and health logs differ only in fetch/commit
struct StreamSender {
    kind: StreamKind,
    config: Arc<DispatcherConfig>,
    store: RecordStore,
    handle: ConnectionHandle,
    status: Arc<RwLock<DispatcherStatus>>,
    /// Connection epoch this loop last replayed for
    seen_epoch: u64,
    /// Highest id processed locally while offline under the retain policy
    local_mark: i64,
    /// Items the collector refused, each on its own backoff
    held: HeldItems,
}

impl StreamSender {
    fn interval(&self) -> std::time::Duration {
        match self.kind {
            StreamKind::Detection => self.config.detection_poll_interval,
            StreamKind::Health => self.config.health_poll_interval,
        }
    }

    async fn run(mut self, mut stop: StopSignal) {
        tracing::info!(stream = %self.kind, "Sender loop started");
        loop {
            if stop.is_stopped() {
                break;
            }
            self.cycle(&stop).await;
            if stop.sleep(self.interval()).await {
                break;
            }
        }
        tracing::info!(stream = %self.kind, "Sender loop stopped");
    }

    async fn cycle(&mut self, stop: &StopSignal) {
        let (permanent_offline, connected, epoch) = {
            let status = self.status.read().await;
            (status.permanent_offline, status.connected, status.connection_epoch)
        };

        if permanent_offline {
            self.process_locally().await;
            return;
        }
        if !connected {
            // re-probing is the connection owner's job
            tracing::trace!(stream = %self.kind, "Not connected, skipping cycle");
            return;
        }

        if epoch != self.seen_epoch {
            self.seen_epoch = epoch;
            self.replay(stop).await;
            return;
        }

        self.send_batch(false).await;
    }

    /// Drain the backlog batch after batch without sleeping
    async fn replay(&mut self, stop: &StopSignal) {
        let mut total = 0usize;
        loop {
            if stop.is_stopped() {
                break;
            }
            let outcome = self.send_batch(true).await;
            total += outcome.delivered;
            if outcome.interrupted
                || outcome.delivered == 0
                || outcome.fetched < self.config.batch_size as usize
            {
                break;
            }
        }
        if total > 0 {
            tracing::info!(stream = %self.kind, replayed = total, "Backlog replayed");
        }
    }

    async fn fetch(&self, after: Option<i64>) -> Result<Vec<Pending>> {
        let limit = self.config.batch_size;
        let device = &self.config.device;
        match self.kind {
            StreamKind::Detection => {
                let records = match after {
                    Some(mark) => self.store.fetch_unsent_after(mark, limit).await?,
                    None => {
                        let held = self.held.waiting(Instant::now());
                        self.store.fetch_unsent_excluding(&held, limit).await?
                    }
                };
                Ok(records
                    .iter()
                    .map(|r| Pending {
                        id: r.id,
                        envelope: Envelope::detection(device, r),
                    })
                    .collect())
            }
            StreamKind::Health => {
                let cursor = self.store.get_cursor(StreamKind::Health).await?;
                let from = after.map_or(cursor, |mark| mark.max(cursor));
                let entries = self.store.health_logs_after(from, limit).await?;
                Ok(entries
                    .iter()
                    .map(|e| Pending {
                        id: e.id,
                        envelope: Envelope::health(device, e),
                    })
                    .collect())
            }
        }
    }

    /// Record delivery of one item. Returns whether the store changed.
    async fn commit(&self, id: i64) -> Result<bool> {
        match self.kind {
            StreamKind::Detection => self.store.mark_sent(id, Utc::now()).await,
            StreamKind::Health => {
                self.store.advance_cursor(StreamKind::Health, id).await?;
                Ok(true)
            }
        }
    }

    async fn update_stats<F: FnOnce(&mut StreamStats)>(&self, f: F) {
        let mut status = self.status.write().await;
        match self.kind {
            StreamKind::Detection => f(&mut status.detection),
            StreamKind::Health => f(&mut status.health),
        }
    }

    async fn send_batch(&mut self, replay: bool) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        let items = match self.fetch(None).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(stream = %self.kind, error = %e, "Failed to read pending items");
                outcome.interrupted = true;
                return outcome;
            }
        };
        outcome.fetched = items.len();

        for item in items {
            if self.kind == StreamKind::Health && self.held.is_waiting(item.id, Instant::now()) {
                // head of the log is backing off; the cursor cannot pass it yet
                outcome.interrupted = true;
                break;
            }

            let attempt = {
                let status = self.status.read().await;
                match self.kind {
                    StreamKind::Detection => status.detection.retry_count,
                    StreamKind::Health => status.health.retry_count,
                }
            };
            self.update_stats(|s| s.last_attempt_at = Some(Utc::now())).await;

            let envelope = item.envelope.with_delivery(attempt, replay);
            match self.handle.send(envelope).await {
                Ok(()) => {
                    self.held.release(item.id);
                    match self.commit(item.id).await {
                        Ok(changed) => {
                            outcome.delivered += 1;
                            self.update_stats(|s| {
                                if changed {
                                    s.sent += 1;
                                }
                                s.retry_count = 0;
                                s.last_success_at = Some(Utc::now());
                            })
                            .await;
                            tracing::debug!(stream = %self.kind, id = item.id, "Delivered");
                        }
                        Err(e) => {
                            // delivered but not recorded: stays unsent, resent later (receiver dedups)
                            tracing::error!(
                                stream = %self.kind,
                                id = item.id,
                                error = %e,
                                "Failed to record delivery"
                            );
                            outcome.interrupted = true;
                            break;
                        }
                    }
                }
                Err(SendError::Transport(TransportError::Rejected(reason))) => {
                    if !self.on_rejected(item.id, &reason).await {
                        outcome.interrupted = true;
                        break;
                    }
                }
                Err(e) => {
                    self.update_stats(|s| {
                        s.failed += 1;
                        s.retry_count = s.retry_count.saturating_add(1);
                    })
                    .await;
                    tracing::warn!(
                        stream = %self.kind,
                        id = item.id,
                        error = %e,
                        "Send failed, item left unsent"
                    );
                    outcome.interrupted = true;
                    break;
                }
            }
        }

        outcome
    }

    /// Hold a refused item on its own backoff. Returns whether the batch may continue.
    ///
    /// Detections stay unsent and are skipped until their hold expires. A health
    /// entry blocks the cursor, so after `reject_retry_limit` refusals it is
    /// dead-lettered: the cursor moves past it without delivery.
    async fn on_rejected(&mut self, id: i64, reason: &str) -> bool {
        let (rejections, delay) = self.held.hold(id, Instant::now());
        self.update_stats(|s| {
            s.failed += 1;
            s.retry_count = s.retry_count.saturating_add(1);
        })
        .await;

        match self.kind {
            StreamKind::Detection => {
                tracing::warn!(
                    stream = %self.kind,
                    id = id,
                    reason = %reason,
                    rejections = rejections,
                    retry_in_ms = delay.as_millis() as u64,
                    "Item rejected, held back"
                );
                true
            }
            StreamKind::Health if rejections >= self.config.reject_retry_limit => {
                if let Err(e) = self.commit(id).await {
                    tracing::error!(stream = %self.kind, id = id, error = %e, "Failed to skip rejected entry");
                    return false;
                }
                self.held.release(id);
                self.update_stats(|s| s.dead_lettered += 1).await;
                tracing::error!(
                    stream = %self.kind,
                    id = id,
                    reason = %reason,
                    rejections = rejections,
                    "Entry rejected repeatedly, dead-lettered"
                );
                true
            }
            StreamKind::Health => {
                tracing::warn!(
                    stream = %self.kind,
                    id = id,
                    reason = %reason,
                    rejections = rejections,
                    retry_in_ms = delay.as_millis() as u64,
                    "Entry rejected, cursor held"
                );
                false
            }
        }
    }

    /// Permanent offline: no network I/O, apply the offline policy
    async fn process_locally(&mut self) {
        let after = match self.config.offline_policy {
            OfflinePolicy::Retain => Some(self.local_mark),
            OfflinePolicy::MarkProcessed => None,
        };
        let items = match self.fetch(after).await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(stream = %self.kind, error = %e, "Failed to read pending items");
                return;
            }
        };
        if items.is_empty() {
            return;
        }

        let mut processed = 0u64;
        for item in &items {
            if self.config.offline_policy == OfflinePolicy::MarkProcessed {
                if let Err(e) = self.commit(item.id).await {
                    tracing::error!(stream = %self.kind, id = item.id, error = %e, "Failed to mark processed");
                    break;
                }
            }
            self.local_mark = self.local_mark.max(item.id);
            processed += 1;
        }

        self.update_stats(|s| s.locally_processed += processed).await;
        tracing::debug!(
            stream = %self.kind,
            processed = processed,
            policy = %self.config.offline_policy,
            "Processed locally (offline)"
        );
    }
}
