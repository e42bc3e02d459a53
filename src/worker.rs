//! Background loop lifecycle
//!
//! Every periodic loop (health checks, senders, storage reconcile, connection
//! owner) is spawned through `Workers`, which owns the join handles and a
//! shared stop signal. Loops check the signal before sleeping and right after
//! waking; `shutdown` joins them within a deadline and aborts stragglers.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Receiver side of the stop signal, cloned into each loop
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `period` unless stopped first. Returns true when the loop should exit.
    pub async fn sleep(&mut self, period: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            changed = self.rx.changed() => {
                if changed.is_err() {
                    // sender dropped: owner is gone
                    return true;
                }
            }
        }
        self.is_stopped()
    }

    /// Resolves once stop has been requested
    pub async fn stopped(&mut self) {
        while !self.is_stopped() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Set of spawned loops sharing one stop signal
pub struct Workers {
    stop_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

impl Workers {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            handles: Vec::new(),
        }
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_tx.subscribe(),
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(worker = name, "Spawning worker");
        self.handles.push((name, tokio::spawn(task)));
    }

    /// Signal stop and join every loop within `timeout`. Returns the number aborted.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        let _ = self.stop_tx.send(true);
        let deadline = Instant::now() + timeout;
        let mut aborted = 0;

        for (name, mut handle) in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!(worker = name, "Worker stopped"),
                Ok(Err(e)) => tracing::warn!(worker = name, error = %e, "Worker ended abnormally"),
                Err(_) => {
                    tracing::warn!(worker = name, "Worker did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let mut workers = Workers::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut signal = workers.signal();
        let counter = ticks.clone();
        workers.spawn("ticker", async move {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                if signal.sleep(Duration::from_secs(3600)).await {
                    break;
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = std::time::Instant::now();
        let aborted = workers.shutdown(Duration::from_secs(2)).await;
        assert_eq!(aborted, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_worker_is_aborted() {
        let mut workers = Workers::new();
        workers.spawn("stubborn", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let aborted = workers.shutdown(Duration::from_millis(50)).await;
        assert_eq!(aborted, 1);
    }
}
