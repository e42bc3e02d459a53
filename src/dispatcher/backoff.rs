//! Reconnection and per-item rejection backoff

use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Jitter applied around the nominal delay (±20%)
const JITTER_RATIO: f64 = 0.2;

/// Nominal delay: `base * 2^attempt`, capped at `max`. `attempt` starts at 0.
pub fn nominal_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Nominal delay with jitter, kept within [base / 2, max]
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let nominal = nominal_delay(attempt, base, max).as_secs_f64();
    let factor = rand::thread_rng().gen_range((1.0 - JITTER_RATIO)..=(1.0 + JITTER_RATIO));
    let jittered = Duration::from_secs_f64(nominal * factor);
    jittered.clamp(base / 2, max.max(base / 2))
}

/// Items the collector refused, each waiting out its own backoff
#[derive(Debug)]
pub struct HeldItems {
    base: Duration,
    max: Duration,
    entries: HashMap<i64, Held>,
}

#[derive(Debug, Clone, Copy)]
struct Held {
    rejections: u32,
    retry_at: Instant,
}

impl HeldItems {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            entries: HashMap::new(),
        }
    }

    /// Record a rejection. Returns the rejection count for `id` and its delay.
    pub fn hold(&mut self, id: i64, now: Instant) -> (u32, Duration) {
        let rejections = self.entries.get(&id).map_or(0, |h| h.rejections) + 1;
        let delay = nominal_delay(rejections - 1, self.base, self.max);
        self.entries.insert(
            id,
            Held {
                rejections,
                retry_at: now + delay,
            },
        );
        (rejections, delay)
    }

    /// Accepted or given up on
    pub fn release(&mut self, id: i64) {
        self.entries.remove(&id);
    }

    pub fn is_waiting(&self, id: i64, now: Instant) -> bool {
        self.entries.get(&id).is_some_and(|h| h.retry_at > now)
    }

    /// Ids still inside their backoff window, ascending
    pub fn waiting(&self, now: Instant) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, h)| h.retry_at > now)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
