use std::time::Duration;

use serde::{Deserialize, Serialize};

const TOKEN_EPSILON: f64 = 1e-9;

/// Persisted token bucket. `tokens` is kept within `[0, capacity]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateBudget {
    pub tokens: f64,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub last_refill_unix_ms: u64,
}

impl RateBudget {
    pub fn full(capacity: f64, refill_per_second: f64, now_unix_ms: u64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_second,
            last_refill_unix_ms: now_unix_ms,
        }
    }

    /// Applies a changed configuration without granting free tokens.
    pub fn reconfigure(&mut self, capacity: f64, refill_per_second: f64) {
        self.capacity = capacity;
        self.refill_per_second = refill_per_second;
        self.tokens = self.tokens.clamp(0.0, capacity);
    }

    pub fn refill(&mut self, now_unix_ms: u64) {
        // A clock that moved backwards refills nothing.
        let elapsed_ms = now_unix_ms.saturating_sub(self.last_refill_unix_ms);
        let elapsed_secs = elapsed_ms as f64 / 1_000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_per_second).clamp(0.0, self.capacity);
        self.last_refill_unix_ms = self.last_refill_unix_ms.max(now_unix_ms);
    }

    /// Refills, then deducts `requested` tokens or returns the wait until they exist.
    pub fn try_take(&mut self, requested: f64, now_unix_ms: u64) -> Result<(), Duration> {
        self.refill(now_unix_ms);
        if self.tokens + TOKEN_EPSILON >= requested {
            self.tokens = (self.tokens - requested).max(0.0);
            return Ok(());
        }
        Err(self.wait_for(requested))
    }

    /// Time until `requested` tokens accumulate, rounded up to whole milliseconds.
    pub fn wait_for(&self, requested: f64) -> Duration {
        let missing = (requested - self.tokens).max(0.0);
        if missing <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        let wait_ms = (missing / self.refill_per_second * 1_000.0).ceil();
        Duration::from_millis(wait_ms.max(1.0) as u64)
    }
}
