use serde::{Deserialize, Serialize};

/// Persisted breaker state. While tripped, `now < cooldown_until_unix_ms`
/// holds until the first observer heals it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    #[serde(default)]
    pub tripped: bool,
    #[serde(default)]
    pub tripped_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub cooldown_until_unix_ms: Option<u64>,
    #[serde(default)]
    pub trip_count: u64,
    #[serde(default)]
    pub last_throttle_secs: Option<u64>,
}

/// Result of observing the breaker at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitCheck {
    Closed,
    Healed,
    Open { remaining_ms: u64 },
}

impl CircuitState {
    pub fn trip(&mut self, now_unix_ms: u64, cooldown_ms: u64, throttle_secs: u64) {
        self.tripped = true;
        self.tripped_at_unix_ms = Some(now_unix_ms);
        self.cooldown_until_unix_ms = Some(now_unix_ms.saturating_add(cooldown_ms));
        self.trip_count = self.trip_count.saturating_add(1);
        self.last_throttle_secs = Some(throttle_secs);
    }

    /// Heals the breaker when the cooldown has elapsed.
    pub fn observe(&mut self, now_unix_ms: u64) -> CircuitCheck {
        if !self.tripped {
            return CircuitCheck::Closed;
        }
        match self.cooldown_until_unix_ms {
            Some(until) if now_unix_ms < until => CircuitCheck::Open {
                remaining_ms: until - now_unix_ms,
            },
            _ => {
                self.tripped = false;
                self.cooldown_until_unix_ms = None;
                CircuitCheck::Healed
            }
        }
    }

    /// Non-mutating view used by snapshots.
    pub fn is_open_at(&self, now_unix_ms: u64) -> bool {
        self.tripped
            && self
                .cooldown_until_unix_ms
                .is_some_and(|until| now_unix_ms < until)
    }
}
