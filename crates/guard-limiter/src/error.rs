use guard_core::StoreError;
use thiserror::Error;

/// Signal returned by a remote service gateway call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("remote service throttled the call; retry after {retry_after_secs}s")]
    Throttled { retry_after_secs: u64 },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("quota '{counter}' exhausted ({used}/{limit}); resets in {resets_in_secs}s")]
    QuotaExceeded {
        counter: String,
        used: u64,
        limit: u64,
        resets_in_secs: u64,
    },
    #[error("circuit breaker is open; retry after {retry_after_secs}s")]
    CircuitOpen { retry_after_secs: u64 },
    #[error("remote service demanded a {retry_after_secs}s wait; circuit tripped: {circuit_tripped}")]
    Throttled {
        retry_after_secs: u64,
        circuit_tripped: bool,
    },
    #[error("still throttled after {attempts} attempts (last wait {last_retry_after_secs}s)")]
    ThrottledExhausted {
        attempts: u32,
        last_retry_after_secs: u64,
    },
    #[error("cannot acquire {requested} tokens from a bucket of capacity {capacity}")]
    InvalidTokenRequest { requested: f64, capacity: f64 },
    #[error("remote call failed: {0:#}")]
    Remote(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LimiterError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Throttled { .. } => "throttled",
            Self::ThrottledExhausted { .. } => "throttled_exhausted",
            Self::InvalidTokenRequest { .. } => "invalid_token_request",
            Self::Remote(_) => "remote_error",
            Self::Store(error) if error.is_lock_timeout() => "lock_timeout",
            Self::Store(_) => "state_store_error",
        }
    }

    /// Seconds the caller should wait before trying again, when known.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::QuotaExceeded { resets_in_secs, .. } => Some(*resets_in_secs),
            Self::CircuitOpen { retry_after_secs } => Some(*retry_after_secs),
            Self::Throttled {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            Self::ThrottledExhausted {
                last_retry_after_secs,
                ..
            } => Some(*last_retry_after_secs),
            _ => None,
        }
    }

    /// Conditions that should stop a sequence of writes instead of moving on
    /// to the next item.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. }
                | Self::CircuitOpen { .. }
                | Self::Throttled { .. }
                | Self::ThrottledExhausted { .. }
        )
    }
}
