use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns true when `expires_unix_ms` is present and no longer in the future.
pub fn is_expired_unix(expires_unix_ms: Option<u64>, now_unix_ms: u64) -> bool {
    matches!(expires_unix_ms, Some(value) if value <= now_unix_ms)
}

/// Converts whole seconds into milliseconds without overflowing.
pub fn secs_to_ms(seconds: u64) -> u64 {
    seconds.saturating_mul(1_000)
}

/// Rounds a remaining millisecond span up to whole seconds for user-facing hints.
pub fn ceil_ms_to_secs(ms: u64) -> u64 {
    ms.div_ceil(1_000)
}

/// Returns the UTC calendar day containing `unix_ms`.
pub fn utc_date_for_unix_ms(unix_ms: u64) -> NaiveDate {
    let millis = i64::try_from(unix_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .date_naive()
}

/// Time source shared by every stateful component.
///
/// Production code uses [`SystemClock`]. Tests use [`ManualClock`], whose
/// `sleep` advances virtual time instead of blocking, so waits of minutes or
/// days resolve instantly and deterministically.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_unix_ms(&self) -> u64;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        current_unix_timestamp_ms()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Virtual clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_unix_ms: AtomicU64,
    slept_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_unix_ms: u64) -> Self {
        Self {
            now_unix_ms: AtomicU64::new(start_unix_ms),
            slept_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.now_unix_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_unix_ms(&self, unix_ms: u64) {
        self.now_unix_ms.store(unix_ms, Ordering::SeqCst);
    }

    /// Total virtual time spent inside `sleep`.
    pub fn total_slept(&self) -> Duration {
        Duration::from_millis(self.slept_ms.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_unix_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.slept_ms.fetch_add(delta, Ordering::SeqCst);
        self.now_unix_ms.fetch_add(delta, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}
