use std::time::Duration;

use guard_core::secs_to_ms;

use crate::config::RetryPolicy;

/// Exponential component of the throttle backoff for 1-based `attempt`.
pub fn next_backoff_ms(base_delay_ms: u64, attempt: u32) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    base_delay_ms.saturating_mul(1_u64 << shift)
}

/// Sleep before retry `attempt` after the server asked for `retry_after_secs`:
/// the suggested wait plus exponential backoff, capped at `max_delay_ms`.
pub fn throttle_retry_delay(policy: &RetryPolicy, retry_after_secs: u64, attempt: u32) -> Duration {
    let delay_ms = secs_to_ms(retry_after_secs)
        .saturating_add(next_backoff_ms(policy.base_delay_ms, attempt))
        .min(policy.max_delay_ms);
    Duration::from_millis(delay_ms)
}

/// Whether another retry is still allowed after `attempt` failed attempts.
pub fn retries_remaining(policy: &RetryPolicy, attempt: u32) -> bool {
    attempt <= policy.max_retries
}
