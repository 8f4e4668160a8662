use serde::{Deserialize, Serialize};

use guard_core::{secs_to_ms, utc_date_for_unix_ms};

pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 4.0;
pub const DEFAULT_BURST_CAPACITY: f64 = 8.0;
pub const DEFAULT_MAX_DIRECT_MESSAGES_PER_DAY: u64 = 20;
pub const DEFAULT_MAX_MEMBERSHIP_CHANGES_PER_DAY: u64 = 20;
pub const DEFAULT_MAX_GROUP_MESSAGES_PER_DAY: u64 = 50;
pub const DEFAULT_MAX_MESSAGES_PER_TARGET: u64 = 10;
pub const DEFAULT_CIRCUIT_THRESHOLD_SECS: u64 = 600;
pub const DEFAULT_CIRCUIT_COOLDOWN_SECS: u64 = 1_800;
pub const DEFAULT_QUOTA_RESERVATION_TTL_SECS: u64 = 900;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 300_000;
/// Allowance for one remote round trip when sizing reservation lifetimes.
pub const CALL_ALLOWANCE_SECS: u64 = 60;

/// Operation families that carry a daily quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaCounter {
    DirectMessages,
    MembershipChanges,
    GroupMessages,
}

impl QuotaCounter {
    pub const ALL: [QuotaCounter; 3] = [
        QuotaCounter::DirectMessages,
        QuotaCounter::MembershipChanges,
        QuotaCounter::GroupMessages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectMessages => "direct_messages",
            Self::MembershipChanges => "membership_changes",
            Self::GroupMessages => "group_messages",
        }
    }

    /// Message counters are additionally bounded per target.
    pub fn is_message(self) -> bool {
        matches!(self, Self::DirectMessages | Self::GroupMessages)
    }
}

/// Reset cycle of a quota ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaCycle {
    #[default]
    UtcDay,
    Fixed { seconds: u64 },
}

impl QuotaCycle {
    /// Identifier of the cycle containing `now_unix_ms`; a change means reset.
    pub fn period_key(self, now_unix_ms: u64) -> String {
        match self {
            Self::UtcDay => utc_date_for_unix_ms(now_unix_ms).to_string(),
            Self::Fixed { seconds } => {
                let span = secs_to_ms(seconds.max(1));
                format!("fixed{}s-{}", seconds.max(1), now_unix_ms / span)
            }
        }
    }

    /// Unix ms at which the cycle containing `now_unix_ms` ends.
    pub fn next_reset_unix_ms(self, now_unix_ms: u64) -> u64 {
        let span = match self {
            Self::UtcDay => 86_400_000,
            Self::Fixed { seconds } => secs_to_ms(seconds.max(1)),
        };
        (now_unix_ms / span).saturating_add(1).saturating_mul(span)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub direct_messages: u64,
    pub membership_changes: u64,
    pub group_messages: u64,
    /// Messages to one target per cycle; `0` disables the per-target quota.
    pub per_target_messages: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            direct_messages: DEFAULT_MAX_DIRECT_MESSAGES_PER_DAY,
            membership_changes: DEFAULT_MAX_MEMBERSHIP_CHANGES_PER_DAY,
            group_messages: DEFAULT_MAX_GROUP_MESSAGES_PER_DAY,
            per_target_messages: DEFAULT_MAX_MESSAGES_PER_TARGET,
        }
    }
}

impl QuotaLimits {
    pub fn limit_for(&self, counter: QuotaCounter) -> u64 {
        match counter {
            QuotaCounter::DirectMessages => self.direct_messages,
            QuotaCounter::MembershipChanges => self.membership_changes,
            QuotaCounter::GroupMessages => self.group_messages,
        }
    }
}

/// Bounded retry applied to remote throttling signals only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub requests_per_second: f64,
    pub burst_capacity: f64,
    pub quotas: QuotaLimits,
    pub quota_cycle: QuotaCycle,
    pub per_target_quota_cycle: QuotaCycle,
    pub quota_reservation_ttl_secs: u64,
    /// A throttle wait at or above this many seconds trips the circuit.
    pub circuit_threshold_secs: u64,
    pub circuit_cooldown_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst_capacity: DEFAULT_BURST_CAPACITY,
            quotas: QuotaLimits::default(),
            quota_cycle: QuotaCycle::UtcDay,
            per_target_quota_cycle: QuotaCycle::UtcDay,
            quota_reservation_ttl_secs: DEFAULT_QUOTA_RESERVATION_TTL_SECS,
            circuit_threshold_secs: DEFAULT_CIRCUIT_THRESHOLD_SECS,
            circuit_cooldown_secs: DEFAULT_CIRCUIT_COOLDOWN_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

impl LimiterConfig {
    /// Upper bound on how long one executor run can hold a reservation:
    /// every attempt may drain the bucket and make a round trip, and every
    /// retry may sleep for the full `max_delay_ms`.
    pub fn max_call_span_secs(&self) -> u64 {
        let refill_secs = if self.requests_per_second > 0.0 {
            (self.burst_capacity / self.requests_per_second).ceil() as u64
        } else {
            0
        };
        let attempts = u64::from(self.retry.max_retries).saturating_add(1);
        let retry_sleep_secs = self.retry.max_delay_ms.div_ceil(1_000);
        attempts
            .saturating_mul(refill_secs.saturating_add(CALL_ALLOWANCE_SECS))
            .saturating_add(u64::from(self.retry.max_retries).saturating_mul(retry_sleep_secs))
    }

    /// Lifetime of an uncommitted quota reservation; never shorter than a
    /// full executor run so a live call cannot lose its slot.
    pub fn reservation_ttl_secs(&self) -> u64 {
        self.quota_reservation_ttl_secs
            .max(self.max_call_span_secs())
    }

    /// Returns human-readable problems with numeric settings.
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            issues.push(format!(
                "requests_per_second must be > 0 (got {})",
                self.requests_per_second
            ));
        }
        if !(self.burst_capacity.is_finite() && self.burst_capacity >= 1.0) {
            issues.push(format!(
                "burst_capacity must be >= 1 (got {})",
                self.burst_capacity
            ));
        }
        if self.circuit_threshold_secs == 0 {
            issues.push("circuit_threshold_secs must be > 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            issues.push(format!(
                "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }
        if let QuotaCycle::Fixed { seconds: 0 } = self.quota_cycle {
            issues.push("quota_cycle.seconds must be > 0".to_string());
        }
        if let QuotaCycle::Fixed { seconds: 0 } = self.per_target_quota_cycle {
            issues.push("per_target_quota_cycle.seconds must be > 0".to_string());
        }
        issues
    }
}
