//! Rate budget, daily quotas, circuit breaker and the throttle-aware call
//! executor that every outbound remote call goes through.

pub mod bucket;
pub mod circuit;
pub mod config;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod metrics;
pub mod quota;
pub mod retry;

pub use bucket::RateBudget;
pub use circuit::{CircuitCheck, CircuitState};
pub use config::{LimiterConfig, QuotaCounter, QuotaCycle, QuotaLimits, RetryPolicy};
pub use error::{GatewayError, LimiterError};
pub use executor::CallExecutor;
pub use limiter::{
    CircuitStatus, LimiterStats, QuotaRequest, QuotaTicket, QuotaUsage, RateLimiter,
    CIRCUIT_RECORD, DAILY_COUNTERS_RECORD, RATE_BUDGET_RECORD, TARGET_COUNTERS_RECORD,
};
pub use metrics::{LimiterMetrics, MetricsSnapshot};
