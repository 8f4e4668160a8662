use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Upper bounds (seconds) of the call latency histogram; a final `+Inf`
/// bucket catches the rest.
pub const LATENCY_BUCKETS_SECS: [f64; 7] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyBucket {
    /// `None` is the `+Inf` bucket.
    pub le_secs: Option<f64>,
    pub count: u64,
}

/// Point-in-time copy of the in-process limiter metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_wait_ms_total: u64,
    pub throttle_events: u64,
    pub throttle_wait_secs_total: u64,
    pub circuit_trips: u64,
    pub quota_rejections: u64,
    /// Cumulative, like a Prometheus histogram.
    pub latency_buckets: Vec<LatencyBucket>,
    pub latency_count: u64,
    pub latency_sum_ms: u64,
}

#[derive(Debug, Default)]
pub struct LimiterMetrics {
    requests_total: AtomicU64,
    requests_failed: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_ms_total: AtomicU64,
    throttle_events: AtomicU64,
    throttle_wait_secs_total: AtomicU64,
    circuit_trips: AtomicU64,
    quota_rejections: AtomicU64,
    latency_buckets: [AtomicU64; LATENCY_BUCKETS_SECS.len() + 1],
    latency_sum_ms: AtomicU64,
}

impl LimiterMetrics {
    pub fn record_request(&self, succeeded: bool, latency: Duration) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        let secs = latency.as_secs_f64();
        let index = LATENCY_BUCKETS_SECS
            .iter()
            .position(|bound| secs <= *bound)
            .unwrap_or(LATENCY_BUCKETS_SECS.len());
        self.latency_buckets[index].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn record_rate_limit_wait(&self, wait: Duration) {
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.rate_limit_wait_ms_total.fetch_add(
            u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn record_throttle(&self, retry_after_secs: u64) {
        self.throttle_events.fetch_add(1, Ordering::Relaxed);
        self.throttle_wait_secs_total
            .fetch_add(retry_after_secs, Ordering::Relaxed);
    }

    pub fn record_circuit_trip(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quota_rejection(&self) {
        self.quota_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut cumulative = 0;
        let latency_buckets = self
            .latency_buckets
            .iter()
            .enumerate()
            .map(|(index, bucket)| {
                cumulative += bucket.load(Ordering::Relaxed);
                LatencyBucket {
                    le_secs: LATENCY_BUCKETS_SECS.get(index).copied(),
                    count: cumulative,
                }
            })
            .collect::<Vec<_>>();
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_wait_ms_total: self.rate_limit_wait_ms_total.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            throttle_wait_secs_total: self.throttle_wait_secs_total.load(Ordering::Relaxed),
            circuit_trips: self.circuit_trips.load(Ordering::Relaxed),
            quota_rejections: self.quota_rejections.load(Ordering::Relaxed),
            latency_count: cumulative,
            latency_buckets,
            latency_sum_ms: self.latency_sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LimiterMetrics;

    #[test]
    fn unit_latency_histogram_is_cumulative_with_inf_bucket() {
        let metrics = LimiterMetrics::default();
        metrics.record_request(true, Duration::from_millis(30));
        metrics.record_request(true, Duration::from_millis(400));
        metrics.record_request(false, Duration::from_secs(9));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.latency_buckets.len(), 8);
        assert_eq!(snapshot.latency_buckets[0].count, 1);
        assert_eq!(snapshot.latency_buckets[3].count, 2);
        assert_eq!(snapshot.latency_buckets[6].count, 2);
        assert_eq!(snapshot.latency_buckets[7].le_secs, None);
        assert_eq!(snapshot.latency_buckets[7].count, 3);
        assert_eq!(snapshot.latency_count, 3);
        assert_eq!(snapshot.latency_sum_ms, 9_430);
    }
}
