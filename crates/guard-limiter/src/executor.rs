use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RetryPolicy;
use crate::error::{GatewayError, LimiterError};
use crate::limiter::{QuotaRequest, QuotaTicket, RateLimiter};
use crate::retry::{retries_remaining, throttle_retry_delay};

/// Runs remote calls through the circuit breaker, quotas and rate budget,
/// retrying only on throttling signals.
#[derive(Debug, Clone)]
pub struct CallExecutor {
    limiter: Arc<RateLimiter>,
}

impl CallExecutor {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// [`Self::execute_with`] using the configured retry policy.
    pub async fn execute<T, F, Fut>(
        &self,
        quota: Option<&QuotaRequest>,
        call: F,
    ) -> Result<T, LimiterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let policy = self.limiter.config().retry;
        self.execute_with(&policy, quota, call).await
    }

    #[tracing::instrument(
        name = "guard_limiter.execute",
        skip(self, policy, call),
        fields(counter = quota.map(|request| request.counter.as_str()))
    )]
    pub async fn execute_with<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        quota: Option<&QuotaRequest>,
        mut call: F,
    ) -> Result<T, LimiterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.limiter.assert_circuit_closed().await?;
        let ticket = match quota {
            Some(request) => Some(self.limiter.reserve_quota(request).await?),
            None => None,
        };

        let config = self.limiter.config();
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if attempt > 1 {
                // Another process may have tripped the breaker while we slept.
                if let Err(error) = self.limiter.assert_circuit_closed().await {
                    return Err(self.abandon(ticket.as_ref(), error).await);
                }
            }
            if let Err(error) = self.limiter.acquire(1.0).await {
                return Err(self.abandon(ticket.as_ref(), error).await);
            }

            let started = Instant::now();
            let result = call().await;
            let latency = started.elapsed();
            match result {
                Ok(value) => {
                    self.limiter.metrics().record_request(true, latency);
                    if let Err(error) = self.limiter.record_success(ticket.as_ref()).await {
                        tracing::error!(%error, "remote call succeeded but counters were not updated");
                    }
                    return Ok(value);
                }
                Err(GatewayError::Throttled { retry_after_secs }) => {
                    self.limiter.metrics().record_request(false, latency);
                    if let Err(error) = self.limiter.record_throttle_event(retry_after_secs).await {
                        tracing::warn!(%error, "failed to record throttling event");
                    }
                    let tripped = match self
                        .limiter
                        .trip_circuit_if_severe(
                            retry_after_secs,
                            config.circuit_threshold_secs,
                            config.circuit_cooldown_secs,
                        )
                        .await
                    {
                        Ok(tripped) => tripped,
                        Err(error) => return Err(self.abandon(ticket.as_ref(), error).await),
                    };
                    if tripped {
                        return Err(self.abandon(
                            ticket.as_ref(),
                            LimiterError::Throttled {
                                retry_after_secs,
                                circuit_tripped: true,
                            },
                        )
                        .await);
                    }
                    if !retries_remaining(policy, attempt) {
                        return Err(self.abandon(
                            ticket.as_ref(),
                            LimiterError::ThrottledExhausted {
                                attempts: attempt,
                                last_retry_after_secs: retry_after_secs,
                            },
                        )
                        .await);
                    }
                    let delay = throttle_retry_delay(policy, retry_after_secs, attempt);
                    tracing::warn!(
                        attempt,
                        retry_after_secs,
                        delay_ms = delay.as_millis() as u64,
                        "remote service throttled the call; backing off"
                    );
                    self.limiter.clock().sleep(delay).await;
                }
                Err(GatewayError::Failed(error)) => {
                    self.limiter.metrics().record_request(false, latency);
                    return Err(self.abandon(ticket.as_ref(), LimiterError::Remote(error)).await);
                }
            }
        }
    }

    async fn abandon(&self, ticket: Option<&QuotaTicket>, error: LimiterError) -> LimiterError {
        if let Some(ticket) = ticket {
            self.limiter.release_quota(ticket).await;
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use guard_core::{Clock, ManualClock, StateStore};

    use super::CallExecutor;
    use crate::config::{LimiterConfig, QuotaCounter, RetryPolicy};
    use crate::error::{GatewayError, LimiterError};
    use crate::limiter::{QuotaRequest, RateLimiter};

    const START_MS: u64 = 1_709_290_800_000; // 2024-03-01T11:00:00Z

    fn executor(config: LimiterConfig) -> (CallExecutor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let limiter = RateLimiter::new(StateStore::in_memory(), clock.clone(), config);
        (CallExecutor::new(Arc::new(limiter)), clock)
    }

    #[tokio::test]
    async fn functional_throttle_is_retried_with_backoff_then_succeeds() {
        let (executor, clock) = executor(LimiterConfig::default());
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        };

        let value = executor
            .execute_with(&policy, None, || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(GatewayError::Throttled { retry_after_secs: 2 })
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await
            .expect("third attempt succeeds");

        assert_eq!(value, "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // (2s + 1s) then (2s + 2s).
        assert_eq!(clock.total_slept(), Duration::from_millis(7_000));
        let stats = executor.limiter().stats();
        assert_eq!(stats.throttle_events, 2);
        assert_eq!(stats.total_calls, 1);
    }

    #[tokio::test]
    async fn functional_retries_are_bounded_by_max_retries() {
        let (executor, _clock) = executor(LimiterConfig::default());
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 1_000,
        };
        let error = executor
            .execute_with(&policy, None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(GatewayError::Throttled { retry_after_secs: 1 }) }
            })
            .await
            .expect_err("exhausted");
        assert!(matches!(
            error,
            LimiterError::ThrottledExhausted {
                attempts: 3,
                last_retry_after_secs: 1
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn functional_severe_throttle_trips_circuit_without_retrying() {
        let (executor, clock) = executor(LimiterConfig::default());
        let calls = AtomicU32::new(0);
        let error = executor
            .execute(None, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(GatewayError::Throttled { retry_after_secs: 900 }) }
            })
            .await
            .expect_err("severe throttle");
        assert!(matches!(
            error,
            LimiterError::Throttled {
                retry_after_secs: 900,
                circuit_tripped: true
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let blocked = executor
            .execute(None, || async { Ok::<_, GatewayError>(()) })
            .await
            .expect_err("circuit open");
        assert!(matches!(
            blocked,
            LimiterError::CircuitOpen {
                retry_after_secs: 1_800
            }
        ));

        clock.advance(Duration::from_secs(1_800));
        executor
            .execute(None, || async { Ok::<_, GatewayError>(()) })
            .await
            .expect("healed");
    }

    #[tokio::test]
    async fn regression_non_throttle_errors_propagate_and_release_quota() {
        let config = LimiterConfig {
            quotas: crate::config::QuotaLimits {
                direct_messages: 1,
                ..Default::default()
            },
            ..LimiterConfig::default()
        };
        let (executor, _clock) = executor(config);
        let request = QuotaRequest::for_target(QuotaCounter::DirectMessages, "alice");
        let calls = AtomicU32::new(0);

        let error = executor
            .execute(Some(&request), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(GatewayError::Failed(anyhow::anyhow!("peer flood"))) }
            })
            .await
            .expect_err("remote failure");
        assert_eq!(error.reason_code(), "remote_error");
        assert!(error.to_string().contains("peer flood"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The failed call did not consume the only slot.
        executor
            .execute(Some(&request), || async { Ok::<_, GatewayError>(()) })
            .await
            .expect("slot still free");
        let exhausted = executor
            .execute(Some(&request), || async { Ok::<_, GatewayError>(()) })
            .await
            .expect_err("quota used");
        assert!(matches!(exhausted, LimiterError::QuotaExceeded { used: 1, limit: 1, .. }));
        assert_eq!(executor.limiter().clock().now_unix_ms(), START_MS);
    }
}
