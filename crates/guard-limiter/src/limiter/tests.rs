use std::sync::Arc;
use std::time::Duration;

use guard_core::{Clock, ManualClock, StateStore};

use super::{QuotaRequest, RateLimiter, DAILY_COUNTERS_RECORD};
use crate::config::{LimiterConfig, QuotaCounter, QuotaCycle, QuotaLimits};
use crate::error::{GatewayError, LimiterError};
use crate::executor::CallExecutor;
use crate::quota::QuotaLedger;

const START_MS: u64 = 1_709_290_800_000; // 2024-03-01T11:00:00Z
const DAY_MS: u64 = 86_400_000;

fn limiter_with(config: LimiterConfig, store: StateStore) -> (RateLimiter, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START_MS));
    (RateLimiter::new(store, clock.clone(), config), clock)
}

#[tokio::test]
async fn integration_burst_of_fourteen_requests_grants_capacity_then_waits() {
    let config = LimiterConfig {
        burst_capacity: 10.0,
        requests_per_second: 4.0,
        ..LimiterConfig::default()
    };
    let (limiter, clock) = limiter_with(config, StateStore::in_memory());

    let mut grants = Vec::new();
    for _ in 0..14 {
        limiter.acquire(1.0).await.expect("acquire");
        grants.push(clock.now_unix_ms() - START_MS);
    }

    assert_eq!(grants[..10], [0; 10]);
    assert_eq!(grants[10..], [250, 500, 750, 1_000]);
    assert_eq!(clock.total_slept(), Duration::from_secs(1));
    assert_eq!(limiter.metrics().snapshot().rate_limit_waits, 4);
}

#[tokio::test]
async fn functional_acquire_rejects_requests_larger_than_capacity() {
    let (limiter, _clock) = limiter_with(LimiterConfig::default(), StateStore::in_memory());
    let error = limiter.acquire(9.0).await.expect_err("too large");
    assert_eq!(error.reason_code(), "invalid_token_request");
    let error = limiter.acquire(0.0).await.expect_err("zero");
    assert!(matches!(error, LimiterError::InvalidTokenRequest { .. }));
}

#[tokio::test]
async fn integration_rate_budget_is_shared_between_independent_handles() {
    let temp = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(START_MS));
    let first = RateLimiter::new(
        StateStore::open_dir(temp.path()).expect("open"),
        clock.clone(),
        LimiterConfig::default(),
    );
    let second = RateLimiter::new(
        StateStore::open_dir(temp.path()).expect("open"),
        clock.clone(),
        LimiterConfig::default(),
    );

    for _ in 0..8 {
        assert_eq!(first.acquire(1.0).await.expect("drain"), Duration::ZERO);
    }
    let waited = second.acquire(1.0).await.expect("wait for refill");
    assert_eq!(waited, Duration::from_millis(250));
}

#[tokio::test]
async fn integration_daily_quota_blocks_twenty_first_call_until_utc_rollover() {
    let config = LimiterConfig {
        quotas: QuotaLimits {
            direct_messages: 20,
            ..QuotaLimits::default()
        },
        ..LimiterConfig::default()
    };
    let (limiter, clock) = limiter_with(config, StateStore::in_memory());
    let executor = CallExecutor::new(Arc::new(limiter));
    let request = QuotaRequest::new(QuotaCounter::DirectMessages);

    for _ in 0..20 {
        executor
            .execute(Some(&request), || async { Ok::<_, GatewayError>(()) })
            .await
            .expect("within quota");
    }
    let error = executor
        .limiter()
        .check_quota("direct_messages", 20)
        .await
        .expect_err("21st check");
    match error {
        LimiterError::QuotaExceeded {
            used,
            limit,
            resets_in_secs,
            ..
        } => {
            assert_eq!((used, limit), (20, 20));
            assert!(resets_in_secs > 0 && resets_in_secs <= 13 * 3_600);
        }
        other => panic!("unexpected error: {other}"),
    }

    clock.set_unix_ms(START_MS + DAY_MS);
    executor
        .limiter()
        .check_quota("direct_messages", 20)
        .await
        .expect("fresh day");
    executor
        .execute(Some(&request), || async { Ok::<_, GatewayError>(()) })
        .await
        .expect("21st call on the new day");

    let stats = executor.limiter().stats();
    assert_eq!(stats.period, "2024-03-02");
    assert_eq!(stats.usage["direct_messages"].used, 1);
    assert_eq!(stats.total_calls, 1);
    let ledger: QuotaLedger = executor.limiter().store().read_only(DAILY_COUNTERS_RECORD);
    let previous = ledger.previous.expect("closed day kept");
    assert_eq!(previous.period, "2024-03-01");
    assert_eq!(previous.counts.get("direct_messages"), Some(&20));
}

#[tokio::test]
async fn functional_per_target_quota_binds_before_group_quota() {
    let config = LimiterConfig {
        quotas: QuotaLimits {
            group_messages: 50,
            per_target_messages: 2,
            ..QuotaLimits::default()
        },
        per_target_quota_cycle: QuotaCycle::Fixed { seconds: 3_600 },
        ..LimiterConfig::default()
    };
    let (limiter, clock) = limiter_with(config, StateStore::in_memory());
    let to_ops = QuotaRequest::for_target(QuotaCounter::GroupMessages, "ops");

    for _ in 0..2 {
        let ticket = limiter.reserve_quota(&to_ops).await.expect("reserve");
        limiter.record_success(Some(&ticket)).await.expect("commit");
    }
    let error = limiter
        .reserve_quota(&to_ops)
        .await
        .expect_err("per-target limit");
    assert!(matches!(
        error,
        LimiterError::QuotaExceeded { ref counter, .. } if counter == "target:ops"
    ));
    // The rejected attempt left no global reservation behind.
    assert_eq!(limiter.quota_usage()["group_messages"].used, 2);

    let other = QuotaRequest::for_target(QuotaCounter::GroupMessages, "dev");
    limiter
        .reserve_quota(&other)
        .await
        .expect("other target unaffected");

    clock.advance(Duration::from_secs(3_600));
    limiter
        .reserve_quota(&to_ops)
        .await
        .expect("per-target cycle reset independently");
}

#[test]
fn integration_concurrent_reservations_never_exceed_the_limit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_path_buf();
    let config = LimiterConfig {
        quotas: QuotaLimits {
            membership_changes: 20,
            ..QuotaLimits::default()
        },
        ..LimiterConfig::default()
    };

    let handles = (0..4)
        .map(|_| {
            let root = root.clone();
            let config = config.clone();
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("runtime");
                let limiter = RateLimiter::new(
                    StateStore::open_dir(&root).expect("open"),
                    Arc::new(ManualClock::new(START_MS)),
                    config,
                );
                let request = QuotaRequest::new(QuotaCounter::MembershipChanges);
                runtime.block_on(async {
                    let mut granted = 0;
                    for _ in 0..10 {
                        if let Ok(ticket) = limiter.reserve_quota(&request).await {
                            limiter.record_success(Some(&ticket)).await.expect("commit");
                            granted += 1;
                        }
                    }
                    granted
                })
            })
        })
        .collect::<Vec<_>>();
    let granted: u64 = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .sum();

    assert_eq!(granted, 20);
    let limiter = RateLimiter::new(
        StateStore::open_dir(&root).expect("open"),
        Arc::new(ManualClock::new(START_MS)),
        config,
    );
    assert_eq!(limiter.quota_usage()["membership_changes"].used, 20);
    assert_eq!(limiter.stats().total_calls, 20);
}

#[tokio::test]
async fn integration_circuit_rejects_until_exact_cooldown_then_heals() {
    let (limiter, clock) = limiter_with(LimiterConfig::default(), StateStore::in_memory());
    assert!(!limiter
        .trip_circuit_if_severe(599, 600, 300)
        .await
        .expect("below threshold"));
    limiter.assert_circuit_closed().await.expect("still closed");

    assert!(limiter
        .trip_circuit_if_severe(700, 600, 300)
        .await
        .expect("trip"));
    clock.advance(Duration::from_millis(299_999));
    let error = limiter.assert_circuit_closed().await.expect_err("open");
    assert!(matches!(
        error,
        LimiterError::CircuitOpen {
            retry_after_secs: 1
        }
    ));
    assert!(limiter.circuit_status().open);

    clock.advance(Duration::from_millis(1));
    limiter
        .assert_circuit_closed()
        .await
        .expect("healed at t0 + cooldown");
    let status = limiter.circuit_status();
    assert!(!status.open);
    assert_eq!(status.trip_count, 1);
}

#[tokio::test]
async fn regression_released_reservation_returns_slot() {
    let config = LimiterConfig {
        quotas: QuotaLimits {
            direct_messages: 1,
            ..QuotaLimits::default()
        },
        ..LimiterConfig::default()
    };
    let (limiter, _clock) = limiter_with(config, StateStore::in_memory());
    let request = QuotaRequest::new(QuotaCounter::DirectMessages);
    let ticket = limiter.reserve_quota(&request).await.expect("reserve");
    assert!(limiter.reserve_quota(&request).await.is_err());
    limiter.release_quota(&ticket).await;
    limiter
        .reserve_quota(&request)
        .await
        .expect("slot returned");
}

#[tokio::test]
async fn regression_expired_reservation_does_not_leak_a_slot() {
    let config = LimiterConfig {
        quotas: QuotaLimits {
            direct_messages: 1,
            ..QuotaLimits::default()
        },
        quota_reservation_ttl_secs: 60,
        ..LimiterConfig::default()
    };
    let ttl_secs = config.reservation_ttl_secs();
    let (limiter, clock) = limiter_with(config, StateStore::in_memory());
    let request = QuotaRequest::new(QuotaCounter::DirectMessages);
    let _abandoned = limiter.reserve_quota(&request).await.expect("reserve");
    clock.advance(Duration::from_secs(ttl_secs));
    assert!(limiter.reserve_quota(&request).await.is_err());
    clock.advance(Duration::from_secs(1));
    limiter
        .reserve_quota(&request)
        .await
        .expect("crashed holder's reservation expired");
}

#[tokio::test]
async fn regression_reservation_survives_a_fully_throttled_call() {
    let config = LimiterConfig {
        quotas: QuotaLimits {
            direct_messages: 1,
            ..QuotaLimits::default()
        },
        circuit_threshold_secs: 10_000,
        ..LimiterConfig::default()
    };
    let (limiter, clock) = limiter_with(config, StateStore::in_memory());
    let executor = CallExecutor::new(Arc::new(limiter));
    let request = QuotaRequest::new(QuotaCounter::DirectMessages);

    let mut attempts = 0;
    let mut held_on_last_attempt = 0;
    let value = executor
        .execute(Some(&request), || {
            attempts += 1;
            let attempt = attempts;
            held_on_last_attempt = executor.limiter().quota_usage()["direct_messages"].used;
            async move {
                if attempt <= 3 {
                    Err(GatewayError::Throttled {
                        retry_after_secs: 900,
                    })
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .expect("last retry succeeds");
    assert_eq!(value, 4);
    assert!(clock.total_slept() >= Duration::from_secs(900));
    assert_eq!(held_on_last_attempt, 1);
    assert_eq!(executor.limiter().quota_usage()["direct_messages"].used, 1);
}
