//! Shared rate budget, daily quotas and circuit breaker.
//!
//! Each concern lives in its own state record so a token acquisition in one
//! process never waits on a quota check in another.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use guard_core::{ceil_ms_to_secs, secs_to_ms, Clock, StateStore};
use serde::Serialize;

use crate::bucket::RateBudget;
use crate::circuit::{CircuitCheck, CircuitState};
use crate::config::{LimiterConfig, QuotaCounter, QuotaCycle};
use crate::error::LimiterError;
use crate::metrics::{LimiterMetrics, MetricsSnapshot};
use crate::quota::{target_counter_key, QuotaLedger, THROTTLE_EVENTS, TOTAL_CALLS};

pub const RATE_BUDGET_RECORD: &str = "rate-budget";
pub const DAILY_COUNTERS_RECORD: &str = "daily-counters";
pub const TARGET_COUNTERS_RECORD: &str = "target-counters";
pub const CIRCUIT_RECORD: &str = "circuit";

/// Quota families charged by one remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub counter: QuotaCounter,
    /// Normalized target; message counters are also charged per target.
    pub target: Option<String>,
}

impl QuotaRequest {
    pub fn new(counter: QuotaCounter) -> Self {
        Self {
            counter,
            target: None,
        }
    }

    pub fn for_target(counter: QuotaCounter, target: impl Into<String>) -> Self {
        Self {
            counter,
            target: Some(target.into()),
        }
    }
}

/// Slots held for an in-flight call. Commit on success, release otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTicket {
    pub request: QuotaRequest,
    global_reservation: Option<String>,
    target_reservation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub used: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStatus {
    pub open: bool,
    pub retry_after_secs: u64,
    pub trip_count: u64,
    pub tripped_at_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimiterStats {
    pub period: String,
    pub usage: BTreeMap<String, QuotaUsage>,
    pub total_calls: u64,
    pub throttle_events: u64,
    pub requests_per_second: f64,
    pub burst_capacity: f64,
    pub available_tokens: f64,
    pub circuit: CircuitStatus,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
pub struct RateLimiter {
    store: StateStore,
    clock: Arc<dyn Clock>,
    config: LimiterConfig,
    metrics: LimiterMetrics,
}

impl RateLimiter {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, config: LimiterConfig) -> Self {
        Self {
            store,
            clock,
            config,
            metrics: LimiterMetrics::default(),
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }

    /// Takes `requested` tokens, suspending until they are available.
    /// Returns the total time spent waiting.
    #[tracing::instrument(name = "guard_limiter.acquire", skip(self))]
    pub async fn acquire(&self, requested: f64) -> Result<Duration, LimiterError> {
        let capacity = self.config.burst_capacity;
        if !(requested > 0.0 && requested <= capacity) {
            return Err(LimiterError::InvalidTokenRequest {
                requested,
                capacity,
            });
        }

        let mut waited = Duration::ZERO;
        loop {
            let outcome = self
                .store
                .update_async(RATE_BUDGET_RECORD, |budget: &mut Option<RateBudget>| {
                    let now = self.clock.now_unix_ms();
                    let budget = budget.get_or_insert_with(|| {
                        RateBudget::full(capacity, self.config.requests_per_second, now)
                    });
                    budget.reconfigure(capacity, self.config.requests_per_second);
                    budget.try_take(requested, now)
                })
                .await?;
            match outcome {
                Ok(()) => return Ok(waited),
                Err(wait) => {
                    tracing::debug!(wait_ms = wait.as_millis() as u64, "rate budget empty; waiting");
                    self.metrics.record_rate_limit_wait(wait);
                    self.clock.sleep(wait).await;
                    waited += wait;
                }
            }
        }
    }

    /// Fails with `QuotaExceeded` when `counter` has reached `limit` in the
    /// current cycle. Counts are never incremented here.
    pub async fn check_quota(&self, counter: &str, limit: u64) -> Result<QuotaUsage, LimiterError> {
        self.check_in(DAILY_COUNTERS_RECORD, self.config.quota_cycle, counter, limit)
            .await
    }

    /// Per-target message quota for a normalized target.
    pub async fn check_target_quota(
        &self,
        target: &str,
        limit: u64,
    ) -> Result<QuotaUsage, LimiterError> {
        self.check_in(
            TARGET_COUNTERS_RECORD,
            self.config.per_target_quota_cycle,
            &target_counter_key(target),
            limit,
        )
        .await
    }

    async fn check_in(
        &self,
        record: &str,
        cycle: QuotaCycle,
        counter: &str,
        limit: u64,
    ) -> Result<QuotaUsage, LimiterError> {
        let now = self.clock.now_unix_ms();
        let used = self
            .store
            .update_async(record, |ledger: &mut QuotaLedger| {
                ledger.roll_to(cycle, now);
                ledger.prune_reservations(now);
                ledger.used(counter, now)
            })
            .await?;
        if used >= limit {
            return Err(self.quota_exceeded(counter, used, limit, cycle, now));
        }
        Ok(QuotaUsage { used, limit })
    }

    /// Checks every quota that applies to `request` and reserves one slot in
    /// each within the same locked update.
    #[tracing::instrument(name = "guard_limiter.reserve_quota", skip(self), fields(counter = request.counter.as_str()))]
    pub async fn reserve_quota(&self, request: &QuotaRequest) -> Result<QuotaTicket, LimiterError> {
        let global_limit = self.config.quotas.limit_for(request.counter);
        let global_reservation = if global_limit == 0 {
            None
        } else {
            Some(
                self.reserve_in(
                    DAILY_COUNTERS_RECORD,
                    self.config.quota_cycle,
                    request.counter.as_str(),
                    global_limit,
                )
                .await?,
            )
        };

        let target_limit = self.config.quotas.per_target_messages;
        let target_reservation = match request.target.as_deref() {
            Some(target) if target_limit > 0 && request.counter.is_message() => {
                let reserved = self
                    .reserve_in(
                        TARGET_COUNTERS_RECORD,
                        self.config.per_target_quota_cycle,
                        &target_counter_key(target),
                        target_limit,
                    )
                    .await;
                match reserved {
                    Ok(id) => Some(id),
                    Err(error) => {
                        if let Some(id) = global_reservation.as_deref() {
                            self.release_in(DAILY_COUNTERS_RECORD, id).await;
                        }
                        return Err(error);
                    }
                }
            }
            _ => None,
        };

        Ok(QuotaTicket {
            request: request.clone(),
            global_reservation,
            target_reservation,
        })
    }

    async fn reserve_in(
        &self,
        record: &str,
        cycle: QuotaCycle,
        counter: &str,
        limit: u64,
    ) -> Result<String, LimiterError> {
        let now = self.clock.now_unix_ms();
        let expires = now.saturating_add(secs_to_ms(self.config.reservation_ttl_secs()));
        let reserved = self
            .store
            .update_async(record, |ledger: &mut QuotaLedger| {
                ledger.roll_to(cycle, now);
                ledger.prune_reservations(now);
                let used = ledger.used(counter, now);
                if used >= limit {
                    Err(used)
                } else {
                    Ok(ledger.reserve(counter, expires))
                }
            })
            .await?;
        reserved.map_err(|used| self.quota_exceeded(counter, used, limit, cycle, now))
    }

    fn quota_exceeded(
        &self,
        counter: &str,
        used: u64,
        limit: u64,
        cycle: QuotaCycle,
        now: u64,
    ) -> LimiterError {
        self.metrics.record_quota_rejection();
        let resets_in_secs = ceil_ms_to_secs(cycle.next_reset_unix_ms(now).saturating_sub(now));
        tracing::info!(counter, used, limit, resets_in_secs, "quota exhausted");
        LimiterError::QuotaExceeded {
            counter: counter.to_string(),
            used,
            limit,
            resets_in_secs,
        }
    }

    /// Records a successful remote call: total calls, plus the ticket's
    /// counters when present.
    pub async fn record_success(&self, ticket: Option<&QuotaTicket>) -> Result<(), LimiterError> {
        let now = self.clock.now_unix_ms();
        let cycle = self.config.quota_cycle;
        self.store
            .update_async(DAILY_COUNTERS_RECORD, |ledger: &mut QuotaLedger| {
                ledger.roll_to(cycle, now);
                ledger.increment(TOTAL_CALLS);
                if let Some(ticket) = ticket {
                    let counter = ticket.request.counter.as_str();
                    match ticket.global_reservation.as_deref() {
                        Some(id) => {
                            ledger.commit(id, counter);
                        }
                        None => {
                            ledger.increment(counter);
                        }
                    }
                }
            })
            .await?;

        if let Some(ticket) = ticket {
            if let (Some(target), Some(id)) = (
                ticket.request.target.as_deref(),
                ticket.target_reservation.as_deref(),
            ) {
                let cycle = self.config.per_target_quota_cycle;
                let key = target_counter_key(target);
                self.store
                    .update_async(TARGET_COUNTERS_RECORD, |ledger: &mut QuotaLedger| {
                        ledger.roll_to(cycle, now);
                        ledger.commit(id, &key);
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Gives back the slots of a call that did not happen. Failures are logged.
    pub async fn release_quota(&self, ticket: &QuotaTicket) {
        if let Some(id) = ticket.global_reservation.as_deref() {
            self.release_in(DAILY_COUNTERS_RECORD, id).await;
        }
        if let Some(id) = ticket.target_reservation.as_deref() {
            self.release_in(TARGET_COUNTERS_RECORD, id).await;
        }
    }

    async fn release_in(&self, record: &str, reservation_id: &str) {
        let released = self
            .store
            .update_async(record, |ledger: &mut QuotaLedger| ledger.release(reservation_id))
            .await;
        if let Err(error) = released {
            tracing::warn!(record, %error, "failed to release quota reservation; it will expire");
        }
    }

    pub async fn record_throttle_event(&self, retry_after_secs: u64) -> Result<u64, LimiterError> {
        self.metrics.record_throttle(retry_after_secs);
        let now = self.clock.now_unix_ms();
        let cycle = self.config.quota_cycle;
        let events = self
            .store
            .update_async(DAILY_COUNTERS_RECORD, |ledger: &mut QuotaLedger| {
                ledger.roll_to(cycle, now);
                ledger.increment(THROTTLE_EVENTS)
            })
            .await?;
        Ok(events)
    }

    /// Trips the breaker when the remote wait reaches `threshold_secs`.
    /// Returns whether the breaker was tripped.
    pub async fn trip_circuit_if_severe(
        &self,
        throttle_secs: u64,
        threshold_secs: u64,
        cooldown_secs: u64,
    ) -> Result<bool, LimiterError> {
        if throttle_secs < threshold_secs {
            return Ok(false);
        }
        let now = self.clock.now_unix_ms();
        let trip_count = self
            .store
            .update_async(CIRCUIT_RECORD, |state: &mut CircuitState| {
                state.trip(now, secs_to_ms(cooldown_secs), throttle_secs);
                state.trip_count
            })
            .await?;
        self.metrics.record_circuit_trip();
        tracing::error!(
            throttle_secs,
            threshold_secs,
            cooldown_secs,
            trip_count,
            "severe throttling; circuit breaker tripped"
        );
        Ok(true)
    }

    /// Fails with `CircuitOpen` while the breaker cools down; heals it once
    /// the cooldown has elapsed.
    pub async fn assert_circuit_closed(&self) -> Result<(), LimiterError> {
        let snapshot: CircuitState = self.store.read_only(CIRCUIT_RECORD);
        if !snapshot.tripped {
            return Ok(());
        }
        let now = self.clock.now_unix_ms();
        let check = self
            .store
            .update_async(CIRCUIT_RECORD, |state: &mut CircuitState| state.observe(now))
            .await?;
        match check {
            CircuitCheck::Closed => Ok(()),
            CircuitCheck::Healed => {
                tracing::info!("circuit breaker cooldown elapsed; closed again");
                Ok(())
            }
            CircuitCheck::Open { remaining_ms } => Err(LimiterError::CircuitOpen {
                retry_after_secs: ceil_ms_to_secs(remaining_ms),
            }),
        }
    }

    pub fn circuit_status(&self) -> CircuitStatus {
        let state: CircuitState = self.store.read_only(CIRCUIT_RECORD);
        let now = self.clock.now_unix_ms();
        let open = state.is_open_at(now);
        let retry_after_secs = if open {
            ceil_ms_to_secs(
                state
                    .cooldown_until_unix_ms
                    .unwrap_or(now)
                    .saturating_sub(now),
            )
        } else {
            0
        };
        CircuitStatus {
            open,
            retry_after_secs,
            trip_count: state.trip_count,
            tripped_at_unix_ms: state.tripped_at_unix_ms,
        }
    }

    /// Current usage of every named quota, including live reservations.
    pub fn quota_usage(&self) -> BTreeMap<String, QuotaUsage> {
        let now = self.clock.now_unix_ms();
        let ledger = self.current_ledger(now);
        QuotaCounter::ALL
            .iter()
            .map(|counter| {
                (
                    counter.as_str().to_string(),
                    QuotaUsage {
                        used: ledger.used(counter.as_str(), now),
                        limit: self.config.quotas.limit_for(*counter),
                    },
                )
            })
            .collect()
    }

    /// Lock-free operator view of limiter state.
    pub fn stats(&self) -> LimiterStats {
        let now = self.clock.now_unix_ms();
        let ledger = self.current_ledger(now);
        let budget: Option<RateBudget> = self.store.read_only(RATE_BUDGET_RECORD);
        let available_tokens = match budget {
            Some(mut budget) => {
                budget.reconfigure(self.config.burst_capacity, self.config.requests_per_second);
                budget.refill(now);
                budget.tokens
            }
            None => self.config.burst_capacity,
        };
        LimiterStats {
            period: ledger.period.clone(),
            usage: self.quota_usage(),
            total_calls: ledger.count(TOTAL_CALLS),
            throttle_events: ledger.count(THROTTLE_EVENTS),
            requests_per_second: self.config.requests_per_second,
            burst_capacity: self.config.burst_capacity,
            available_tokens,
            circuit: self.circuit_status(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn current_ledger(&self, now: u64) -> QuotaLedger {
        let mut ledger: QuotaLedger = self.store.read_only(DAILY_COUNTERS_RECORD);
        // Readers never write; a stale cycle simply reads as empty.
        ledger.roll_to(self.config.quota_cycle, now);
        ledger
    }
}

#[cfg(test)]
mod tests;
