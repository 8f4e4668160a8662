//! Daily counters with reservations.
//!
//! A [`QuotaLedger`] is one persisted record holding the counts for the
//! current cycle. Rollover is lazy: the first locked access in a new cycle
//! moves the closed counts into `previous` and starts from zero.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::QuotaCycle;

pub const TOTAL_CALLS: &str = "total_calls";
pub const THROTTLE_EVENTS: &str = "throttle_events";

static RESERVATION_NONCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReservation {
    pub counter: String,
    pub expires_unix_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedPeriod {
    pub period: String,
    pub counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLedger {
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,
    #[serde(default)]
    pub reservations: BTreeMap<String, QuotaReservation>,
    #[serde(default)]
    pub previous: Option<ClosedPeriod>,
}

impl QuotaLedger {
    /// Starts a fresh cycle when the period key changed. Returns true on rollover.
    pub fn roll_to(&mut self, cycle: QuotaCycle, now_unix_ms: u64) -> bool {
        let period = cycle.period_key(now_unix_ms);
        if self.period == period {
            return false;
        }
        if !self.period.is_empty() {
            self.previous = Some(ClosedPeriod {
                period: std::mem::take(&mut self.period),
                counts: std::mem::take(&mut self.counts),
            });
        }
        self.period = period;
        self.counts.clear();
        self.reservations.clear();
        true
    }

    pub fn prune_reservations(&mut self, now_unix_ms: u64) {
        self.reservations
            .retain(|_, reservation| reservation.expires_unix_ms > now_unix_ms);
    }

    pub fn count(&self, counter: &str) -> u64 {
        self.counts.get(counter).copied().unwrap_or(0)
    }

    pub fn reserved(&self, counter: &str, now_unix_ms: u64) -> u64 {
        self.reservations
            .values()
            .filter(|reservation| {
                reservation.counter == counter && reservation.expires_unix_ms > now_unix_ms
            })
            .count() as u64
    }

    /// Committed count plus live reservations.
    pub fn used(&self, counter: &str, now_unix_ms: u64) -> u64 {
        self.count(counter)
            .saturating_add(self.reserved(counter, now_unix_ms))
    }

    pub fn increment(&mut self, counter: &str) -> u64 {
        let entry = self.counts.entry(counter.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    pub fn reserve(&mut self, counter: &str, expires_unix_ms: u64) -> String {
        let id = new_reservation_id(expires_unix_ms);
        self.reservations.insert(
            id.clone(),
            QuotaReservation {
                counter: counter.to_string(),
                expires_unix_ms,
            },
        );
        id
    }

    /// Turns a reservation into a committed count. A reservation lost to
    /// rollover or expiry still counts the call that happened.
    pub fn commit(&mut self, reservation_id: &str, counter: &str) -> u64 {
        self.reservations.remove(reservation_id);
        self.increment(counter)
    }

    pub fn release(&mut self, reservation_id: &str) -> bool {
        self.reservations.remove(reservation_id).is_some()
    }
}

/// Counter key used inside the per-target ledger.
pub fn target_counter_key(target: &str) -> String {
    format!("target:{target}")
}

fn new_reservation_id(expires_unix_ms: u64) -> String {
    format!(
        "r-{}-{}-{}",
        std::process::id(),
        expires_unix_ms,
        RESERVATION_NONCE.fetch_add(1, Ordering::Relaxed)
    )
}

#[cfg(test)]
mod tests {
    use super::{QuotaLedger, TOTAL_CALLS};
    use crate::config::QuotaCycle;

    const DAY_MS: u64 = 86_400_000;

    #[test]
    fn unit_rollover_archives_closed_period_and_drops_reservations() {
        let mut ledger = QuotaLedger::default();
        assert!(ledger.roll_to(QuotaCycle::UtcDay, 0));
        ledger.increment(TOTAL_CALLS);
        ledger.reserve(TOTAL_CALLS, DAY_MS * 2);
        assert_eq!(ledger.used(TOTAL_CALLS, 10), 2);

        assert!(!ledger.roll_to(QuotaCycle::UtcDay, DAY_MS - 1));
        assert!(ledger.roll_to(QuotaCycle::UtcDay, DAY_MS));
        assert_eq!(ledger.used(TOTAL_CALLS, DAY_MS), 0);
        let previous = ledger.previous.as_ref().expect("closed period");
        assert_eq!(previous.period, "1970-01-01");
        assert_eq!(previous.counts.get(TOTAL_CALLS), Some(&1));
    }

    #[test]
    fn unit_reservations_commit_release_and_expire() {
        let mut ledger = QuotaLedger::default();
        let first = ledger.reserve("dm", 1_000);
        let second = ledger.reserve("dm", 5_000);
        assert_ne!(first, second);
        assert_eq!(ledger.reserved("dm", 500), 2);
        assert_eq!(ledger.reserved("dm", 1_000), 1);

        assert_eq!(ledger.commit(&second, "dm"), 1);
        assert!(!ledger.release(&second));
        assert!(ledger.release(&first));
        ledger.prune_reservations(10_000);
        assert!(ledger.reservations.is_empty());
        assert_eq!(ledger.used("dm", 10_000), 1);
    }
}
