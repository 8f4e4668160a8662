use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use guard_core::{ceil_ms_to_secs, secs_to_ms, Clock, StateStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

pub const IDEMPOTENCY_RECORD: &str = "action-idempotency";
const IDEMPOTENCY_SCHEMA_VERSION: u32 = 1;

static CLAIM_NONCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    /// Claimed by an execution whose remote call has not finished.
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub first_seen_unix_ms: u64,
    pub expires_unix_ms: u64,
    pub state: IdempotencyState,
    #[serde(default)]
    pub claim_id: Option<String>,
    /// Completed window a forced resend is running over; restored if the
    /// resend fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<CompletedWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedWindow {
    pub first_seen_unix_ms: u64,
    pub expires_unix_ms: u64,
}

impl IdempotencyRecord {
    /// The completed window still covering this hash at `now_unix_ms`.
    fn live_window(&self, now_unix_ms: u64) -> Option<CompletedWindow> {
        let window = match self.state {
            IdempotencyState::Completed => Some(CompletedWindow {
                first_seen_unix_ms: self.first_seen_unix_ms,
                expires_unix_ms: self.expires_unix_ms,
            }),
            IdempotencyState::Pending => self.previous,
        };
        window.filter(|window| window.expires_unix_ms > now_unix_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct IdempotencyLedger {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    actions: BTreeMap<String, IdempotencyRecord>,
}

/// Proof that the caller owns the in-flight slot for an action hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub action_hash: String,
    claim_id: String,
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    store: StateStore,
    clock: Arc<dyn Clock>,
    window_secs: u64,
    claim_ttl_secs: u64,
}

impl IdempotencyGuard {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, window_secs: u64, claim_ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            window_secs,
            claim_ttl_secs,
        }
    }

    /// How long an unfinished claim blocks the hash.
    pub fn claim_ttl_secs(&self) -> u64 {
        self.claim_ttl_secs
    }

    /// Claims `action_hash` for one execution. A live record blocks the claim
    /// with `DuplicateAction` unless `force_resend` is set; a forced claim
    /// keeps the completed window it overrides.
    pub async fn claim(&self, action_hash: &str, force_resend: bool) -> Result<IdempotencyClaim, PolicyError> {
        let now = self.clock.now_unix_ms();
        let claim_id = format!(
            "c-{}-{}-{}",
            std::process::id(),
            now,
            CLAIM_NONCE.fetch_add(1, Ordering::Relaxed)
        );
        let claim_expires = now.saturating_add(secs_to_ms(self.claim_ttl_secs));
        let claimed = self
            .store
            .update_async(IDEMPOTENCY_RECORD, |ledger: &mut IdempotencyLedger| {
                ledger.schema_version = IDEMPOTENCY_SCHEMA_VERSION;
                ledger
                    .actions
                    .retain(|_, record| record.expires_unix_ms > now);
                let previous = match ledger.actions.get(action_hash) {
                    Some(existing) if !force_resend => {
                        return Err(existing.expires_unix_ms - now);
                    }
                    Some(existing) => existing.live_window(now),
                    None => None,
                };
                let expires_unix_ms = previous
                    .map_or(claim_expires, |window| window.expires_unix_ms.max(claim_expires));
                ledger.actions.insert(
                    action_hash.to_string(),
                    IdempotencyRecord {
                        first_seen_unix_ms: now,
                        expires_unix_ms,
                        state: IdempotencyState::Pending,
                        claim_id: Some(claim_id.clone()),
                        previous,
                    },
                );
                Ok(())
            })
            .await?;
        match claimed {
            Ok(()) => Ok(IdempotencyClaim {
                action_hash: action_hash.to_string(),
                claim_id,
            }),
            Err(remaining_ms) => {
                let retry_after_secs = ceil_ms_to_secs(remaining_ms);
                tracing::info!(action_hash, retry_after_secs, "duplicate action blocked");
                Err(PolicyError::DuplicateAction {
                    action_hash: action_hash.to_string(),
                    retry_after_secs,
                })
            }
        }
    }

    /// Records the successful execution; the window starts now.
    pub async fn finalize(&self, claim: &IdempotencyClaim) -> Result<(), StoreError> {
        let now = self.clock.now_unix_ms();
        let expires = now.saturating_add(secs_to_ms(self.window_secs));
        self.store
            .update_async(IDEMPOTENCY_RECORD, |ledger: &mut IdempotencyLedger| {
                ledger.actions.insert(
                    claim.action_hash.clone(),
                    IdempotencyRecord {
                        first_seen_unix_ms: now,
                        expires_unix_ms: expires,
                        state: IdempotencyState::Completed,
                        claim_id: None,
                        previous: None,
                    },
                );
            })
            .await
    }

    /// Drops a pending claim after a failed execution, putting back the
    /// completed window a forced resend ran over. Failures are logged; the
    /// claim then lapses on its own.
    pub async fn release(&self, claim: &IdempotencyClaim) {
        let now = self.clock.now_unix_ms();
        let released = self
            .store
            .update_async(IDEMPOTENCY_RECORD, |ledger: &mut IdempotencyLedger| {
                let restored = match ledger.actions.get(&claim.action_hash) {
                    Some(record)
                        if record.state == IdempotencyState::Pending
                            && record.claim_id.as_deref() == Some(claim.claim_id.as_str()) =>
                    {
                        record.previous.filter(|window| window.expires_unix_ms > now)
                    }
                    _ => return,
                };
                match restored {
                    Some(window) => {
                        ledger.actions.insert(
                            claim.action_hash.clone(),
                            IdempotencyRecord {
                                first_seen_unix_ms: window.first_seen_unix_ms,
                                expires_unix_ms: window.expires_unix_ms,
                                state: IdempotencyState::Completed,
                                claim_id: None,
                                previous: None,
                            },
                        );
                    }
                    None => {
                        ledger.actions.remove(&claim.action_hash);
                    }
                }
            })
            .await;
        if let Err(error) = released {
            tracing::warn!(action_hash = %claim.action_hash, %error, "failed to release idempotency claim");
        }
    }

    /// Seconds left in the window for `action_hash`, if it is live.
    pub fn recent(&self, action_hash: &str) -> Option<u64> {
        let now = self.clock.now_unix_ms();
        let ledger: IdempotencyLedger = self.store.read_only(IDEMPOTENCY_RECORD);
        ledger
            .actions
            .get(action_hash)
            .filter(|record| record.expires_unix_ms > now)
            .map(|record| ceil_ms_to_secs(record.expires_unix_ms - now))
    }
}
