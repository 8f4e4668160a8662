//! One-time approval codes issued by previews and redeemed by executions.
//!
//! Codes are never deleted on use: redemption flips `consumed` inside the
//! same locked update that checks eligibility, so two racing executions see
//! exactly one winner. Records are pruned lazily one TTL after expiry.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use guard_core::{ceil_ms_to_secs, secs_to_ms, Clock, StateStore, StoreError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

pub const APPROVALS_RECORD: &str = "action-approvals";
const APPROVALS_SCHEMA_VERSION: u32 = 1;
const APPROVAL_CODE_BYTES: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub action_hash: String,
    pub issued_unix_ms: u64,
    pub min_execute_unix_ms: u64,
    pub expires_unix_ms: u64,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default)]
    pub consumed_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ApprovalRegistry {
    #[serde(default)]
    schema_version: u32,
    #[serde(default)]
    approvals: BTreeMap<String, ApprovalRecord>,
}

impl ApprovalRegistry {
    fn prune(&mut self, now_unix_ms: u64, retention_ms: u64) {
        self.approvals.retain(|_, record| {
            record.expires_unix_ms.saturating_add(retention_ms) > now_unix_ms
        });
    }
}

/// What a preview hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalGrant {
    pub approval_code: String,
    pub action_hash: String,
    pub min_execute_unix_ms: u64,
    pub expires_unix_ms: u64,
    pub matures_in_secs: u64,
    pub expires_in_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ApprovalStore {
    store: StateStore,
    clock: Arc<dyn Clock>,
    min_age_secs: u64,
    ttl_secs: u64,
}

impl ApprovalStore {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, min_age_secs: u64, ttl_secs: u64) -> Self {
        Self {
            store,
            clock,
            min_age_secs,
            ttl_secs,
        }
    }

    pub fn issue(&self, action_hash: &str) -> Result<ApprovalGrant, StoreError> {
        let now = self.clock.now_unix_ms();
        let ttl_ms = secs_to_ms(self.ttl_secs);
        let record = ApprovalRecord {
            action_hash: action_hash.to_string(),
            issued_unix_ms: now,
            min_execute_unix_ms: now.saturating_add(secs_to_ms(self.min_age_secs)),
            expires_unix_ms: now.saturating_add(ttl_ms),
            consumed: false,
            consumed_unix_ms: None,
        };
        let code = self
            .store
            .update(APPROVALS_RECORD, |registry: &mut ApprovalRegistry| {
                registry.schema_version = APPROVALS_SCHEMA_VERSION;
                registry.prune(now, ttl_ms);
                let mut code = new_approval_code();
                while registry.approvals.contains_key(&code) {
                    code = new_approval_code();
                }
                registry.approvals.insert(code.clone(), record.clone());
                code
            })?;
        tracing::info!(
            action_hash,
            min_execute_unix_ms = record.min_execute_unix_ms,
            expires_unix_ms = record.expires_unix_ms,
            "approval code issued"
        );
        Ok(ApprovalGrant {
            approval_code: code,
            action_hash: action_hash.to_string(),
            min_execute_unix_ms: record.min_execute_unix_ms,
            expires_unix_ms: record.expires_unix_ms,
            matures_in_secs: self.min_age_secs,
            expires_in_secs: self.ttl_secs,
        })
    }

    /// Checks every redemption condition and consumes the code atomically.
    pub async fn redeem(&self, approval_code: &str, action_hash: &str) -> Result<(), PolicyError> {
        let code = approval_code.trim();
        if code.is_empty() {
            return Err(PolicyError::ApprovalRequired);
        }
        let now = self.clock.now_unix_ms();
        let retention_ms = secs_to_ms(self.ttl_secs);
        let decision = self
            .store
            .update_async(APPROVALS_RECORD, |registry: &mut ApprovalRegistry| {
                registry.schema_version = APPROVALS_SCHEMA_VERSION;
                registry.prune(now, retention_ms);
                let Some(record) = registry.approvals.get_mut(code) else {
                    return Err(PolicyError::ApprovalNotFound);
                };
                if record.consumed {
                    return Err(PolicyError::ApprovalConsumed);
                }
                if record.action_hash != action_hash {
                    return Err(PolicyError::ApprovalMismatch);
                }
                if now < record.min_execute_unix_ms {
                    return Err(PolicyError::ApprovalTooFresh {
                        retry_after_secs: ceil_ms_to_secs(record.min_execute_unix_ms - now),
                    });
                }
                if now >= record.expires_unix_ms {
                    return Err(PolicyError::ApprovalExpired);
                }
                record.consumed = true;
                record.consumed_unix_ms = Some(now);
                Ok(())
            })
            .await?;
        match &decision {
            Ok(()) => tracing::info!(action_hash, "approval code consumed"),
            Err(error) => {
                tracing::info!(action_hash, reason_code = error.reason_code(), "approval rejected")
            }
        }
        decision
    }

    /// Re-arms a code consumed by an execution that was then refused before
    /// any remote call.
    pub async fn restore(&self, approval_code: &str, action_hash: &str) {
        let code = approval_code.trim();
        let restored = self
            .store
            .update_async(APPROVALS_RECORD, |registry: &mut ApprovalRegistry| {
                match registry.approvals.get_mut(code) {
                    Some(record) if record.consumed && record.action_hash == action_hash => {
                        record.consumed = false;
                        record.consumed_unix_ms = None;
                        true
                    }
                    _ => false,
                }
            })
            .await;
        match restored {
            Ok(true) => tracing::info!(action_hash, "approval code restored"),
            Ok(false) => {}
            Err(error) => tracing::warn!(action_hash, %error, "failed to restore approval code"),
        }
    }
}

fn new_approval_code() -> String {
    let mut bytes = [0_u8; APPROVAL_CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
