use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::action::normalize_target;

pub const DEFAULT_CONFIRMATION_PHRASE: &str = "send now";
pub const DEFAULT_MIN_CONFIRMATION_TEXT_LEN: usize = 6;
pub const DEFAULT_MIN_APPROVAL_AGE_SECS: u64 = 10;
pub const DEFAULT_APPROVAL_TTL_SECS: u64 = 1_800;
pub const DEFAULT_IDEMPOTENCY_WINDOW_SECS: u64 = 24 * 3_600;
pub const DEFAULT_IDEMPOTENCY_CLAIM_TTL_SECS: u64 = 900;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2_000;
pub const DEFAULT_MAX_FILE_MB: u64 = 20;
/// Write context the policy engine authorizes itself under.
pub const ACTIONS_WRITE_CONTEXT: &str = "actions";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteGuardConfig {
    /// Blocks remote writes outside the allowed contexts.
    pub enforced: bool,
    /// Lets any context write. Weakens the guard.
    pub allow_direct_write: bool,
    pub allowed_contexts: Vec<String>,
}

impl Default for WriteGuardConfig {
    fn default() -> Self {
        Self {
            enforced: true,
            allow_direct_write: false,
            allowed_contexts: vec![ACTIONS_WRITE_CONTEXT.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPolicyConfig {
    /// Master switch; every request is rejected while off.
    pub actions_enabled: bool,
    pub allowed_targets: Vec<String>,
    pub require_allowlist: bool,
    pub require_confirmation_text: bool,
    pub confirmation_phrase: String,
    pub min_confirmation_text_len: usize,
    pub require_approval_code: bool,
    pub min_approval_age_secs: u64,
    pub approval_ttl_secs: u64,
    pub idempotency_enabled: bool,
    pub idempotency_window_secs: u64,
    pub idempotency_claim_ttl_secs: u64,
    pub write_guard: WriteGuardConfig,
    /// Allows executing with a weakened configuration.
    pub unsafe_override: bool,
    pub max_message_len: usize,
    pub max_file_mb: u64,
}

impl Default for ActionPolicyConfig {
    fn default() -> Self {
        Self {
            actions_enabled: false,
            allowed_targets: Vec::new(),
            require_allowlist: true,
            require_confirmation_text: true,
            confirmation_phrase: DEFAULT_CONFIRMATION_PHRASE.to_string(),
            min_confirmation_text_len: DEFAULT_MIN_CONFIRMATION_TEXT_LEN,
            require_approval_code: true,
            min_approval_age_secs: DEFAULT_MIN_APPROVAL_AGE_SECS,
            approval_ttl_secs: DEFAULT_APPROVAL_TTL_SECS,
            idempotency_enabled: true,
            idempotency_window_secs: DEFAULT_IDEMPOTENCY_WINDOW_SECS,
            idempotency_claim_ttl_secs: DEFAULT_IDEMPOTENCY_CLAIM_TTL_SECS,
            write_guard: WriteGuardConfig::default(),
            unsafe_override: false,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            max_file_mb: DEFAULT_MAX_FILE_MB,
        }
    }
}

impl ActionPolicyConfig {
    /// Settings that weaken the safe defaults.
    pub fn unsafe_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.require_allowlist {
            issues.push("require_allowlist must be true".to_string());
        }
        if !self.require_confirmation_text {
            issues.push("require_confirmation_text must be true".to_string());
        }
        if !self.require_approval_code {
            issues.push("require_approval_code must be true".to_string());
        }
        if !self.idempotency_enabled {
            issues.push("idempotency_enabled must be true".to_string());
        }
        if !self.write_guard.enforced {
            issues.push("write_guard.enforced must be true".to_string());
        }
        if self.write_guard.allow_direct_write {
            issues.push("write_guard.allow_direct_write must stay false".to_string());
        }
        issues
    }

    pub fn normalized_allowlist(&self) -> BTreeSet<String> {
        self.allowed_targets
            .iter()
            .map(|target| normalize_target(target))
            .filter(|target| !target.is_empty())
            .collect()
    }

    /// The phrase as compared: trimmed and lowercased.
    pub fn normalized_phrase(&self) -> String {
        self.confirmation_phrase.trim().to_lowercase()
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mb.saturating_mul(1024 * 1024)
    }

    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.approval_ttl_secs == 0 {
            issues.push("approval_ttl_secs must be > 0".to_string());
        }
        if self.min_approval_age_secs >= self.approval_ttl_secs && self.approval_ttl_secs > 0 {
            issues.push(format!(
                "min_approval_age_secs ({}) must be below approval_ttl_secs ({})",
                self.min_approval_age_secs, self.approval_ttl_secs
            ));
        }
        if self.max_message_len == 0 {
            issues.push("max_message_len must be > 0".to_string());
        }
        if self.require_confirmation_text && self.normalized_phrase().is_empty() {
            issues.push("confirmation_phrase cannot be empty".to_string());
        }
        issues
    }
}
