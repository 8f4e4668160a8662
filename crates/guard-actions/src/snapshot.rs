use std::collections::BTreeMap;

use guard_limiter::{CircuitStatus, QuotaLimits, QuotaUsage};
use serde::Serialize;

use crate::write_guard::WriteGuard;

pub const RECOMMENDED_WRITE_FLOW: [&str; 3] = [
    "1) Call the write action with dry_run = true to preview it and receive a one-time approval_code.",
    "2) Ask the user for explicit confirmation_text in this thread.",
    "3) Execute the same payload with confirm = true, confirmation_text and approval_code.",
];

pub const RECOMMENDED_BATCH_FLOW: [&str; 4] = [
    "1) Create the batch from an explicit target list.",
    "2) Approve it once with the confirmation phrase.",
    "3) Run it repeatedly with a bounded max_actions until it completes.",
    "4) Re-approve when the approval lease expires; a quota pause resumes on the next run.",
];

/// Read-only view of the active action policy for operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicySnapshot {
    pub actions_enabled: bool,
    pub startup_block_reason: Option<String>,
    pub unsafe_issues: Vec<String>,
    pub unsafe_override: bool,
    pub allowed_targets: Vec<String>,
    pub require_allowlist: bool,
    pub require_confirmation_text: bool,
    pub confirmation_phrase: Option<String>,
    pub min_confirmation_text_len: usize,
    pub require_approval_code: bool,
    pub min_approval_age_secs: u64,
    pub approval_ttl_secs: Option<u64>,
    pub idempotency_enabled: bool,
    pub idempotency_window_secs: u64,
    pub write_guard: WriteGuard,
    pub max_message_len: usize,
    pub max_file_mb: u64,
    pub quotas: QuotaLimits,
    pub quota_usage: BTreeMap<String, QuotaUsage>,
    pub circuit: CircuitStatus,
    pub recommended_flow: Vec<String>,
    pub recommended_batch_flow: Vec<String>,
}
