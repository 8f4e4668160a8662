use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_TTL_SECS: u64 = 168 * 3_600;
pub const DEFAULT_APPROVAL_LEASE_SECS: u64 = 24 * 3_600;
pub const DEFAULT_RUN_LEASE_SECS: u64 = 1_800;
pub const DEFAULT_MAX_ATTEMPTS_PER_TARGET: u32 = 3;
pub const DEFAULT_MAX_ACTIONS_PER_RUN: usize = 100;
pub const DEFAULT_REPORT_ERROR_NEEDLE: &str = "quota";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Lifetime of a batch measured from creation.
    pub ttl_secs: u64,
    pub approval_lease_secs: u64,
    pub run_lease_secs: u64,
    /// Failed attempts after which a target is given up on.
    pub max_attempts_per_target: u32,
    pub default_max_actions: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_BATCH_TTL_SECS,
            approval_lease_secs: DEFAULT_APPROVAL_LEASE_SECS,
            run_lease_secs: DEFAULT_RUN_LEASE_SECS,
            max_attempts_per_target: DEFAULT_MAX_ATTEMPTS_PER_TARGET,
            default_max_actions: DEFAULT_MAX_ACTIONS_PER_RUN,
        }
    }
}

impl BatchConfig {
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.ttl_secs == 0 {
            issues.push("batch.ttl_secs must be greater than 0".to_string());
        }
        if self.approval_lease_secs == 0 {
            issues.push("batch.approval_lease_secs must be greater than 0".to_string());
        }
        if self.run_lease_secs == 0 {
            issues.push("batch.run_lease_secs must be greater than 0".to_string());
        }
        if self.max_attempts_per_target == 0 {
            issues.push("batch.max_attempts_per_target must be greater than 0".to_string());
        }
        if self.default_max_actions == 0 {
            issues.push("batch.default_max_actions must be greater than 0".to_string());
        }
        issues
    }
}
