//! Aggregate configuration: TOML file first, then `GUARD_*` environment
//! overrides, then validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use guard_actions::ActionPolicyConfig;
use guard_batch::BatchConfig;
use guard_limiter::LimiterConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Shared state directory; `None` keeps state in process memory.
    pub state_dir: Option<PathBuf>,
    pub lock_timeout_ms: u64,
    pub limiter: LimiterConfig,
    pub actions: ActionPolicyConfig,
    pub batch: BatchConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            limiter: LimiterConfig::default(),
            actions: ActionPolicyConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Loads `path` when it exists, applies the process environment and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::from_toml_str(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            _ => Self::default(),
        };
        let env = std::env::vars()
            .filter(|(key, _)| key.starts_with("GUARD_"))
            .collect::<BTreeMap<_, _>>();
        config.apply_env_map(&env);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("invalid guard configuration")
    }

    /// Applies `GUARD_*` overrides. Unparsable values are logged and ignored.
    pub fn apply_env_map(&mut self, env: &BTreeMap<String, String>) {
        if let Some(dir) = env
            .get("GUARD_STATE_DIR")
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty())
        {
            self.state_dir = Some(PathBuf::from(dir));
        }
        override_parsed(env, "GUARD_LOCK_TIMEOUT_MS", &mut self.lock_timeout_ms);

        let limiter = &mut self.limiter;
        override_parsed(env, "GUARD_REQUESTS_PER_SECOND", &mut limiter.requests_per_second);
        override_parsed(env, "GUARD_BURST_CAPACITY", &mut limiter.burst_capacity);
        override_parsed(env, "GUARD_DIRECT_MESSAGE_LIMIT", &mut limiter.quotas.direct_messages);
        override_parsed(
            env,
            "GUARD_MEMBERSHIP_CHANGE_LIMIT",
            &mut limiter.quotas.membership_changes,
        );
        override_parsed(env, "GUARD_GROUP_MESSAGE_LIMIT", &mut limiter.quotas.group_messages);
        override_parsed(
            env,
            "GUARD_PER_TARGET_MESSAGE_LIMIT",
            &mut limiter.quotas.per_target_messages,
        );
        override_parsed(env, "GUARD_CIRCUIT_THRESHOLD_SECS", &mut limiter.circuit_threshold_secs);
        override_parsed(env, "GUARD_CIRCUIT_COOLDOWN_SECS", &mut limiter.circuit_cooldown_secs);
        override_parsed(env, "GUARD_MAX_RETRIES", &mut limiter.retry.max_retries);

        let actions = &mut self.actions;
        override_bool(env, "GUARD_ACTIONS_ENABLED", &mut actions.actions_enabled);
        if let Some(raw) = env.get("GUARD_ALLOWED_TARGETS") {
            actions.allowed_targets = raw
                .split(',')
                .map(str::trim)
                .filter(|target| !target.is_empty())
                .map(str::to_string)
                .collect();
        }
        override_bool(env, "GUARD_REQUIRE_ALLOWLIST", &mut actions.require_allowlist);
        override_bool(
            env,
            "GUARD_REQUIRE_CONFIRMATION_TEXT",
            &mut actions.require_confirmation_text,
        );
        if let Some(phrase) = env
            .get("GUARD_CONFIRMATION_PHRASE")
            .filter(|raw| !raw.trim().is_empty())
        {
            actions.confirmation_phrase = phrase.trim().to_string();
        }
        override_bool(env, "GUARD_REQUIRE_APPROVAL_CODE", &mut actions.require_approval_code);
        override_parsed(env, "GUARD_MIN_APPROVAL_AGE_SECS", &mut actions.min_approval_age_secs);
        override_parsed(env, "GUARD_APPROVAL_TTL_SECS", &mut actions.approval_ttl_secs);
        override_bool(env, "GUARD_IDEMPOTENCY_ENABLED", &mut actions.idempotency_enabled);
        override_parsed(
            env,
            "GUARD_IDEMPOTENCY_WINDOW_SECS",
            &mut actions.idempotency_window_secs,
        );
        override_bool(env, "GUARD_WRITE_GUARD_ENFORCED", &mut actions.write_guard.enforced);
        override_bool(
            env,
            "GUARD_ALLOW_DIRECT_WRITE",
            &mut actions.write_guard.allow_direct_write,
        );
        override_bool(env, "GUARD_UNSAFE_OVERRIDE", &mut actions.unsafe_override);
        override_parsed(env, "GUARD_MAX_MESSAGE_LEN", &mut actions.max_message_len);
        override_parsed(env, "GUARD_MAX_FILE_MB", &mut actions.max_file_mb);

        let batch = &mut self.batch;
        override_parsed(env, "GUARD_BATCH_TTL_SECS", &mut batch.ttl_secs);
        override_parsed(
            env,
            "GUARD_BATCH_APPROVAL_LEASE_SECS",
            &mut batch.approval_lease_secs,
        );
        override_parsed(env, "GUARD_BATCH_RUN_LEASE_SECS", &mut batch.run_lease_secs);
        override_parsed(
            env,
            "GUARD_BATCH_MAX_ATTEMPTS",
            &mut batch.max_attempts_per_target,
        );
    }

    pub fn validate(&self) -> Result<()> {
        let mut issues = self.limiter.validation_issues();
        issues.extend(self.actions.validation_issues());
        issues.extend(self.batch.validation_issues());
        if self.lock_timeout_ms == 0 {
            issues.push("lock_timeout_ms must be > 0".to_string());
        }
        if !issues.is_empty() {
            bail!("invalid guard configuration: {}", issues.join("; "));
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(env: &BTreeMap<String, String>, key: &str, slot: &mut T) {
    let Some(raw) = env.get(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

fn override_bool(env: &BTreeMap<String, String>, key: &str, slot: &mut bool) {
    let Some(raw) = env.get(key) else {
        return;
    };
    match parse_bool_env(raw) {
        Some(value) => *slot = value,
        None => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

fn parse_bool_env(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
