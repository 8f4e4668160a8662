//! Write-action policy engine.
//!
//! Every write goes through the same gates: startup safety, master switch,
//! allowlist, payload validation, then for interactive executions the
//! confirmation ritual and a one-time approval code. Idempotency is claimed
//! before the remote call and finalized only after it succeeds.

use std::collections::BTreeSet;
use std::sync::Arc;

use guard_core::{Clock, StateStore};
use guard_limiter::CallExecutor;
use serde::Serialize;
use serde_json::Value;

use crate::action::WriteAction;
use crate::approvals::{ApprovalGrant, ApprovalStore};
use crate::config::{ActionPolicyConfig, ACTIONS_WRITE_CONTEXT};
use crate::error::PolicyError;
use crate::gateway::RemoteGateway;
use crate::idempotency::{IdempotencyClaim, IdempotencyGuard};
use crate::snapshot::{PolicySnapshot, RECOMMENDED_BATCH_FLOW, RECOMMENDED_WRITE_FLOW};
use crate::write_guard::WriteGuard;

/// A real (non dry-run) execution request from the tool layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub action: WriteAction,
    pub confirm: bool,
    pub confirmation_text: String,
    pub approval_code: Option<String>,
    pub force_resend: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionPreview {
    pub dry_run: bool,
    pub action: WriteAction,
    pub action_hash: String,
    pub approval: Option<ApprovalGrant>,
    pub confirmation_text_required: Option<String>,
    /// Seconds left in the idempotency window when an identical action ran recently.
    pub duplicate_retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub action: WriteAction,
    pub action_hash: String,
    pub forced: bool,
    pub remote: Value,
}

pub struct ActionPolicyEngine {
    config: ActionPolicyConfig,
    allowlist: BTreeSet<String>,
    unsafe_issues: Vec<String>,
    approvals: ApprovalStore,
    idempotency: IdempotencyGuard,
    write_guard: WriteGuard,
    executor: CallExecutor,
    gateway: Arc<dyn RemoteGateway>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ActionPolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionPolicyEngine")
            .field("config", &self.config)
            .field("unsafe_issues", &self.unsafe_issues)
            .finish_non_exhaustive()
    }
}

impl ActionPolicyEngine {
    /// Builds the engine and runs the one-time startup safety check.
    pub fn new(
        config: ActionPolicyConfig,
        store: StateStore,
        executor: CallExecutor,
        gateway: Arc<dyn RemoteGateway>,
    ) -> Self {
        let clock = executor.limiter().clock().clone();
        // A claim must outlive the slowest executor run it guards.
        let claim_ttl_secs = config
            .idempotency_claim_ttl_secs
            .max(executor.limiter().config().max_call_span_secs());
        let unsafe_issues = config.unsafe_issues();
        if !unsafe_issues.is_empty() {
            if config.unsafe_override {
                tracing::warn!(issues = ?unsafe_issues, "unsafe action policy accepted by override");
            } else {
                tracing::error!(issues = ?unsafe_issues, "unsafe action policy; executions are blocked");
            }
        }
        Self {
            allowlist: config.normalized_allowlist(),
            approvals: ApprovalStore::new(
                store.clone(),
                clock.clone(),
                config.min_approval_age_secs,
                config.approval_ttl_secs,
            ),
            idempotency: IdempotencyGuard::new(
                store,
                clock.clone(),
                config.idempotency_window_secs,
                claim_ttl_secs,
            ),
            write_guard: WriteGuard::from_config(&config.write_guard),
            unsafe_issues,
            config,
            executor,
            gateway,
            clock,
        }
    }

    pub fn config(&self) -> &ActionPolicyConfig {
        &self.config
    }

    pub fn write_guard(&self) -> &WriteGuard {
        &self.write_guard
    }

    pub fn executor(&self) -> &CallExecutor {
        &self.executor
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Reason every request is refused, fixed at construction.
    pub fn startup_block(&self) -> Option<PolicyError> {
        if !self.unsafe_issues.is_empty() && !self.config.unsafe_override {
            return Some(PolicyError::UnsafeConfiguration {
                issues: self.unsafe_issues.clone(),
            });
        }
        None
    }

    /// Startup block first, then the master switch.
    pub fn ensure_available(&self) -> Result<(), PolicyError> {
        if let Some(blocked) = self.startup_block() {
            return Err(blocked);
        }
        if !self.config.actions_enabled {
            return Err(PolicyError::ActionsDisabled);
        }
        Ok(())
    }

    /// Allowlist check on a normalized target.
    pub fn check_target(&self, target: &str) -> Result<(), PolicyError> {
        if self.config.require_allowlist && self.allowlist.is_empty() {
            return Err(PolicyError::AllowlistEmpty);
        }
        if !self.allowlist.is_empty() && !self.allowlist.contains(target) {
            return Err(PolicyError::NotAllowlisted {
                target: target.to_string(),
            });
        }
        Ok(())
    }

    /// Case-insensitive exact match against the configured phrase.
    pub fn check_confirmation_text(&self, confirmation_text: &str) -> Result<(), PolicyError> {
        if !self.config.require_confirmation_text {
            return Ok(());
        }
        let text = confirmation_text.trim();
        let expected = self.config.normalized_phrase();
        let mismatch = || PolicyError::ConfirmationMismatch {
            expected: expected.clone(),
            min_len: self.config.min_confirmation_text_len,
        };
        if text.chars().count() < self.config.min_confirmation_text_len {
            return Err(mismatch());
        }
        if !expected.is_empty() && text.to_lowercase() != expected {
            return Err(mismatch());
        }
        Ok(())
    }

    /// Dry run: validates the action and issues a one-time approval code.
    #[tracing::instrument(
        name = "guard_actions.preview",
        skip(self, action),
        fields(target = %action.target, action = action.payload.kind())
    )]
    pub fn preview(&self, action: WriteAction) -> Result<ActionPreview, PolicyError> {
        self.ensure_available()?;
        self.check_target(&action.target)?;
        action.validate(&self.config)?;

        let action_hash = action.action_hash();
        let approval = if self.config.require_approval_code {
            Some(self.approvals.issue(&action_hash)?)
        } else {
            None
        };
        let duplicate_retry_after_secs = if self.config.idempotency_enabled {
            self.idempotency.recent(&action_hash)
        } else {
            None
        };
        Ok(ActionPreview {
            dry_run: true,
            action,
            action_hash,
            approval,
            confirmation_text_required: self
                .config
                .require_confirmation_text
                .then(|| self.config.normalized_phrase()),
            duplicate_retry_after_secs,
        })
    }

    /// Real execution behind the full confirmation and approval ritual.
    #[tracing::instrument(
        name = "guard_actions.execute",
        skip(self, request),
        fields(target = %request.action.target, action = request.action.payload.kind())
    )]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ActionOutcome, PolicyError> {
        self.ensure_available()?;
        self.check_target(&request.action.target)?;
        if !request.confirm {
            return Err(PolicyError::ConfirmationRequired);
        }
        self.check_confirmation_text(&request.confirmation_text)?;
        request.action.validate(&self.config)?;

        let action_hash = request.action.action_hash();
        let code = request.approval_code.as_deref().unwrap_or_default();
        if self.config.require_approval_code {
            self.approvals.redeem(code, &action_hash).await?;
        }
        let claim = match self.claim(&action_hash, request.force_resend).await {
            Ok(claim) => claim,
            Err(error) => {
                // Nothing was sent; the code stays usable, e.g. with force_resend.
                if self.config.require_approval_code {
                    self.approvals.restore(code, &action_hash).await;
                }
                return Err(error);
            }
        };
        self.perform(request.action, action_hash, claim, request.force_resend)
            .await
    }

    /// Execution on behalf of an approved batch: the batch approval stands in
    /// for per-action confirmation and approval codes.
    #[tracing::instrument(
        name = "guard_actions.execute_batch_item",
        skip(self, action),
        fields(target = %action.target, action = action.payload.kind())
    )]
    pub async fn execute_batch_item(&self, action: WriteAction) -> Result<ActionOutcome, PolicyError> {
        self.ensure_available()?;
        self.check_target(&action.target)?;
        action.validate(&self.config)?;
        let action_hash = action.action_hash();
        let claim = self.claim(&action_hash, false).await?;
        self.perform(action, action_hash, claim, false).await
    }

    async fn claim(
        &self,
        action_hash: &str,
        force_resend: bool,
    ) -> Result<Option<IdempotencyClaim>, PolicyError> {
        if !self.config.idempotency_enabled {
            return Ok(None);
        }
        self.idempotency
            .claim(action_hash, force_resend)
            .await
            .map(Some)
    }

    async fn release(&self, claim: Option<&IdempotencyClaim>) {
        if let Some(claim) = claim {
            self.idempotency.release(claim).await;
        }
    }

    async fn perform(
        &self,
        action: WriteAction,
        action_hash: String,
        claim: Option<IdempotencyClaim>,
        forced: bool,
    ) -> Result<ActionOutcome, PolicyError> {
        if let Err(error) = self
            .write_guard
            .authorize(Some(ACTIONS_WRITE_CONTEXT), action.payload.kind())
        {
            self.release(claim.as_ref()).await;
            return Err(error);
        }

        let quota = action.quota_request();
        let gateway = &self.gateway;
        let target_action = &action;
        let result = self
            .executor
            .execute(Some(&quota), move || {
                gateway.perform(target_action, ACTIONS_WRITE_CONTEXT)
            })
            .await;

        match result {
            Ok(remote) => {
                if let Some(claim) = claim.as_ref() {
                    if let Err(error) = self.idempotency.finalize(claim).await {
                        tracing::error!(%error, action_hash, "write succeeded but idempotency record was not saved");
                    }
                }
                tracing::info!(
                    action_hash,
                    target = %action.target,
                    action = action.payload.kind(),
                    forced,
                    "write action executed"
                );
                Ok(ActionOutcome {
                    action,
                    action_hash,
                    forced,
                    remote,
                })
            }
            Err(error) => {
                self.release(claim.as_ref()).await;
                tracing::warn!(
                    action_hash,
                    reason_code = error.reason_code(),
                    %error,
                    "write action failed"
                );
                Err(PolicyError::Limiter(error))
            }
        }
    }

    pub fn policy_snapshot(&self) -> PolicySnapshot {
        let limiter = self.executor.limiter();
        PolicySnapshot {
            actions_enabled: self.ensure_available().is_ok(),
            startup_block_reason: self.startup_block().map(|error| error.to_string()),
            unsafe_issues: self.unsafe_issues.clone(),
            unsafe_override: self.config.unsafe_override,
            allowed_targets: self.allowlist.iter().cloned().collect(),
            require_allowlist: self.config.require_allowlist,
            require_confirmation_text: self.config.require_confirmation_text,
            confirmation_phrase: self
                .config
                .require_confirmation_text
                .then(|| self.config.normalized_phrase()),
            min_confirmation_text_len: self.config.min_confirmation_text_len,
            require_approval_code: self.config.require_approval_code,
            min_approval_age_secs: self.config.min_approval_age_secs,
            approval_ttl_secs: self
                .config
                .require_approval_code
                .then_some(self.config.approval_ttl_secs),
            idempotency_enabled: self.config.idempotency_enabled,
            idempotency_window_secs: self.config.idempotency_window_secs,
            write_guard: self.write_guard.clone(),
            max_message_len: self.config.max_message_len,
            max_file_mb: self.config.max_file_mb,
            quotas: limiter.config().quotas.clone(),
            quota_usage: limiter.quota_usage(),
            circuit: limiter.circuit_status(),
            recommended_flow: RECOMMENDED_WRITE_FLOW.iter().map(|step| step.to_string()).collect(),
            recommended_batch_flow: RECOMMENDED_BATCH_FLOW
                .iter()
                .map(|step| step.to_string())
                .collect(),
        }
    }
}
