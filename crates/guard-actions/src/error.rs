use guard_core::StoreError;
use guard_limiter::LimiterError;
use thiserror::Error;

/// Policy decisions and failures surfaced to the tool layer verbatim.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("actions are disabled; set actions_enabled = true")]
    ActionsDisabled,
    #[error("unsafe action policy detected: {}", .issues.join("; "))]
    UnsafeConfiguration { issues: Vec<String> },
    #[error("target '{target}' is not in the allowlist")]
    NotAllowlisted { target: String },
    #[error("allowlist is required but no targets are configured")]
    AllowlistEmpty,
    #[error("execution blocked: set confirm = true to run a write action")]
    ConfirmationRequired,
    #[error("execution blocked: confirmation_text must be exactly '{expected}' (min {min_len} chars)")]
    ConfirmationMismatch { expected: String, min_len: usize },
    #[error("execution blocked: approval_code is required")]
    ApprovalRequired,
    #[error("execution blocked: approval_code is invalid or unknown")]
    ApprovalNotFound,
    #[error("execution blocked: approval_code does not match this payload")]
    ApprovalMismatch,
    #[error("execution blocked: approval_code was already used")]
    ApprovalConsumed,
    #[error("execution blocked: approval_code matures in {retry_after_secs}s")]
    ApprovalTooFresh { retry_after_secs: u64 },
    #[error("execution blocked: approval_code expired")]
    ApprovalExpired,
    #[error("duplicate action blocked by idempotency window; retry after {retry_after_secs}s or force a resend")]
    DuplicateAction {
        action_hash: String,
        retry_after_secs: u64,
    },
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("direct write '{operation}' is blocked outside an allowed write context")]
    WriteBlocked { operation: String },
    #[error(transparent)]
    Limiter(#[from] LimiterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PolicyError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ActionsDisabled => "actions_disabled",
            Self::UnsafeConfiguration { .. } => "unsafe_configuration",
            Self::NotAllowlisted { .. } => "not_allowlisted",
            Self::AllowlistEmpty => "allowlist_empty",
            Self::ConfirmationRequired => "confirmation_required",
            Self::ConfirmationMismatch { .. } => "confirmation_mismatch",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalNotFound => "approval_not_found",
            Self::ApprovalMismatch => "approval_mismatch",
            Self::ApprovalConsumed => "approval_consumed",
            Self::ApprovalTooFresh { .. } => "approval_too_fresh",
            Self::ApprovalExpired => "approval_expired",
            Self::DuplicateAction { .. } => "duplicate_action",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::WriteBlocked { .. } => "write_blocked",
            Self::Limiter(error) => error.reason_code(),
            Self::Store(error) if error.is_lock_timeout() => "lock_timeout",
            Self::Store(_) => "state_store_error",
        }
    }

    /// Hint telling the caller how to get past this rejection.
    pub fn next_step(&self) -> Option<String> {
        let step = match self {
            Self::ActionsDisabled => "Set actions_enabled = true and restart the host.".to_string(),
            Self::UnsafeConfiguration { .. } => {
                "Restore the strict safety settings and restart; use unsafe_override only for temporary debugging."
                    .to_string()
            }
            Self::NotAllowlisted { .. } => {
                "Add this target to allowed_targets, then retry the preview.".to_string()
            }
            Self::AllowlistEmpty => {
                "Configure allowed_targets with explicit targets, then retry the preview.".to_string()
            }
            Self::ConfirmationRequired => {
                "Preview the action first, then rerun it with confirm = true.".to_string()
            }
            Self::ConfirmationMismatch { expected, .. } => {
                format!("Use confirmation_text '{expected}' exactly.")
            }
            Self::ApprovalRequired
            | Self::ApprovalNotFound
            | Self::ApprovalMismatch
            | Self::ApprovalConsumed
            | Self::ApprovalExpired => {
                "Preview the identical action to get a fresh one-time approval_code, then execute."
                    .to_string()
            }
            Self::ApprovalTooFresh { retry_after_secs } => {
                format!("Wait {retry_after_secs}s, then execute with the same approval_code.")
            }
            Self::DuplicateAction {
                retry_after_secs, ..
            } => format!(
                "Wait {retry_after_secs}s for the idempotency window, or set force_resend = true if the resend is intentional."
            ),
            Self::Limiter(error) => match error.retry_after_secs() {
                Some(seconds) if error.is_backpressure() => {
                    format!("Retry after {seconds}s.")
                }
                _ => return None,
            },
            Self::InvalidPayload(_) | Self::WriteBlocked { .. } | Self::Store(_) => return None,
        };
        Some(step)
    }

    /// Retrying this target later cannot succeed without operator action.
    pub fn is_permanent_for_target(&self) -> bool {
        matches!(
            self,
            Self::NotAllowlisted { .. } | Self::AllowlistEmpty | Self::InvalidPayload(_)
        )
    }
}
