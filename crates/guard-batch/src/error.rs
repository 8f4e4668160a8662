use guard_actions::PolicyError;
use guard_core::StoreError;
use thiserror::Error;

use crate::record::{BatchStatus, StatusTransitionError};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("batch '{batch_id}' not found")]
    NotFound { batch_id: String },
    #[error("invalid batch request: {0}")]
    InvalidRequest(String),
    #[error("batch '{batch_id}' is expired")]
    Expired { batch_id: String },
    #[error("batch '{batch_id}' is {status:?} and can no longer be changed")]
    Finished { batch_id: String, status: BatchStatus },
    #[error("batch '{batch_id}' is not approved; approve it first")]
    NotApproved { batch_id: String },
    #[error("batch '{batch_id}' approval lease expired; approve it again")]
    ApprovalLeaseExpired { batch_id: String },
    #[error("batch is already running by worker '{owner}'; retry after {retry_after_secs}s")]
    BatchBusy { owner: String, retry_after_secs: u64 },
    #[error("run lease on batch '{batch_id}' was taken over by another worker")]
    LeaseLost { batch_id: String },
    #[error(transparent)]
    Transition(#[from] StatusTransitionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BatchError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "batch_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Expired { .. } => "batch_expired",
            Self::Finished { .. } => "batch_finished",
            Self::NotApproved { .. } => "batch_not_approved",
            Self::ApprovalLeaseExpired { .. } => "approval_lease_expired",
            Self::BatchBusy { .. } => "batch_busy",
            Self::LeaseLost { .. } => "lease_lost",
            Self::Transition(_) => "invalid_transition",
            Self::Policy(error) => error.reason_code(),
            Self::Store(error) if error.is_lock_timeout() => "lock_timeout",
            Self::Store(_) => "state_store_error",
        }
    }

    pub fn next_step(&self) -> Option<String> {
        match self {
            Self::NotApproved { .. } | Self::ApprovalLeaseExpired { .. } => Some(
                "Approve the batch with the confirmation phrase, then run it again.".to_string(),
            ),
            Self::BatchBusy {
                retry_after_secs, ..
            } => Some(format!(
                "Wait for the other worker to finish or retry in {retry_after_secs}s."
            )),
            Self::Expired { .. } => {
                Some("Create a new batch for the remaining targets.".to_string())
            }
            Self::Policy(error) => error.next_step(),
            _ => None,
        }
    }
}
