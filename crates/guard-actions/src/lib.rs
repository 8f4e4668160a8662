//! Write-action policy: allowlists, the confirmation ritual, one-time approval
//! codes, idempotency and the direct-write guard.

pub mod action;
pub mod approvals;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod snapshot;
pub mod write_guard;

pub use action::{normalize_target, ActionPayload, WriteAction};
pub use approvals::{ApprovalGrant, ApprovalRecord, ApprovalStore, APPROVALS_RECORD};
pub use config::{ActionPolicyConfig, WriteGuardConfig, ACTIONS_WRITE_CONTEXT};
pub use engine::{ActionOutcome, ActionPolicyEngine, ActionPreview, ExecuteRequest};
pub use error::PolicyError;
pub use gateway::RemoteGateway;
pub use idempotency::{
    CompletedWindow, IdempotencyClaim, IdempotencyGuard, IdempotencyRecord, IdempotencyState,
    IDEMPOTENCY_RECORD,
};
pub use snapshot::{PolicySnapshot, RECOMMENDED_BATCH_FLOW, RECOMMENDED_WRITE_FLOW};
pub use write_guard::WriteGuard;
