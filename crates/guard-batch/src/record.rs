//! Persisted batch mission record and its lifecycle.

use std::collections::BTreeMap;

use guard_actions::{ActionPayload, WriteAction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BATCH_SCHEMA_VERSION: u32 = 1;
pub const PENDING_PREVIEW_LIMIT: usize = 20;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid batch_status transition: {from:?} -> {to:?}")]
    Invalid { from: BatchStatus, to: BatchStatus },
}

/// Lifecycle state for a batch mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Created,
    Approved,
    Running,
    Paused,
    Completed,
    Expired,
}

impl BatchStatus {
    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if next == Self::Expired {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Self::Created, Self::Approved)
                | (Self::Approved, Self::Running)
                | (Self::Approved, Self::Completed)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Completed)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Completed)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StatusTransitionError::Invalid {
            from: self,
            to: next,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

/// The write every target of a batch receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum BatchOperation {
    AddMember { user: String },
    RemoveMember { user: String },
    SendMessage { text: String },
}

impl BatchOperation {
    pub fn action_for(&self, target: &str) -> WriteAction {
        let payload = match self {
            Self::AddMember { user } => ActionPayload::AddMember { user: user.clone() },
            Self::RemoveMember { user } => ActionPayload::RemoveMember { user: user.clone() },
            Self::SendMessage { text } => ActionPayload::SendMessage { text: text.clone() },
        };
        WriteAction::new(target, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Skipped,
    Failed,
}

/// Final result for one target. Once recorded it never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub kind: OutcomeKind,
    #[serde(default)]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
    pub recorded_unix_ms: u64,
}

/// Attempt history, kept for pending and finished targets alike.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAttempts {
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_run_unix_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLease {
    pub owner: String,
    pub expires_unix_ms: u64,
}

impl RunLease {
    pub fn is_live_at(&self, now_unix_ms: u64) -> bool {
        now_unix_ms < self.expires_unix_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    #[serde(default)]
    pub schema_version: u32,
    pub batch_id: String,
    pub actor: String,
    pub operation: BatchOperation,
    /// Ordered and deduplicated at creation; never modified afterwards.
    pub targets: Vec<String>,
    pub status: BatchStatus,
    #[serde(default)]
    pub note: String,
    pub created_unix_ms: u64,
    pub expires_unix_ms: u64,
    #[serde(default)]
    pub approved_unix_ms: Option<u64>,
    #[serde(default)]
    pub approval_lease_expires_unix_ms: Option<u64>,
    #[serde(default)]
    pub run_lease: Option<RunLease>,
    /// Only grows.
    #[serde(default)]
    pub processed: BTreeMap<String, TargetOutcome>,
    #[serde(default)]
    pub attempts: BTreeMap<String, TargetAttempts>,
    #[serde(default)]
    pub paused_reason: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_run_unix_ms: Option<u64>,
    #[serde(default)]
    pub completed_unix_ms: Option<u64>,
}

impl BatchRecord {
    pub fn is_expired_at(&self, now_unix_ms: u64) -> bool {
        now_unix_ms >= self.expires_unix_ms
    }

    pub fn approval_is_live_at(&self, now_unix_ms: u64) -> bool {
        self.approval_lease_expires_unix_ms
            .is_some_and(|expires| now_unix_ms < expires)
    }

    pub fn pending_targets(&self) -> impl Iterator<Item = &str> {
        self.targets
            .iter()
            .filter(|target| !self.processed.contains_key(*target))
            .map(String::as_str)
    }

    pub fn transition(&mut self, next: BatchStatus) -> Result<(), StatusTransitionError> {
        self.status.ensure_transition(next)?;
        if self.status != next {
            tracing::info!(
                batch_id = %self.batch_id,
                from = self.status.as_str(),
                to = next.as_str(),
                "batch status changed"
            );
        }
        self.status = next;
        Ok(())
    }

    /// Records a final outcome unless one exists already.
    pub fn record_outcome(&mut self, target: &str, outcome: TargetOutcome) {
        self.processed.entry(target.to_string()).or_insert(outcome);
    }

    pub fn summary(&self, now_unix_ms: u64) -> BatchSummary {
        let mut succeeded_count = 0;
        let mut skipped_count = 0;
        let mut failed_count = 0;
        for outcome in self.processed.values() {
            match outcome.kind {
                OutcomeKind::Succeeded => succeeded_count += 1,
                OutcomeKind::Skipped => skipped_count += 1,
                OutcomeKind::Failed => failed_count += 1,
            }
        }
        let pending = self.pending_targets().collect::<Vec<_>>();
        let status = if !self.status.is_terminal() && self.is_expired_at(now_unix_ms) {
            BatchStatus::Expired
        } else {
            self.status
        };
        let live_lease = self
            .run_lease
            .as_ref()
            .filter(|lease| lease.is_live_at(now_unix_ms));
        BatchSummary {
            batch_id: self.batch_id.clone(),
            actor: self.actor.clone(),
            operation: self.operation.clone(),
            status,
            note: self.note.clone(),
            total: self.targets.len(),
            pending_count: pending.len(),
            succeeded_count,
            skipped_count,
            failed_count,
            approval_valid: self.approval_is_live_at(now_unix_ms),
            approval_lease_expires_unix_ms: self.approval_lease_expires_unix_ms,
            run_lease_owner: live_lease.map(|lease| lease.owner.clone()),
            run_lease_expires_unix_ms: live_lease.map(|lease| lease.expires_unix_ms),
            created_unix_ms: self.created_unix_ms,
            approved_unix_ms: self.approved_unix_ms,
            expires_unix_ms: self.expires_unix_ms,
            completed_unix_ms: self.completed_unix_ms,
            paused_reason: self.paused_reason.clone(),
            last_error: self.last_error.clone(),
            pending_preview: pending
                .into_iter()
                .take(PENDING_PREVIEW_LIMIT)
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Read-only progress projection of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub actor: String,
    pub operation: BatchOperation,
    pub status: BatchStatus,
    pub note: String,
    pub total: usize,
    pub pending_count: usize,
    pub succeeded_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub approval_valid: bool,
    pub approval_lease_expires_unix_ms: Option<u64>,
    pub run_lease_owner: Option<String>,
    pub run_lease_expires_unix_ms: Option<u64>,
    pub created_unix_ms: u64,
    pub approved_unix_ms: Option<u64>,
    pub expires_unix_ms: u64,
    pub completed_unix_ms: Option<u64>,
    pub paused_reason: Option<String>,
    pub last_error: Option<String>,
    pub pending_preview: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::{BatchOperation, BatchRecord, BatchStatus, OutcomeKind, TargetOutcome};

    fn record(targets: &[&str]) -> BatchRecord {
        BatchRecord {
            schema_version: super::BATCH_SCHEMA_VERSION,
            batch_id: "batch_test".to_string(),
            actor: "dana".to_string(),
            operation: BatchOperation::AddMember {
                user: "dana".to_string(),
            },
            targets: targets.iter().map(|target| target.to_string()).collect(),
            status: BatchStatus::Created,
            note: String::new(),
            created_unix_ms: 1_000,
            expires_unix_ms: 10_000,
            approved_unix_ms: None,
            approval_lease_expires_unix_ms: None,
            run_lease: None,
            processed: Default::default(),
            attempts: Default::default(),
            paused_reason: None,
            last_error: None,
            last_run_unix_ms: None,
            completed_unix_ms: None,
        }
    }

    #[test]
    fn unit_status_machine_is_monotonic_except_pause() {
        assert!(BatchStatus::Created.can_transition_to(BatchStatus::Approved));
        assert!(BatchStatus::Running.can_transition_to(BatchStatus::Paused));
        assert!(BatchStatus::Paused.can_transition_to(BatchStatus::Running));
        assert!(BatchStatus::Paused.can_transition_to(BatchStatus::Expired));
        assert!(!BatchStatus::Created.can_transition_to(BatchStatus::Running));
        assert!(!BatchStatus::Running.can_transition_to(BatchStatus::Approved));
        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Expired));
        assert!(!BatchStatus::Expired.can_transition_to(BatchStatus::Running));
        assert!(BatchStatus::Completed.is_terminal());
        let error = BatchStatus::Completed
            .ensure_transition(BatchStatus::Running)
            .expect_err("terminal");
        assert!(error.to_string().contains("Completed"));
    }

    #[test]
    fn unit_outcomes_are_never_overwritten() {
        let mut batch = record(&["a", "b"]);
        let outcome = |kind| TargetOutcome {
            kind,
            reason_code: None,
            detail: None,
            recorded_unix_ms: 2_000,
        };
        batch.record_outcome("a", outcome(OutcomeKind::Succeeded));
        batch.record_outcome("a", outcome(OutcomeKind::Failed));
        assert_eq!(batch.processed["a"].kind, OutcomeKind::Succeeded);
        assert_eq!(batch.pending_targets().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn unit_summary_projects_expiry_without_mutation() {
        let batch = record(&["a", "b", "c"]);
        let summary = batch.summary(10_000);
        assert_eq!(summary.status, BatchStatus::Expired);
        assert_eq!(batch.status, BatchStatus::Created);
        assert_eq!(summary.pending_count, 3);
        assert_eq!(summary.pending_preview, vec!["a", "b", "c"]);
        assert!(!summary.approval_valid);
    }

    #[test]
    fn unit_operation_builds_normalized_actions() {
        let operation = BatchOperation::AddMember {
            user: "@Dana".to_string(),
        };
        let action = operation.action_for(" @Ops ");
        assert_eq!(action.target, "ops");
        assert_eq!(action.payload.kind(), "add_member");
    }
}
