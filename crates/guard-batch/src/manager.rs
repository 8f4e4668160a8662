//! Batch missions: approve once, then run in bounded chunks under a lease.
//!
//! Every batch lives in its own state record. Lease claims, per-target
//! progress and the final status change are separate locked updates, so the
//! lock is never held while a remote call is in flight. A batch found past
//! its expiry is deleted in the same update that refuses it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use guard_actions::{normalize_target, ActionPolicyEngine, PolicyError};
use guard_core::{ceil_ms_to_secs, secs_to_ms, Clock, StateStore};
use guard_limiter::LimiterError;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::record::{
    BatchOperation, BatchRecord, BatchStatus, BatchSummary, OutcomeKind, RunLease,
    TargetAttempts, TargetOutcome, BATCH_SCHEMA_VERSION,
};
use crate::report::{ReportItem, ReportItemResult, RunReport};

const BATCH_ID_BYTES: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateBatchRequest {
    pub actor: String,
    pub targets: Vec<String>,
    /// Defaults to adding `actor` to every target.
    pub operation: Option<BatchOperation>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedTarget {
    pub target: String,
    pub reason_code: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchCreated {
    pub summary: BatchSummary,
    pub blocked_targets: Vec<BlockedTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRunReport {
    pub summary: BatchSummary,
    pub processed_now: usize,
    pub stopped_reason: Option<String>,
    pub items: Vec<ReportItem>,
}

/// How one target's execution affects the batch.
#[derive(Debug)]
enum Step {
    Done(TargetOutcome),
    Retry { reason_code: String, error: String },
    Stop { reason_code: String, error: String },
}

pub struct BatchManager {
    store: StateStore,
    engine: Arc<ActionPolicyEngine>,
    clock: Arc<dyn Clock>,
    config: BatchConfig,
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

pub fn batch_record_name(batch_id: &str) -> String {
    format!("batch-{}", batch_id.trim())
}

impl BatchManager {
    pub fn new(store: StateStore, engine: Arc<ActionPolicyEngine>, config: BatchConfig) -> Self {
        let clock = engine.clock().clone();
        Self {
            store,
            engine,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ActionPolicyEngine> {
        &self.engine
    }

    /// Freezes a deduplicated target list. Targets the allowlist already
    /// rejects are reported and recorded as skipped.
    #[tracing::instrument(name = "guard_batch.create", skip(self, request), fields(actor = %request.actor))]
    pub fn create(&self, request: CreateBatchRequest) -> Result<BatchCreated, BatchError> {
        self.engine.ensure_available()?;
        let actor = request.actor.trim().to_string();
        if actor.is_empty() {
            return Err(BatchError::InvalidRequest("actor is empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        let targets = request
            .targets
            .iter()
            .map(|target| normalize_target(target))
            .filter(|target| !target.is_empty() && seen.insert(target.clone()))
            .collect::<Vec<_>>();
        let Some(first_target) = targets.first() else {
            return Err(BatchError::InvalidRequest("targets list is empty".to_string()));
        };
        let operation = request
            .operation
            .unwrap_or_else(|| BatchOperation::AddMember {
                user: actor.clone(),
            });
        operation
            .action_for(first_target)
            .validate(self.engine.config())?;

        let now = self.clock.now_unix_ms();
        let mut blocked_targets = Vec::new();
        let mut processed = BTreeMap::new();
        for target in &targets {
            if let Err(error) = self.engine.check_target(target) {
                blocked_targets.push(BlockedTarget {
                    target: target.clone(),
                    reason_code: error.reason_code().to_string(),
                    error: error.to_string(),
                });
                processed.insert(
                    target.clone(),
                    TargetOutcome {
                        kind: OutcomeKind::Skipped,
                        reason_code: Some(error.reason_code().to_string()),
                        detail: Some(error.to_string()),
                        recorded_unix_ms: now,
                    },
                );
            }
        }

        let batch_id = new_batch_id();
        let record = BatchRecord {
            schema_version: BATCH_SCHEMA_VERSION,
            batch_id: batch_id.clone(),
            actor,
            operation,
            targets,
            status: BatchStatus::Created,
            note: request.note.trim().to_string(),
            created_unix_ms: now,
            expires_unix_ms: now.saturating_add(secs_to_ms(self.config.ttl_secs)),
            approved_unix_ms: None,
            approval_lease_expires_unix_ms: None,
            run_lease: None,
            processed,
            attempts: BTreeMap::new(),
            paused_reason: None,
            last_error: None,
            last_run_unix_ms: None,
            completed_unix_ms: None,
        };
        self.store
            .update(&batch_record_name(&batch_id), |slot: &mut Option<BatchRecord>| {
                *slot = Some(record.clone());
            })?;
        tracing::info!(
            batch_id = %batch_id,
            total = record.targets.len(),
            blocked = blocked_targets.len(),
            "batch created"
        );
        Ok(BatchCreated {
            summary: record.summary(now),
            blocked_targets,
        })
    }

    /// Builds a batch from the failed items of an earlier run report.
    pub fn create_from_report(
        &self,
        report_path: &Path,
        actor: &str,
        operation: Option<BatchOperation>,
        note: &str,
        error_contains: &str,
    ) -> Result<BatchCreated, BatchError> {
        let report = RunReport::load(report_path)
            .map_err(|error| BatchError::InvalidRequest(format!("{error:#}")))?;
        let targets = report.failed_targets(error_contains);
        if targets.is_empty() {
            return Err(BatchError::InvalidRequest(format!(
                "no failed targets matched error_contains='{error_contains}' in report"
            )));
        }
        let file_name = report_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.create(CreateBatchRequest {
            actor: actor.to_string(),
            targets,
            operation,
            note: format!("from_report:{file_name} {}", note.trim())
                .trim()
                .to_string(),
        })
    }

    /// Grants or refreshes the approval lease.
    #[tracing::instrument(name = "guard_batch.approve", skip(self, confirmation_text))]
    pub fn approve(&self, batch_id: &str, confirmation_text: &str) -> Result<BatchSummary, BatchError> {
        self.engine.check_confirmation_text(confirmation_text)?;
        let now = self.clock.now_unix_ms();
        let lease_ms = secs_to_ms(self.config.approval_lease_secs);
        let summary = self.update_existing(batch_id, |batch| {
            expire_if_due(batch, now)?;
            if batch.status.is_terminal() {
                return Err(BatchError::Finished {
                    batch_id: batch.batch_id.clone(),
                    status: batch.status,
                });
            }
            if batch.status == BatchStatus::Created {
                batch.transition(BatchStatus::Approved)?;
            }
            batch.approved_unix_ms = Some(now);
            batch.approval_lease_expires_unix_ms = Some(now.saturating_add(lease_ms));
            Ok(batch.summary(now))
        })?;
        tracing::info!(
            batch_id,
            approval_lease_expires_unix_ms = summary.approval_lease_expires_unix_ms,
            "batch approved"
        );
        Ok(summary)
    }

    pub fn status(&self, batch_id: &str) -> Result<BatchSummary, BatchError> {
        let record: Option<BatchRecord> = self.store.read_only(&batch_record_name(batch_id));
        let batch = record.ok_or_else(|| not_found(batch_id))?;
        Ok(batch.summary(self.clock.now_unix_ms()))
    }

    /// Processes up to `max_actions` pending targets in order.
    #[tracing::instrument(name = "guard_batch.run", skip(self))]
    pub async fn run(
        &self,
        batch_id: &str,
        worker_id: &str,
        max_actions: Option<usize>,
    ) -> Result<BatchRunReport, BatchError> {
        let max_actions = max_actions.unwrap_or(self.config.default_max_actions);
        if max_actions == 0 {
            return Err(BatchError::InvalidRequest(
                "max_actions must be greater than 0".to_string(),
            ));
        }
        if worker_id.trim().is_empty() {
            return Err(BatchError::InvalidRequest("worker_id is empty".to_string()));
        }
        self.engine.ensure_available()?;

        let batch = self.claim_run_lease(batch_id, worker_id).await?;
        if batch.status == BatchStatus::Completed {
            return Ok(BatchRunReport {
                summary: batch.summary(self.clock.now_unix_ms()),
                processed_now: 0,
                stopped_reason: None,
                items: Vec::new(),
            });
        }

        let pending = batch
            .pending_targets()
            .take(max_actions)
            .map(str::to_string)
            .collect::<Vec<_>>();
        let mut processed_now = 0;
        let mut items = Vec::with_capacity(pending.len());
        let mut stopped: Option<(String, String)> = None;
        for target in pending {
            let result = self
                .engine
                .execute_batch_item(batch.operation.action_for(&target))
                .await;
            let step = self.classify(result);
            items.push(report_item(&target, &step));
            match step {
                Step::Stop { reason_code, error } => {
                    self.record_step(batch_id, worker_id, &target, None, Some(&error), false)
                        .await?;
                    tracing::warn!(batch_id, target = %target, reason_code = %reason_code, "batch run stopped");
                    stopped = Some((reason_code, error));
                    break;
                }
                Step::Retry { error, .. } => {
                    self.record_step(batch_id, worker_id, &target, None, Some(&error), true)
                        .await?;
                    processed_now += 1;
                }
                Step::Done(outcome) => {
                    self.record_step(batch_id, worker_id, &target, Some(outcome), None, true)
                        .await?;
                    processed_now += 1;
                }
            }
        }

        let finished = self
            .finish_run(batch_id, worker_id, stopped.as_ref())
            .await?;
        tracing::info!(
            batch_id,
            processed_now,
            status = finished.status.as_str(),
            "batch run finished"
        );
        Ok(BatchRunReport {
            summary: finished.summary(self.clock.now_unix_ms()),
            processed_now,
            stopped_reason: stopped.map(|(reason_code, _)| reason_code),
            items,
        })
    }

    /// Claims the run lease and moves the batch to `Running`. A completed
    /// batch is returned untouched.
    pub(crate) async fn claim_run_lease(
        &self,
        batch_id: &str,
        worker_id: &str,
    ) -> Result<BatchRecord, BatchError> {
        let now = self.clock.now_unix_ms();
        let lease_ms = secs_to_ms(self.config.run_lease_secs);
        let claimed = self.update_existing_async(batch_id, |batch| {
            expire_if_due(batch, now)?;
            match batch.status {
                BatchStatus::Completed => return Ok(batch.clone()),
                BatchStatus::Created => {
                    return Err(BatchError::NotApproved {
                        batch_id: batch.batch_id.clone(),
                    })
                }
                _ => {}
            }
            if !batch.approval_is_live_at(now) {
                return Err(BatchError::ApprovalLeaseExpired {
                    batch_id: batch.batch_id.clone(),
                });
            }
            if let Some(lease) = batch.run_lease.as_ref() {
                if lease.is_live_at(now) && lease.owner != worker_id {
                    return Err(BatchError::BatchBusy {
                        owner: lease.owner.clone(),
                        retry_after_secs: ceil_ms_to_secs(lease.expires_unix_ms - now),
                    });
                }
            }
            batch.run_lease = Some(RunLease {
                owner: worker_id.to_string(),
                expires_unix_ms: now.saturating_add(lease_ms),
            });
            batch.transition(BatchStatus::Running)?;
            batch.paused_reason = None;
            batch.last_error = None;
            Ok(batch.clone())
        })
        .await?;
        if claimed.status == BatchStatus::Running {
            tracing::info!(batch_id, worker_id, "batch run lease claimed");
        }
        Ok(claimed)
    }

    fn classify(&self, result: Result<guard_actions::ActionOutcome, PolicyError>) -> Step {
        let now = self.clock.now_unix_ms();
        let error = match result {
            Ok(_) => {
                return Step::Done(TargetOutcome {
                    kind: OutcomeKind::Succeeded,
                    reason_code: None,
                    detail: None,
                    recorded_unix_ms: now,
                })
            }
            Err(error) => error,
        };
        let reason_code = error.reason_code().to_string();
        match &error {
            PolicyError::DuplicateAction { .. } => Step::Done(TargetOutcome {
                kind: OutcomeKind::Skipped,
                reason_code: Some(reason_code),
                detail: Some(error.to_string()),
                recorded_unix_ms: now,
            }),
            _ if error.is_permanent_for_target() => Step::Done(TargetOutcome {
                kind: OutcomeKind::Skipped,
                reason_code: Some(reason_code),
                detail: Some(error.to_string()),
                recorded_unix_ms: now,
            }),
            PolicyError::Limiter(LimiterError::Remote(_)) => Step::Retry {
                reason_code,
                error: error.to_string(),
            },
            _ => Step::Stop {
                reason_code,
                error: error.to_string(),
            },
        }
    }

    /// Persists one target's result under the caller's lease and extends it.
    async fn record_step(
        &self,
        batch_id: &str,
        worker_id: &str,
        target: &str,
        outcome: Option<TargetOutcome>,
        error: Option<&str>,
        counts_as_attempt: bool,
    ) -> Result<(), BatchError> {
        let now = self.clock.now_unix_ms();
        let lease_ms = secs_to_ms(self.config.run_lease_secs);
        let max_attempts = self.config.max_attempts_per_target;
        self.update_existing_async(batch_id, |batch| {
            ensure_lease_owner(batch, worker_id)?;
            let history = batch
                .attempts
                .entry(target.to_string())
                .or_insert_with(TargetAttempts::default);
            if counts_as_attempt {
                history.attempts = history.attempts.saturating_add(1);
            }
            history.last_error = error.map(str::to_string);
            history.last_run_unix_ms = Some(now);
            let exhausted = outcome.is_none() && counts_as_attempt && history.attempts >= max_attempts;
            if let Some(outcome) = outcome {
                batch.record_outcome(target, outcome);
            } else if exhausted {
                batch.record_outcome(
                    target,
                    TargetOutcome {
                        kind: OutcomeKind::Failed,
                        reason_code: Some("max_attempts_reached".to_string()),
                        detail: error.map(str::to_string),
                        recorded_unix_ms: now,
                    },
                );
            }
            if let Some(lease) = batch.run_lease.as_mut() {
                lease.expires_unix_ms = now.saturating_add(lease_ms);
            }
            Ok(())
        })
        .await
    }

    async fn finish_run(
        &self,
        batch_id: &str,
        worker_id: &str,
        stopped: Option<&(String, String)>,
    ) -> Result<BatchRecord, BatchError> {
        let now = self.clock.now_unix_ms();
        self.update_existing_async(batch_id, |batch| {
            ensure_lease_owner(batch, worker_id)?;
            batch.run_lease = None;
            batch.last_run_unix_ms = Some(now);
            if let Some((reason_code, error)) = stopped {
                batch.transition(BatchStatus::Paused)?;
                batch.paused_reason = Some(reason_code.clone());
                batch.last_error = Some(error.clone());
            } else if batch.pending_targets().next().is_none() {
                batch.transition(BatchStatus::Completed)?;
                batch.completed_unix_ms = Some(now);
            }
            Ok(batch.clone())
        })
        .await
    }

    /// Locked read-modify-write on an existing batch. Unknown ids are
    /// rejected without creating a record.
    fn update_existing<R>(
        &self,
        batch_id: &str,
        mutate: impl FnOnce(&mut BatchRecord) -> Result<R, BatchError>,
    ) -> Result<R, BatchError> {
        let record_name = self.existing_record_name(batch_id)?;
        self.store
            .update(&record_name, |slot: &mut Option<BatchRecord>| {
                mutate_slot(slot, batch_id, mutate)
            })?
    }

    /// [`Self::update_existing`] for the run path, which must not block the
    /// runtime while another worker holds the record lock.
    async fn update_existing_async<R>(
        &self,
        batch_id: &str,
        mutate: impl FnOnce(&mut BatchRecord) -> Result<R, BatchError>,
    ) -> Result<R, BatchError> {
        let record_name = self.existing_record_name(batch_id)?;
        self.store
            .update_async(&record_name, |slot: &mut Option<BatchRecord>| {
                mutate_slot(slot, batch_id, mutate)
            })
            .await?
    }

    fn existing_record_name(&self, batch_id: &str) -> Result<String, BatchError> {
        let record_name = batch_record_name(batch_id);
        let existing: Option<BatchRecord> = self.store.read_only(&record_name);
        match existing {
            Some(_) => Ok(record_name),
            None => Err(not_found(batch_id)),
        }
    }
}

fn not_found(batch_id: &str) -> BatchError {
    BatchError::NotFound {
        batch_id: batch_id.to_string(),
    }
}

/// Applies `mutate` to the stored batch; an expired batch is dropped from
/// the store once it has been refused.
fn mutate_slot<R>(
    slot: &mut Option<BatchRecord>,
    batch_id: &str,
    mutate: impl FnOnce(&mut BatchRecord) -> Result<R, BatchError>,
) -> Result<R, BatchError> {
    let Some(batch) = slot.as_mut() else {
        return Err(not_found(batch_id));
    };
    let result = mutate(batch);
    if matches!(result, Err(BatchError::Expired { .. })) {
        tracing::info!(batch_id, "expired batch pruned");
        *slot = None;
    }
    result
}

fn expire_if_due(batch: &mut BatchRecord, now_unix_ms: u64) -> Result<(), BatchError> {
    let already_expired = batch.status == BatchStatus::Expired;
    if already_expired || (!batch.status.is_terminal() && batch.is_expired_at(now_unix_ms)) {
        if !already_expired {
            batch.transition(BatchStatus::Expired)?;
        }
        batch.run_lease = None;
        return Err(BatchError::Expired {
            batch_id: batch.batch_id.clone(),
        });
    }
    Ok(())
}

fn ensure_lease_owner(batch: &BatchRecord, worker_id: &str) -> Result<(), BatchError> {
    match batch.run_lease.as_ref() {
        Some(lease) if lease.owner == worker_id => Ok(()),
        _ => Err(BatchError::LeaseLost {
            batch_id: batch.batch_id.clone(),
        }),
    }
}

fn report_item(target: &str, step: &Step) -> ReportItem {
    let result = match step {
        Step::Done(outcome) => ReportItemResult {
            success: outcome.kind == OutcomeKind::Succeeded,
            error: outcome.detail.clone(),
            reason_code: outcome.reason_code.clone(),
        },
        Step::Retry { reason_code, error } | Step::Stop { reason_code, error } => {
            ReportItemResult {
                success: false,
                error: Some(error.clone()),
                reason_code: Some(reason_code.clone()),
            }
        }
    };
    ReportItem {
        target: Value::String(target.to_string()),
        result: Some(result),
    }
}

fn new_batch_id() -> String {
    let mut bytes = [0_u8; BATCH_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("batch_{}", URL_SAFE_NO_PAD.encode(bytes))
}
