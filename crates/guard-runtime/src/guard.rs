//! Process-level facade wiring the store, limiter, policy engine and batch
//! manager from one [`GuardConfig`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use guard_actions::{
    ActionOutcome, ActionPayload, ActionPolicyEngine, ActionPreview, ExecuteRequest,
    PolicyError, PolicySnapshot, RemoteGateway, WriteAction,
};
use guard_batch::{
    BatchCreated, BatchError, BatchManager, BatchOperation, BatchRunReport, BatchSummary,
    CreateBatchRequest,
};
use guard_core::{Clock, StateStore, SystemClock};
use guard_limiter::{
    CallExecutor, GatewayError, LimiterError, LimiterStats, QuotaRequest, RateLimiter,
};

use crate::config::GuardConfig;

/// Worker id used for batch runs when the caller does not name one.
pub fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

/// One handle per process. Handles opened on the same `state_dir` share
/// budgets, quotas, approvals and batches.
#[derive(Debug)]
pub struct OutboundGuard {
    config: GuardConfig,
    store: StateStore,
    executor: CallExecutor,
    engine: Arc<ActionPolicyEngine>,
    batches: BatchManager,
}

impl OutboundGuard {
    pub fn new(config: GuardConfig, gateway: Arc<dyn RemoteGateway>) -> Result<Self> {
        Self::with_clock(config, gateway, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GuardConfig,
        gateway: Arc<dyn RemoteGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let store = match &config.state_dir {
            Some(dir) => StateStore::open_dir(dir)
                .with_context(|| format!("failed to open state dir {}", dir.display()))?
                .with_lock_timeout(Duration::from_millis(config.lock_timeout_ms)),
            None => StateStore::in_memory(),
        };
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            clock,
            config.limiter.clone(),
        ));
        let executor = CallExecutor::new(limiter);
        let engine = Arc::new(ActionPolicyEngine::new(
            config.actions.clone(),
            store.clone(),
            executor.clone(),
            gateway,
        ));
        let batches = BatchManager::new(store.clone(), engine.clone(), config.batch.clone());
        tracing::info!(
            shared = store.is_shared(),
            state_dir = ?config.state_dir,
            actions_enabled = config.actions.actions_enabled,
            "outbound guard ready"
        );
        Ok(Self {
            config,
            store,
            executor,
            engine,
            batches,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ActionPolicyEngine> {
        &self.engine
    }

    pub fn batches(&self) -> &BatchManager {
        &self.batches
    }

    /// Runs an arbitrary remote call (reads included) through the limiter.
    pub async fn call<T, F, Fut>(
        &self,
        quota: Option<QuotaRequest>,
        call: F,
    ) -> Result<T, LimiterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        self.executor.execute(quota.as_ref(), call).await
    }

    pub fn limiter_stats(&self) -> LimiterStats {
        self.executor.limiter().stats()
    }

    pub fn preview(&self, action: WriteAction) -> Result<ActionPreview, PolicyError> {
        self.engine.preview(action)
    }

    /// Previews sending the file at `path`, hashing its current metadata.
    pub fn preview_file(
        &self,
        target: &str,
        path: &Path,
        caption: &str,
    ) -> Result<ActionPreview, PolicyError> {
        let payload = ActionPayload::send_file(path, caption)
            .map_err(|error| PolicyError::InvalidPayload(format!("{error:#}")))?;
        self.engine.preview(WriteAction::new(target, payload))
    }

    pub async fn execute(&self, request: ExecuteRequest) -> Result<ActionOutcome, PolicyError> {
        self.engine.execute(request).await
    }

    pub fn policy_snapshot(&self) -> PolicySnapshot {
        self.engine.policy_snapshot()
    }

    pub fn create_batch(&self, request: CreateBatchRequest) -> Result<BatchCreated, BatchError> {
        self.batches.create(request)
    }

    pub fn create_batch_from_report(
        &self,
        report_path: &Path,
        actor: &str,
        operation: Option<BatchOperation>,
        note: &str,
        error_contains: &str,
    ) -> Result<BatchCreated, BatchError> {
        self.batches
            .create_from_report(report_path, actor, operation, note, error_contains)
    }

    pub fn approve_batch(
        &self,
        batch_id: &str,
        confirmation_text: &str,
    ) -> Result<BatchSummary, BatchError> {
        self.batches.approve(batch_id, confirmation_text)
    }

    /// Runs a chunk of the batch; `worker_id` defaults to [`default_worker_id`].
    pub async fn run_batch(
        &self,
        batch_id: &str,
        worker_id: Option<&str>,
        max_actions: Option<usize>,
    ) -> Result<BatchRunReport, BatchError> {
        let worker_id = worker_id
            .map(str::to_string)
            .unwrap_or_else(default_worker_id);
        self.batches.run(batch_id, &worker_id, max_actions).await
    }

    pub fn batch_status(&self, batch_id: &str) -> Result<BatchSummary, BatchError> {
        self.batches.status(batch_id)
    }
}
