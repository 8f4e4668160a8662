use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use guard_actions::{ActionPayload, ExecuteRequest, RemoteGateway, WriteAction};
use guard_batch::{BatchOperation, BatchStatus, CreateBatchRequest};
use guard_core::ManualClock;
use guard_limiter::{GatewayError, LimiterError, QuotaCounter, QuotaRequest};
use guard_runtime::{GuardConfig, OutboundGuard, Rejection};
use serde_json::{json, Value};
use tokio::sync::Notify;

const START_MS: u64 = 1_709_290_800_000; // 2024-03-01T11:00:00Z

#[derive(Default)]
struct RecordingGateway {
    calls: Mutex<Vec<String>>,
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl RecordingGateway {
    /// Parks every call until `release` fires, signalling `started` first.
    fn holding(started: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            hold: Some((started, release)),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl RemoteGateway for RecordingGateway {
    async fn perform(&self, action: &WriteAction, _write_context: &str) -> Result<Value, GatewayError> {
        self.calls.lock().expect("calls").push(action.target.clone());
        if let Some((started, release)) = &self.hold {
            started.notify_one();
            release.notified().await;
        }
        Ok(json!({ "ok": true, "target": action.target }))
    }
}

fn shared_config(state_dir: &Path) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.state_dir = Some(state_dir.to_path_buf());
    config.lock_timeout_ms = 2_000;
    config.actions.actions_enabled = true;
    config.actions.allowed_targets = ["@Ops", "g1", "g2", "g3", "g4", "g5"]
        .iter()
        .map(|target| target.to_string())
        .collect();
    config.actions.min_approval_age_secs = 30;
    config
}

fn open(
    config: &GuardConfig,
    gateway: Arc<RecordingGateway>,
    clock: &Arc<ManualClock>,
) -> OutboundGuard {
    OutboundGuard::with_clock(config.clone(), gateway, clock.clone()).expect("guard")
}

fn message(target: &str, text: &str) -> WriteAction {
    WriteAction::new(
        target,
        ActionPayload::SendMessage {
            text: text.to_string(),
        },
    )
}

#[tokio::test]
async fn integration_approval_issued_by_one_handle_is_redeemed_by_another() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = shared_config(temp.path());
    let clock = Arc::new(ManualClock::new(START_MS));
    let gateway = Arc::new(RecordingGateway::default());
    let previewer = open(&config, gateway.clone(), &clock);
    let executor = open(&config, gateway.clone(), &clock);

    let preview = previewer
        .preview(message("@Ops", "deploy starts at 14:00"))
        .expect("preview");
    let code = preview.approval.expect("approval").approval_code;

    let request = ExecuteRequest {
        action: message("ops", "deploy starts at 14:00"),
        confirm: true,
        confirmation_text: "send now".to_string(),
        approval_code: Some(code.clone()),
        force_resend: false,
    };
    let early = executor
        .execute(request.clone())
        .await
        .expect_err("approval still maturing");
    let rejection = Rejection::from(&early);
    assert_eq!(rejection.reason_code, "approval_too_fresh");
    assert_eq!(rejection.retry_after_secs, Some(30));

    clock.advance(Duration::from_secs(31));
    let outcome = executor.execute(request.clone()).await.expect("execute");
    assert_eq!(outcome.action.target, "ops");
    assert_eq!(gateway.calls(), vec!["ops"]);

    let replay = previewer
        .execute(ExecuteRequest {
            force_resend: true,
            ..request
        })
        .await
        .expect_err("single use");
    assert_eq!(replay.reason_code(), "approval_consumed");

    let again = previewer
        .preview(message("ops", "deploy starts at 14:00"))
        .expect("preview again");
    assert!(again.duplicate_retry_after_secs.is_some());
}

#[tokio::test]
async fn integration_quota_is_shared_across_handles_and_resets_at_utc_midnight() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = shared_config(temp.path());
    config.limiter.quotas.group_messages = 3;
    let clock = Arc::new(ManualClock::new(START_MS));
    let left = open(&config, Arc::new(RecordingGateway::default()), &clock);
    let right = open(&config, Arc::new(RecordingGateway::default()), &clock);
    let request = QuotaRequest::new(QuotaCounter::GroupMessages);

    let mut granted = 0;
    let mut rejected = 0;
    for index in 0..6 {
        let handle = if index % 2 == 0 { &left } else { &right };
        match handle
            .call(Some(request.clone()), || async { Ok::<_, GatewayError>(()) })
            .await
        {
            Ok(()) => granted += 1,
            Err(LimiterError::QuotaExceeded { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((granted, rejected), (3, 3));
    assert_eq!(right.limiter_stats().usage["group_messages"].used, 3);

    // 11:00 UTC plus 13h lands on the next UTC day.
    clock.advance(Duration::from_secs(13 * 3_600));
    left.call(Some(request), || async { Ok::<_, GatewayError>(()) })
        .await
        .expect("new day");
    assert_eq!(right.limiter_stats().usage["group_messages"].used, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_handles_never_exceed_a_shared_quota() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = shared_config(temp.path());
    config.limiter.quotas.direct_messages = 5;
    config.limiter.burst_capacity = 50.0;
    let clock = Arc::new(ManualClock::new(START_MS));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let guard = Arc::new(open(&config, Arc::new(RecordingGateway::default()), &clock));
        for _ in 0..4 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move {
                guard
                    .call(
                        Some(QuotaRequest::new(QuotaCounter::DirectMessages)),
                        || async { Ok::<_, GatewayError>(()) },
                    )
                    .await
                    .is_ok()
            }));
        }
    }
    let mut granted = 0;
    for task in tasks {
        if task.await.expect("join") {
            granted += 1;
        }
    }
    assert_eq!(granted, 5);
}

#[tokio::test]
async fn integration_batch_runs_across_handles_under_one_lease() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = shared_config(temp.path());
    let clock = Arc::new(ManualClock::new(START_MS));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let slow_gateway = Arc::new(RecordingGateway::holding(started.clone(), release.clone()));
    let plain_gateway = Arc::new(RecordingGateway::default());
    let first = open(&config, slow_gateway.clone(), &clock);
    let second = open(&config, plain_gateway.clone(), &clock);

    let created = first
        .create_batch(CreateBatchRequest {
            actor: "ops-bot".to_string(),
            targets: vec!["g1".into(), "@G2".into(), "g3".into(), "g4".into(), "g5".into()],
            operation: Some(BatchOperation::SendMessage {
                text: "maintenance window tonight".to_string(),
            }),
            note: "weekly notice".to_string(),
        })
        .expect("create");
    assert!(created.blocked_targets.is_empty());
    let batch_id = created.summary.batch_id;

    let not_yet = second
        .run_batch(&batch_id, Some("worker-b"), Some(2))
        .await
        .expect_err("needs approval");
    assert_eq!(Rejection::from(&not_yet).reason_code, "batch_not_approved");
    second.approve_batch(&batch_id, "SEND NOW").expect("approve");

    let holder = first.run_batch(&batch_id, Some("worker-a"), Some(2));
    let contender = async {
        started.notified().await;
        let busy = second.run_batch(&batch_id, Some("worker-b"), Some(2)).await;
        release.notify_one();
        // Second target of worker-a's chunk.
        started.notified().await;
        release.notify_one();
        busy
    };
    let (held, busy) = tokio::join!(holder, contender);
    let held = held.expect("worker-a run");
    assert_eq!(held.processed_now, 2);
    assert_eq!(held.summary.status, BatchStatus::Running);
    let busy = busy.expect_err("lease held by worker-a");
    let rejection = Rejection::from(&busy);
    assert_eq!(rejection.reason_code, "batch_busy");
    assert!(rejection.error.contains("worker-a"));

    let rest = second
        .run_batch(&batch_id, Some("worker-b"), None)
        .await
        .expect("worker-b finishes");
    assert_eq!(rest.processed_now, 3);
    assert_eq!(rest.summary.status, BatchStatus::Completed);
    assert_eq!(slow_gateway.calls(), vec!["g1", "g2"]);
    assert_eq!(plain_gateway.calls(), vec!["g3", "g4", "g5"]);

    let status = first.batch_status(&batch_id).expect("status");
    assert_eq!(status.succeeded_count, 5);
    assert_eq!(status.run_lease_owner, None);
}
