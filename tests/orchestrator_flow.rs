//! 编排器端到端场景：去重、审批闸门、拒绝、过期、持久化队列与内联执行

use std::sync::Arc;

use chrono::Utc;
use hive::channels::{EgressRouter, InboundMessage, MemoryEgress};
use hive::config::OrchestratorSection;
use hive::connector::{MockConnector, TurnMode};
use hive::executor::RunExecutor;
use hive::orchestrator::{Orchestrator, ResultKind, RunPipeline, MUTED_KEY};
use hive::store::{ApprovalStatus, RunState, Store};

struct Harness {
    store: Store,
    mock: Arc<MockConnector>,
    egress: Arc<MemoryEgress>,
    orchestrator: Orchestrator,
    executor: Option<Arc<RunExecutor>>,
}

fn harness(durable: bool, tweak: impl FnOnce(&mut OrchestratorSection)) -> Harness {
    let store = Store::open_in_memory().unwrap();
    let mock = Arc::new(MockConnector::new());
    let egress = Arc::new(MemoryEgress::new("console"));
    let router = EgressRouter::new("console").register(egress.clone());
    let mut config = OrchestratorSection {
        durable_queue: durable,
        ..OrchestratorSection::default()
    };
    tweak(&mut config);

    let pipeline = Arc::new(RunPipeline::new(store.clone(), mock.clone(), router.clone(), &config));
    let mut orchestrator = Orchestrator::new(store.clone(), mock.clone(), router.clone(), pipeline.clone(), config);
    let executor = durable.then(|| {
        Arc::new(RunExecutor::new(
            store.clone(),
            pipeline,
            router,
            &hive::config::ExecutorSection::default(),
        ))
    });
    if let Some(executor) = &executor {
        orchestrator = orchestrator.with_executor(executor.clone());
    }
    Harness {
        store,
        mock,
        egress,
        orchestrator,
        executor,
    }
}

fn msg(id: &str, sender: &str, text: &str) -> InboundMessage {
    InboundMessage::new(id, sender, text, "console")
}

impl Harness {
    /// 发起一个 task，返回 (run_id, request_id)
    async fn request(&self, id: &str, sender: &str, text: &str) -> (String, String) {
        let result = self.orchestrator.handle_message(&msg(id, sender, text)).await.unwrap();
        assert_eq!(result.kind, ResultKind::AwaitingApproval);
        (result.run_id.unwrap(), result.approval_request_id.unwrap())
    }

    fn run_state(&self, run_id: &str) -> RunState {
        self.store.get_run(run_id).unwrap().unwrap().state
    }
}

#[tokio::test]
async fn test_redelivery_is_a_noop() {
    let h = harness(false, |_| {});
    let m = msg("m1", "+1555", "hello there");
    let first = h.orchestrator.handle_message(&m).await.unwrap();
    assert_eq!(first.kind, ResultKind::Replied);
    let calls = h.mock.calls().len();

    let second = h.orchestrator.handle_message(&m).await.unwrap();
    assert_eq!(second.kind, ResultKind::Duplicate);
    assert!(second.response.is_empty());
    assert_eq!(h.mock.calls().len(), calls);
    assert_eq!(h.egress.sent().len(), 1);
}

#[tokio::test]
async fn test_task_creates_pending_approval() {
    let h = harness(false, |c| {
        c.default_workspace = "/tmp".into();
        c.allowed_workspaces = vec!["/tmp".into()];
    });
    let result = h
        .orchestrator
        .handle_message(&msg("m1", "+1555", "task: clean up /tmp"))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::AwaitingApproval);

    let request_id = result.approval_request_id.clone().unwrap();
    let pattern = regex::Regex::new(r"^req_[0-9a-f]{8}$").unwrap();
    assert!(pattern.is_match(&request_id), "{request_id}");
    assert!(result.response.contains(&format!("approve {request_id}")));
    assert!(result.response.contains(&format!("deny {request_id}")));
    assert!(result.response.contains("1. Inspect the target"));

    let run_id = result.run_id.unwrap();
    assert_eq!(h.run_state(&run_id), RunState::AwaitingApproval);
    let approval = h.store.get_approval(&request_id).unwrap().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Pending);
    assert_eq!(approval.sender, "+1555");
    assert_eq!(h.mock.calls_with_mode(TurnMode::Planner), 1);
    assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 0);
}

#[tokio::test]
async fn test_unknown_request_id() {
    let h = harness(false, |_| {});
    let result = h
        .orchestrator
        .handle_message(&msg("m1", "+1555", "approve req_deadbeef"))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::UnknownRequest);
    assert_eq!(result.response, "Unknown approval request req_deadbeef.");
    assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 0);
}

#[tokio::test]
async fn test_only_requester_can_approve() {
    let h = harness(false, |_| {});
    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;

    let result = h
        .orchestrator
        .handle_message(&msg("m2", "+1666", &format!("approve {request_id}")))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::NotRequester);
    assert_eq!(
        result.response,
        format!("Only the original requester can approve request {request_id}.")
    );
    assert_eq!(
        h.store.get_approval(&request_id).unwrap().unwrap().status,
        ApprovalStatus::Pending
    );
    assert_eq!(h.run_state(&run_id), RunState::AwaitingApproval);
}

#[tokio::test]
async fn test_approval_matches_normalized_sender() {
    let h = harness(false, |_| {});
    let (run_id, request_id) = h.request("m1", "+1 (555) 010-2000", "task: rotate logs").await;
    let result = h
        .orchestrator
        .handle_message(&msg("m2", "tel:+15550102000", &format!("APPROVE {request_id}")))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Completed);
    assert_eq!(h.run_state(&run_id), RunState::Completed);
}

#[tokio::test]
async fn test_deny_never_executes() {
    let h = harness(true, |_| {});
    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;

    let denied = h
        .orchestrator
        .handle_message(&msg("m2", "+1555", &format!("deny {request_id}")))
        .await
        .unwrap();
    assert_eq!(denied.kind, ResultKind::Denied);
    assert_eq!(h.run_state(&run_id), RunState::Denied);

    let again = h
        .orchestrator
        .handle_message(&msg("m3", "+1555", &format!("approve {request_id}")))
        .await
        .unwrap();
    assert_eq!(again.kind, ResultKind::AlreadyResolved);
    assert_eq!(again.response, format!("Request {request_id} is already denied."));

    let executor = h.executor.as_ref().unwrap();
    assert!(!executor.run_once("w1").await.unwrap());
    assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 0);
}

#[tokio::test]
async fn test_late_approval_fails_run() {
    let h = harness(true, |c| c.approval_ttl_secs = 0);
    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;

    let result = h
        .orchestrator
        .handle_message(&msg("m2", "+1555", &format!("approve {request_id}")))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Expired);
    assert_eq!(h.run_state(&run_id), RunState::Failed);
    assert_eq!(
        h.store.get_approval(&request_id).unwrap().unwrap().status,
        ApprovalStatus::Expired
    );
    assert!(!h.executor.as_ref().unwrap().run_once("w1").await.unwrap());
    assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 0);
}

#[tokio::test]
async fn test_durable_approval_queues_then_worker_completes() {
    let h = harness(true, |_| {});
    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;

    let result = h
        .orchestrator
        .handle_message(&msg("m2", "+1555", &format!("approve {request_id}")))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Queued);
    assert_eq!(h.run_state(&run_id), RunState::Queued);
    assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 0);

    assert!(h.executor.as_ref().unwrap().run_once("w1").await.unwrap());
    assert_eq!(h.run_state(&run_id), RunState::Completed);
    assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 1);
    assert_eq!(h.mock.calls_with_mode(TurnMode::Verifier), 1);

    let last = h.egress.last_text().unwrap();
    assert!(last.starts_with(&format!("Run {run_id} completed.")), "{last}");
}

#[tokio::test]
async fn test_inline_approval_executes_immediately() {
    let h = harness(false, |c| c.verifier_enabled = false);
    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;
    let result = h
        .orchestrator
        .handle_message(&msg("m2", "+1555", &format!("approve {request_id}")))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Completed);
    assert_eq!(h.run_state(&run_id), RunState::Completed);
    assert_eq!(h.mock.calls_with_mode(TurnMode::Verifier), 0);
}

#[tokio::test]
async fn test_deny_all_only_touches_own_requests() {
    let h = harness(false, |_| {});
    let (mine_a, _) = h.request("m1", "+1555", "task: one").await;
    let (mine_b, _) = h.request("m2", "+1555", "project: two").await;
    let (theirs, _) = h.request("m3", "+1666", "task: three").await;

    let result = h
        .orchestrator
        .handle_message(&msg("m4", "+1555", "deny all"))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Denied);
    assert!(result.response.contains("Denied 2"));
    assert_eq!(h.run_state(&mine_a), RunState::Denied);
    assert_eq!(h.run_state(&mine_b), RunState::Denied);
    assert_eq!(h.run_state(&theirs), RunState::AwaitingApproval);
}

#[tokio::test]
async fn test_required_prefix() {
    let h = harness(false, |c| c.required_prefix = Some("hive".into()));
    let ignored = h
        .orchestrator
        .handle_message(&msg("m1", "+1555", "hello"))
        .await
        .unwrap();
    assert_eq!(ignored.kind, ResultKind::Ignored);
    assert!(h.egress.sent().is_empty());

    let handled = h
        .orchestrator
        .handle_message(&msg("m2", "+1555", "Hive, status"))
        .await
        .unwrap();
    assert_eq!(handled.kind, ResultKind::Replied);

    let task = h
        .orchestrator
        .handle_message(&msg("m3", "+1555", "hive task: clean up /tmp"))
        .await
        .unwrap();
    assert_eq!(task.kind, ResultKind::AwaitingApproval);
}

#[tokio::test]
async fn test_unknown_workspace_is_rejected_without_state() {
    let h = harness(false, |_| {});
    let result = h
        .orchestrator
        .handle_message(&msg("m1", "+1555", "@nowhere task: wipe it"))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Rejected);
    assert_eq!(result.response, "Unknown workspace @nowhere. Nothing was changed.");
    assert!(h.store.list_runs(None, 10).unwrap().is_empty());
    assert_eq!(h.mock.calls_with_mode(TurnMode::Planner), 0);
}

#[tokio::test]
async fn test_workspace_alias_outside_allow_list() {
    let h = harness(false, |c| {
        c.workspaces.insert("notes".into(), "/srv/notes".into());
        c.allowed_workspaces = vec!["/tmp".into()];
    });
    let result = h
        .orchestrator
        .handle_message(&msg("m1", "+1555", "@notes task: tidy"))
        .await
        .unwrap();
    assert_eq!(result.kind, ResultKind::Rejected);
    assert!(result.response.contains("not in the allow-list"));
    assert!(h.store.list_runs(None, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_expiry_sweep_notifies_requester() {
    let h = harness(false, |c| c.approval_ttl_secs = 0);
    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;

    assert_eq!(h.orchestrator.expire_stale_approvals(Utc::now()).await.unwrap(), 1);
    assert_eq!(h.run_state(&run_id), RunState::Failed);
    assert!(h.egress.last_text().unwrap().contains(&request_id));
    assert_eq!(h.orchestrator.expire_stale_approvals(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_mute_and_unmute_toggle_flag() {
    let h = harness(false, |_| {});
    h.orchestrator.handle_message(&msg("m1", "+1555", "mute")).await.unwrap();
    assert!(h.store.get_flag(MUTED_KEY).unwrap());
    h.orchestrator.handle_message(&msg("m2", "+1555", "unmute")).await.unwrap();
    assert!(!h.store.get_flag(MUTED_KEY).unwrap());
}

impl Harness {
    async fn say(&self, id: &str, sender: &str, text: &str) -> String {
        self.orchestrator.handle_message(&msg(id, sender, text)).await.unwrap().response
    }

    fn last_chat_prompt(&self) -> String {
        self.mock
            .calls()
            .into_iter()
            .filter(|c| c.mode == TurnMode::Chat)
            .last()
            .map(|c| c.prompt)
            .unwrap()
    }
}

#[tokio::test]
async fn test_team_load_current_unload() {
    let h = harness(false, |c| {
        c.teams
            .insert("research".into(), "You are a careful research assistant.".into());
    });
    assert_eq!(h.say("m1", "+1555", "team current").await, "No team loaded.");
    assert!(h.say("m2", "+1555", "team load nobody").await.contains("Unknown team 'nobody'"));
    assert_eq!(h.say("m3", "+1555", "team load Research").await, "Team 'research' loaded.");
    assert_eq!(h.say("m4", "+1555", "team current").await, "Active team: research");
    assert_eq!(h.say("m5", "+1555", "team list").await, "Teams: research");

    // 前言进入聊天提示词
    h.say("m6", "+1555", "what changed in the report?").await;
    let prompt = h.last_chat_prompt();
    assert!(prompt.contains("You are a careful research assistant."));
    assert!(prompt.contains("what changed in the report?"));

    // 团队按发件人隔离
    assert_eq!(h.say("m7", "+1666", "team current").await, "No team loaded.");

    assert_eq!(h.say("m8", "+1555", "team unload").await, "Team unloaded.");
    assert_eq!(h.say("m9", "+1555", "team unload").await, "No team was loaded.");
    h.say("m10", "+1555", "and now?").await;
    assert!(!h.last_chat_prompt().contains("research assistant"));
}

#[tokio::test]
async fn test_history_treats_wildcards_literally() {
    let h = harness(false, |_| {});
    h.say("m1", "+1555", "budget is 100% done").await;
    h.say("m2", "+1555", "budget is 1000 done").await;
    h.say("m3", "tel:+1555", "renamed file_name.txt").await;
    h.say("m4", "+1555", "renamed filename.txt").await;
    h.say("m5", "+1666", "I am 100% sure").await;

    let percent = h.say("m6", "+1555", "history: 100%").await;
    assert!(percent.starts_with("Found 1 message(s):"), "{percent}");
    assert!(percent.contains("budget is 100% done"));
    assert!(!percent.contains("1000"));
    assert!(!percent.contains("sure"));

    // 带 tel: 前缀发出的消息也属于同一发件人
    let underscore = h.say("m7", "+1555", "history: file_name").await;
    assert!(underscore.starts_with("Found 1 message(s):"), "{underscore}");
    assert!(underscore.contains("file_name.txt"));
    assert!(!underscore.contains("filename.txt"));

    assert_eq!(
        h.say("m8", "+1555", "history: zebra").await,
        "No messages matching 'zebra'."
    );
}

#[tokio::test]
async fn test_status_health_usage_and_logs() {
    let h = harness(false, |_| {});
    assert_eq!(h.say("m0", "+1999", "logs").await, "No events recorded yet.");

    let (run_id, request_id) = h.request("m1", "+1555", "task: clean up /tmp").await;

    let status = h.say("m2", "+1555", "status").await;
    assert!(status.starts_with("Pending approvals:"), "{status}");
    assert!(status.contains(&request_id));
    assert!(status.contains("Recent runs:"));
    assert!(status.contains(&format!("{run_id} [awaiting_approval] clean up /tmp")));
    // 其他发件人看不到
    let other = h.say("m3", "+1666", "status").await;
    assert_eq!(other, "No pending approvals.\nNo runs yet.");

    let health = h.say("m4", "+1555", "health").await;
    assert!(health.contains("Connector: ready"), "{health}");
    assert!(health.contains("Runs: awaiting_approval=1"));
    assert!(health.contains("Jobs: none"));
    assert!(health.contains("Approvals: pending=1"));
    h.mock.set_healthy(false);
    assert!(h
        .say("m5", "+1555", "health")
        .await
        .contains("Connector: unavailable (mock backend marked unhealthy)"));

    // tel: 前缀与裸号码计入同一发件人
    let usage = h.say("m6", "tel:+1555", "usage").await;
    assert_eq!(
        usage,
        "Last 24h: 5 message(s), 1 run(s). Messages this session: 5."
    );

    let logs = h.say("m7", "+1555", "logs 2").await;
    assert!(logs.starts_with("Last 2 event(s):"), "{logs}");
    assert_eq!(logs.lines().count(), 3);
    assert!(logs.contains(&run_id));
    assert!(logs.contains("intake/received"));
}
