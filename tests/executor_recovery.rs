//! 进程崩溃后的恢复：租约过期的任务在重启后被重新认领并执行完成

use std::sync::Arc;

use chrono::{Duration, Utc};
use hive::channels::{EgressRouter, InboundMessage, MemoryEgress};
use hive::config::{ExecutorSection, OrchestratorSection};
use hive::connector::{MockConnector, TurnMode};
use hive::executor::RunExecutor;
use hive::orchestrator::{Orchestrator, ResultKind, RunPipeline};
use hive::store::{JobStatus, RunState, Store};

fn wire(store: &Store, mock: Arc<MockConnector>, egress: Arc<MemoryEgress>) -> (Orchestrator, Arc<RunExecutor>) {
    let router = EgressRouter::new("console").register(egress);
    let config = OrchestratorSection::default();
    let pipeline = Arc::new(RunPipeline::new(store.clone(), mock.clone(), router.clone(), &config));
    let executor = Arc::new(RunExecutor::new(
        store.clone(),
        pipeline.clone(),
        router.clone(),
        &ExecutorSection::default(),
    ));
    let orchestrator =
        Orchestrator::new(store.clone(), mock, router, pipeline, config).with_executor(executor.clone());
    (orchestrator, executor)
}

#[tokio::test]
async fn test_job_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("hive.db");

    // 第一次启动：规划、批准、被某个 worker 认领后进程崩溃
    let store = Store::open(&db).unwrap();
    let egress = Arc::new(MemoryEgress::new("console"));
    let (orchestrator, executor) = wire(&store, Arc::new(MockConnector::new()), egress.clone());
    let planned = orchestrator
        .handle_message(&InboundMessage::new("m1", "+1555", "task: clean up /tmp", "console"))
        .await
        .unwrap();
    let run_id = planned.run_id.unwrap();
    let request_id = planned.approval_request_id.unwrap();
    let approved = orchestrator
        .handle_message(&InboundMessage::new(
            "m2",
            "+1555",
            &format!("approve {request_id}"),
            "console",
        ))
        .await
        .unwrap();
    assert_eq!(approved.kind, ResultKind::Queued);

    let claimed = executor.claim_next("crashed-worker", 1).await.unwrap().unwrap();
    assert_eq!(claimed.attempt, 1);
    drop(orchestrator);
    drop(executor);
    store.close().unwrap();

    // 重启：同一个库文件，新的连接器
    let store = Store::open(&db).unwrap();
    let mock = Arc::new(MockConnector::new());
    let (_orchestrator, executor) = wire(&store, mock.clone(), egress.clone());

    // 租约未过期前不会被其他 worker 认领
    assert!(!executor.run_once("w1").await.unwrap());
    assert_eq!(executor.recover_expired_at(Utc::now() + Duration::seconds(5)).await.unwrap(), 1);
    assert!(executor.run_once("w1").await.unwrap());

    assert_eq!(store.get_run(&run_id).unwrap().unwrap().state, RunState::Completed);
    let jobs = store.list_jobs_for_run(&run_id).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);
    assert_eq!(jobs[0].attempt, 2);
    assert_eq!(mock.calls_with_mode(TurnMode::Executor), 1);
    assert!(egress.last_text().unwrap().contains("completed"));
}

#[tokio::test]
async fn test_completed_job_is_not_recovered() {
    let store = Store::open_in_memory().unwrap();
    let egress = Arc::new(MemoryEgress::new("console"));
    let mock = Arc::new(MockConnector::new());
    let (orchestrator, executor) = wire(&store, mock.clone(), egress);

    let planned = orchestrator
        .handle_message(&InboundMessage::new("m1", "+1555", "task: archive notes", "console"))
        .await
        .unwrap();
    let request_id = planned.approval_request_id.unwrap();
    orchestrator
        .handle_message(&InboundMessage::new(
            "m2",
            "+1555",
            &format!("approve {request_id}"),
            "console",
        ))
        .await
        .unwrap();
    assert!(executor.run_once("w1").await.unwrap());

    assert_eq!(executor.recover_expired_at(Utc::now() + Duration::hours(1)).await.unwrap(), 0);
    assert!(!executor.run_once("w2").await.unwrap());
    assert_eq!(mock.calls_with_mode(TurnMode::Executor), 1);
}
