//! 持久化执行队列：把已批准的 Run 交给 N 个 worker 执行，进程崩溃后可恢复
//!
//! 每个 worker：限频回收过期租约 -> 认领 -> 无任务则休眠 -> 有任务则执行，
//! 执行期间由心跳任务每 lease/3 续约一次。任何失败（包括 panic）只结束当前任务，不会停掉循环；
//! 只有取消信号能让 worker 退出，且会先把手上的任务做完。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::EgressRouter;
use crate::config::ExecutorSection;
use crate::core::{SideEffectError, StoreError};
use crate::orchestrator::{ExecutionReport, RunPipeline};
use crate::store::{JobStatus, Run, RunJob, RunState, Store};

/// 任务阶段名
pub const PHASE_EXECUTE: &str = "execute";

pub struct RunExecutor {
    store: Store,
    pipeline: Arc<RunPipeline>,
    router: EgressRouter,
    lease_secs: u64,
    poll_interval: Duration,
    recover_interval: Duration,
    last_recover: Mutex<Option<Instant>>,
}

impl RunExecutor {
    pub fn new(
        store: Store,
        pipeline: Arc<RunPipeline>,
        router: EgressRouter,
        config: &ExecutorSection,
    ) -> Self {
        Self {
            store,
            pipeline,
            router,
            lease_secs: config.lease_secs.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            recover_interval: Duration::from_secs(config.recover_interval_secs),
            last_recover: Mutex::new(None),
        }
    }

    /// 入队：Run 必须仍在 awaiting_approval；否则返回 None
    pub async fn enqueue(&self, run: &Run) -> Result<Option<RunJob>, StoreError> {
        let job = RunJob::new(run, PHASE_EXECUTE, json!({ "intent": run.intent }));
        self.store
            .call(move |s| {
                if !s.enqueue_for_run(&job)? {
                    return Ok(None);
                }
                s.create_event(
                    Some(&job.run_id),
                    "queue",
                    "enqueued",
                    json!({ "job_id": job.job_id }),
                )?;
                Ok(Some(job))
            })
            .await
    }

    pub async fn claim_next(&self, worker_id: &str, lease_secs: u64) -> Result<Option<RunJob>, StoreError> {
        let worker_id = worker_id.to_string();
        let lease = chrono::Duration::seconds(lease_secs as i64);
        self.store
            .call(move |s| s.claim_next_job(&worker_id, lease, Utc::now()))
            .await
    }

    pub async fn renew_lease(&self, job_id: &str, worker_id: &str, lease_secs: u64) -> Result<bool, StoreError> {
        let (job_id, worker_id) = (job_id.to_string(), worker_id.to_string());
        let lease = chrono::Duration::seconds(lease_secs as i64);
        self.store
            .call(move |s| s.renew_lease(&job_id, &worker_id, lease, Utc::now()))
            .await
    }

    pub async fn complete(&self, job_id: &str, status: JobStatus, error: Option<&str>) -> Result<bool, StoreError> {
        let job_id = job_id.to_string();
        let error = error.map(str::to_string);
        self.store
            .call(move |s| s.complete_job(&job_id, status, error.as_deref()))
            .await
    }

    /// 回收租约已过期的任务
    pub async fn recover_expired(&self) -> Result<usize, StoreError> {
        self.recover_expired_at(Utc::now()).await
    }

    pub async fn recover_expired_at(&self, now: chrono::DateTime<Utc>) -> Result<usize, StoreError> {
        let recovered = self.store.call(move |s| s.recover_expired_jobs(now)).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "re-queued jobs with expired leases");
        }
        Ok(recovered)
    }

    /// 限频回收：距上次不足 recover_interval 时跳过
    async fn maybe_recover(&self) {
        {
            let Ok(mut last) = self.last_recover.lock() else {
                return;
            };
            if last.is_some_and(|t| t.elapsed() < self.recover_interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        if let Err(e) = self.recover_expired().await {
            tracing::warn!("lease recovery scan failed: {}", e);
        }
    }

    /// 启动 n 个 worker
    pub fn spawn_workers(self: &Arc<Self>, n: usize, token: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..n.max(1))
            .map(|i| {
                let executor = Arc::clone(self);
                let worker_id = format!("worker-{}-{}", std::process::id(), i);
                let token = token.clone();
                tokio::spawn(async move { executor.worker_loop(worker_id, token).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, token: CancellationToken) {
        tracing::info!(worker = %worker_id, "executor worker started");
        while !token.is_cancelled() {
            self.maybe_recover().await;
            match self.run_once(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::warn!(worker = %worker_id, "claim failed: {}", e),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::info!(worker = %worker_id, "executor worker stopped");
    }

    /// 认领并完整处理一个任务；队列为空时返回 false
    pub async fn run_once(self: &Arc<Self>, worker_id: &str) -> Result<bool, StoreError> {
        let Some(job) = self.claim_next(worker_id, self.lease_secs).await? else {
            return Ok(false);
        };
        tracing::info!(
            worker = %worker_id,
            job_id = %job.job_id,
            run_id = %job.run_id,
            attempt = job.attempt,
            "job claimed"
        );
        self.process(job, worker_id).await;
        Ok(true)
    }

    async fn process(self: &Arc<Self>, job: RunJob, worker_id: &str) {
        let keepalive_token = CancellationToken::new();
        let keepalive = self.spawn_keepalive(&job.job_id, worker_id, keepalive_token.clone());

        let run_id = job.run_id.clone();
        let outcome = match self.store.call(move |s| s.get_run(&run_id)).await {
            Ok(Some(run)) => {
                let pipeline = Arc::clone(&self.pipeline);
                let run_for_task = run.clone();
                // 独立任务中执行，panic 只表现为 JoinError
                let handle = tokio::spawn(async move { pipeline.execute(&run_for_task).await });
                let result = match handle.await {
                    Ok(Ok(report)) => Ok(report),
                    Ok(Err(e)) => Err(format!("store error during execution: {e}")),
                    Err(e) if e.is_panic() => Err("execution panicked".to_string()),
                    Err(e) => Err(format!("execution aborted: {e}")),
                };
                Some((run, result))
            }
            Ok(None) => {
                tracing::warn!(job_id = %job.job_id, run_id = %job.run_id, "job references a missing run");
                None
            }
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, "could not load run: {}", e);
                None
            }
        };

        keepalive_token.cancel();
        let _ = keepalive.await;

        let Some((run, result)) = outcome else {
            self.finish(&job, JobStatus::Failed, Some("run could not be loaded")).await;
            return;
        };

        let report = match result {
            Ok(report) => {
                let (status, error) = if report.state == RunState::Completed {
                    (JobStatus::Completed, None)
                } else {
                    (JobStatus::Failed, Some(report.text.as_str()))
                };
                self.finish(&job, status, error).await;
                report
            }
            Err(error) => {
                self.finish(&job, JobStatus::Failed, Some(&error)).await;
                match self.pipeline.fail(&run.run_id, &error).await {
                    Ok(report) => report,
                    Err(e) => {
                        tracing::warn!(run_id = %run.run_id, "could not mark run failed: {}", e);
                        ExecutionReport {
                            run_id: run.run_id.clone(),
                            state: RunState::Failed,
                            text: format!("Run {} failed: {}", run.run_id, error),
                        }
                    }
                }
            }
        };

        if let Err(e) = self.notify(&run, &report.text).await {
            tracing::warn!(run_id = %run.run_id, "result notification failed: {}", e);
        }
    }

    async fn finish(&self, job: &RunJob, status: JobStatus, error: Option<&str>) {
        match self.complete(&job.job_id, status, error).await {
            Ok(true) => tracing::info!(job_id = %job.job_id, status = status.as_str(), "job finished"),
            Ok(false) => tracing::warn!(job_id = %job.job_id, "job was no longer running when finished"),
            Err(e) => tracing::warn!(job_id = %job.job_id, "could not finalize job: {}", e),
        }
    }

    /// 心跳续约；续约失败（租约已被回收）时停止
    fn spawn_keepalive(&self, job_id: &str, worker_id: &str, token: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let job_id = job_id.to_string();
        let worker_id = worker_id.to_string();
        let lease = chrono::Duration::seconds(self.lease_secs as i64);
        let every = Duration::from_millis((self.lease_secs * 1000 / 3).max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let (id, owner) = (job_id.clone(), worker_id.clone());
                        let renewed = store
                            .call(move |s| s.renew_lease(&id, &owner, lease, Utc::now()))
                            .await;
                        match renewed {
                            Ok(true) => tracing::debug!(job_id = %job_id, "lease renewed"),
                            Ok(false) => {
                                tracing::warn!(job_id = %job_id, worker = %worker_id, "lease lost");
                                break;
                            }
                            Err(e) => tracing::warn!(job_id = %job_id, "lease renewal failed: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// 把结果回复到 Run 的来源渠道
    async fn notify(&self, run: &Run, text: &str) -> Result<(), SideEffectError> {
        let channel = run
            .source_context
            .get("channel")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        self.router.reply(channel, &run.sender, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{InboundMessage, MemoryEgress};
    use crate::config::OrchestratorSection;
    use crate::connector::{MockConnector, TurnMode};
    use crate::store::RiskLevel;

    struct Harness {
        store: Store,
        mock: Arc<MockConnector>,
        egress: Arc<MemoryEgress>,
        executor: Arc<RunExecutor>,
    }

    fn harness(mock: MockConnector, lease_secs: u64) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let mock = Arc::new(mock);
        let egress = Arc::new(MemoryEgress::new("console"));
        let router = EgressRouter::new("console").register(egress.clone());
        let config = OrchestratorSection {
            followup_delay_secs: 0,
            ..OrchestratorSection::default()
        };
        let pipeline = Arc::new(RunPipeline::new(store.clone(), mock.clone(), router.clone(), &config));
        let executor = Arc::new(RunExecutor::new(
            store.clone(),
            pipeline,
            router,
            &ExecutorSection {
                lease_secs,
                poll_interval_ms: 20,
                ..ExecutorSection::default()
            },
        ));
        Harness {
            store,
            mock,
            egress,
            executor,
        }
    }

    fn awaiting_run(store: &Store) -> Run {
        let msg = InboundMessage::new("m1", "+1555", "task: tidy", "console");
        let run = Run::new("+1555", "tidy", "workspace", RiskLevel::Medium, msg.source_context());
        store.create_run(&run).unwrap();
        store.update_run_state(&run.run_id, RunState::Planning).unwrap();
        store.update_run_state(&run.run_id, RunState::AwaitingApproval).unwrap();
        run
    }

    #[tokio::test]
    async fn test_enqueue_then_execute() {
        let h = harness(MockConnector::new(), 30);
        let run = awaiting_run(&h.store);

        let job = h.executor.enqueue(&run).await.unwrap().unwrap();
        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Queued);
        // 同一个 Run 不能入队两次
        assert!(h.executor.enqueue(&run).await.unwrap().is_none());

        assert!(h.executor.run_once("w1").await.unwrap());
        assert!(!h.executor.run_once("w1").await.unwrap());

        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Completed);
        let stored = h.store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.lease_owner.is_none());
        let reply = h.egress.last_text().unwrap();
        assert!(reply.contains("completed"));
    }

    #[tokio::test]
    async fn test_recovered_job_is_re_executed() {
        let h = harness(MockConnector::new(), 30);
        let run = awaiting_run(&h.store);
        let job = h.executor.enqueue(&run).await.unwrap().unwrap();

        // 模拟 worker 认领后崩溃：租约留在 running、Run 停在 executing
        h.executor.claim_next("dead-worker", 30).await.unwrap().unwrap();
        h.store.update_run_state(&run.run_id, RunState::Executing).unwrap();

        assert_eq!(h.executor.recover_expired().await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(h.executor.recover_expired_at(later).await.unwrap(), 1);

        assert!(h.executor.run_once("w2").await.unwrap());
        let stored = h.store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.attempt, 2);
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_panic_fails_run_without_killing_worker() {
        let mock = MockConnector::new().with_responder(|mode, _| match mode {
            TurnMode::Executor => panic!("backend exploded"),
            _ => "ok".into(),
        });
        let h = harness(mock, 30);
        let run = awaiting_run(&h.store);
        let job = h.executor.enqueue(&run).await.unwrap().unwrap();

        assert!(h.executor.run_once("w1").await.unwrap());
        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Failed);
        let stored = h.store.get_job(&job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_text.unwrap().contains("panicked"));
        assert!(h.egress.last_text().unwrap().contains("failed"));

        // 同一个 executor 仍可继续工作
        let next = awaiting_run(&h.store);
        h.executor.enqueue(&next).await.unwrap().unwrap();
        assert!(h.executor.run_once("w1").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_text_completes_job() {
        let mock = MockConnector::new().with_responder(|mode, _| match mode {
            TurnMode::Executor => "Error: backend crashed".into(),
            _ => "ok".into(),
        });
        let h = harness(mock, 30);
        let run = awaiting_run(&h.store);
        let job = h.executor.enqueue(&run).await.unwrap().unwrap();

        assert!(h.executor.run_once("w1").await.unwrap());
        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Completed);
        assert_eq!(h.store.get_job(&job.job_id).unwrap().unwrap().status, JobStatus::Completed);
        assert!(h.egress.last_text().unwrap().contains("Error: backend crashed"));
    }

    #[tokio::test]
    async fn test_keepalive_renews_long_running_job() {
        let h = harness(MockConnector::new().with_delay(Duration::from_millis(1500)), 2);
        let run = awaiting_run(&h.store);
        h.executor.enqueue(&run).await.unwrap().unwrap();

        let executor = Arc::clone(&h.executor);
        let worker = tokio::spawn(async move { executor.run_once("w1").await });

        // 执行 + 校验共约 3s，超过 2s 租约；心跳续约后不应被回收
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(h.executor.recover_expired().await.unwrap(), 0);

        assert!(worker.await.unwrap().unwrap());
        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Completed);
        assert_eq!(h.mock.calls_with_mode(TurnMode::Executor), 1);
    }

    #[tokio::test]
    async fn test_workers_stop_on_cancel() {
        let h = harness(MockConnector::new(), 30);
        let token = CancellationToken::new();
        let handles = h.executor.spawn_workers(2, token.clone());

        let run = awaiting_run(&h.store);
        h.executor.enqueue(&run).await.unwrap().unwrap();
        for _ in 0..100 {
            if h.store.get_run(&run.run_id).unwrap().unwrap().state == RunState::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Completed);

        token.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
