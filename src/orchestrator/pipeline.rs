//! 审批后的执行流水线：executor -> (verifier) -> completed
//!
//! 内联路径（Orchestrator 直接调用）与持久化队列的 worker 共用这一份实现。
//! 流水线本身不发回复，只返回 ExecutionReport，由调用方决定回复到哪里。
//! 后端返回的 "Error: ..." 文本按正常完成推进状态，错误原文写入事件与回复；
//! FAILED 只留给 panic、持久化错误与被打断的校验。

use std::sync::Arc;

use chrono::Duration;
use serde_json::{json, Value};

use super::prompts;
use crate::channels::EgressRouter;
use crate::config::OrchestratorSection;
use crate::connector::{is_error_text, Connector};
use crate::core::{SideEffectError, StoreError};
use crate::scheduler::{FollowUpScheduler, ACTION_FOLLOWUP};
use crate::store::{Run, RunState, Store};

/// 计划文本所在的审计事件类型
pub const EVENT_PLAN_READY: &str = "plan_ready";

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub run_id: String,
    pub state: RunState,
    pub text: String,
}

pub struct RunPipeline {
    store: Store,
    connector: Arc<dyn Connector>,
    router: EgressRouter,
    scheduler: FollowUpScheduler,
    verifier_enabled: bool,
    followup_delay: Option<Duration>,
}

impl RunPipeline {
    pub fn new(
        store: Store,
        connector: Arc<dyn Connector>,
        router: EgressRouter,
        config: &OrchestratorSection,
    ) -> Self {
        let followup_delay = (config.followup_delay_secs > 0)
            .then(|| Duration::seconds(config.followup_delay_secs as i64));
        Self {
            scheduler: FollowUpScheduler::new(store.clone()),
            store,
            connector,
            router,
            verifier_enabled: config.verifier_enabled,
            followup_delay,
        }
    }

    /// 线程 key：每个 Run 独立上下文
    pub fn thread_key(run_id: &str) -> String {
        format!("run:{run_id}")
    }

    async fn record(&self, run_id: &str, step: &'static str, event_type: &'static str, payload: Value) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        self.store
            .call(move |s| s.create_event(Some(&run_id), step, event_type, payload))
            .await?;
        Ok(())
    }

    async fn advance(&self, run_id: &str, to: RunState) -> Result<bool, StoreError> {
        let run_id = run_id.to_string();
        self.store.call(move |s| s.update_run_state(&run_id, to)).await
    }

    /// 执行一个已批准的 Run
    ///
    /// Run 不在可执行状态（已拒绝、已过期失败等）时不调用后端，直接报告当前状态。
    pub async fn execute(&self, run: &Run) -> Result<ExecutionReport, StoreError> {
        let run_id = run.run_id.as_str();
        let id = run_id.to_string();
        let blocked = self
            .store
            .call(move |s| {
                if s.update_run_state(&id, RunState::Executing)? {
                    s.create_event(Some(&id), "execute", "started", json!({}))?;
                    return Ok(None);
                }
                Ok(Some(s.get_run(&id)?.map(|r| r.state)))
            })
            .await?;
        if let Some(current) = blocked {
            let current = current.unwrap_or(run.state);
            if current == RunState::Verifying {
                // 校验阶段被打断（租约回收）：不回到 executing，直接判失败
                return self.fail(run_id, "interrupted during verification").await;
            }
            tracing::info!(run_id, state = %current, "run not executable, skipping");
            return Ok(ExecutionReport {
                run_id: run_id.to_string(),
                state: current,
                text: format!("Run {run_id} is {current}; nothing to execute."),
            });
        }

        let plan = self.latest_plan(run_id).await?.unwrap_or_default();
        let thread = self.connector.get_or_create_thread(&Self::thread_key(run_id)).await;
        tracing::info!(run_id, "executing approved run");
        let output = self.connector.run_turn(&thread, &prompts::executor(run, &plan)).await;
        let output_failed = is_error_text(&output);
        if output_failed {
            tracing::warn!(run_id, "executor returned an error: {}", output);
        }
        self.record(
            run_id,
            "execute",
            "output",
            json!({ "output": prompts::truncate_chars(&output, 2000), "error": output_failed }),
        )
        .await?;

        let mut combined = output.clone();
        let mut had_error = output_failed;
        if self.verifier_enabled {
            if !self.advance(run_id, RunState::Verifying).await? {
                tracing::warn!(run_id, "run left executing before verification");
            }
            let verdict = self.connector.run_turn(&thread, &prompts::verifier(run, &output)).await;
            let verdict_failed = is_error_text(&verdict);
            if verdict_failed {
                tracing::warn!(run_id, "verifier returned an error: {}", verdict);
            }
            had_error |= verdict_failed;
            self.record(
                run_id,
                "verify",
                "verdict",
                json!({ "verdict": prompts::truncate_chars(&verdict, 2000), "error": verdict_failed }),
            )
            .await?;
            combined = format!("{output}\n\n--- Verification ---\n{verdict}");
        }

        if !self.advance(run_id, RunState::Completed).await? {
            tracing::warn!(run_id, "run could not be marked completed");
        }
        self.record(run_id, "complete", "completed", json!({ "with_errors": had_error }))
            .await?;
        tracing::info!(run_id, with_errors = had_error, "run completed");

        // 执行没产出结果时保留来源条目，便于重新发起
        if !output_failed {
            match self.cleanup_source(run).await {
                Ok(true) => tracing::info!(run_id, "source item archived"),
                Ok(false) => {}
                Err(e) => tracing::warn!(run_id, "source cleanup failed: {}", e),
            }
        }
        match self.schedule_followup(run).await {
            Ok(Some(action_id)) => tracing::debug!(run_id, action_id = %action_id, "follow-up scheduled"),
            Ok(None) => {}
            Err(e) => tracing::warn!(run_id, "follow-up scheduling failed: {}", e),
        }

        let headline = if had_error {
            format!("Run {run_id} completed with errors.")
        } else {
            format!("Run {run_id} completed.")
        };
        Ok(ExecutionReport {
            run_id: run_id.to_string(),
            state: RunState::Completed,
            text: format!("{headline}\n\n{combined}"),
        })
    }

    /// Run -> FAILED 并写审计事件
    pub async fn fail(&self, run_id: &str, error: &str) -> Result<ExecutionReport, StoreError> {
        let id = run_id.to_string();
        let reason = error.to_string();
        let (moved, state) = self
            .store
            .call(move |s| {
                let moved = s.update_run_state(&id, RunState::Failed)?;
                s.create_event(Some(&id), "execute", "failed", json!({ "error": reason }))?;
                let state = if moved {
                    RunState::Failed
                } else {
                    s.get_run(&id)?.map(|r| r.state).unwrap_or(RunState::Failed)
                };
                Ok((moved, state))
            })
            .await?;
        tracing::warn!(run_id, moved, "run failed: {}", error);
        Ok(ExecutionReport {
            run_id: run_id.to_string(),
            state,
            text: format!("Run {run_id} failed: {error}"),
        })
    }

    /// 规划阶段写下的计划全文
    pub async fn latest_plan(&self, run_id: &str) -> Result<Option<String>, StoreError> {
        let id = run_id.to_string();
        let events = self.store.call(move |s| s.list_events(Some(&id), 200)).await?;
        Ok(events
            .into_iter()
            .rev()
            .find(|e| e.event_type == EVENT_PLAN_READY)
            .and_then(|e| e.payload.get("plan").and_then(|p| p.as_str()).map(str::to_string)))
    }

    /// 归档来源条目（提醒 / 备忘录 / 日历事件）；渠道不支持或无条目 ID 时返回 Ok(false)
    pub async fn cleanup_source(&self, run: &Run) -> Result<bool, SideEffectError> {
        let ctx = &run.source_context;
        let channel = ctx
            .get("channel")
            .and_then(|c| c.as_str())
            .ok_or_else(|| SideEffectError::InvalidContext("missing channel".into()))?;
        let Some(item_id) = ctx
            .get("context")
            .and_then(|c| c.get("item_id"))
            .and_then(|i| i.as_str())
        else {
            return Ok(false);
        };
        let Some(egress) = self.router.get(channel) else {
            return Ok(false);
        };
        if !egress.supports_archive() {
            return Ok(false);
        }
        egress.archive(item_id).await?;
        self.record(&run.run_id, "cleanup", "archived", json!({ "item_id": item_id }))
            .await?;
        Ok(true)
    }

    /// 安排完成后的跟进提醒；未配置延迟时返回 Ok(None)
    pub async fn schedule_followup(&self, run: &Run) -> Result<Option<String>, SideEffectError> {
        let Some(delay) = self.followup_delay else {
            return Ok(None);
        };
        let action_id = self
            .scheduler
            .schedule(
                &run.sender,
                ACTION_FOLLOWUP,
                json!({ "run_id": run.run_id, "intent": run.intent }),
                delay,
            )
            .await?;
        Ok(Some(action_id))
    }
}
