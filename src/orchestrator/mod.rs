//! 编排器：审批状态机
//!
//! 唯一入口 `handle_message`：去重 -> 解析 -> 分发。非变更类指令同步回复；
//! 变更类指令（task / project）先规划、挂起审批，等待同一发件人的 approve / deny。
//! 各分支只产出 OrchestrationResult，回复统一在 handle_message 末尾发送。

mod info;
pub mod pipeline;
pub mod prompts;

use std::path::{Component, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use crate::channels::{normalize_sender, EgressRouter, InboundMessage};
use crate::command::{self, CommandKind, ParsedCommand};
use crate::config::OrchestratorSection;
use crate::connector::Connector;
use crate::core::{SideEffectError, StoreError};
use crate::executor::RunExecutor;
use crate::store::{ApprovalRequest, ApprovalStatus, RiskLevel, Run, RunState, Store};

pub use pipeline::{ExecutionReport, RunPipeline};

/// 处理结果类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// 重复投递，什么都没做
    Duplicate,
    /// 缺少必需前缀等，静默忽略
    Ignored,
    /// 非变更类指令的直接回复
    Replied,
    /// 策略拒绝（工作区不在白名单等），无状态变化
    Rejected,
    AwaitingApproval,
    UnknownRequest,
    /// 非原请求人尝试审批
    NotRequester,
    AlreadyResolved,
    Denied,
    Expired,
    Queued,
    Completed,
    Failed,
}

/// 编排器对上层的唯一返回契约
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationResult {
    pub kind: ResultKind,
    pub run_id: Option<String>,
    pub approval_request_id: Option<String>,
    /// 已发出（或应发出）的回复；静默结果为空串
    pub response: String,
}

impl OrchestrationResult {
    fn reply(kind: ResultKind, response: impl Into<String>) -> Self {
        Self {
            kind,
            run_id: None,
            approval_request_id: None,
            response: response.into(),
        }
    }

    fn silent(kind: ResultKind) -> Self {
        Self::reply(kind, "")
    }

    fn with_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    fn with_request(mut self, request_id: &str) -> Self {
        self.approval_request_id = Some(request_id.to_string());
        self
    }
}

/// KV：陪伴循环静音标志
pub const MUTED_KEY: &str = "companion:muted";

pub(crate) fn team_key(sender: &str) -> String {
    format!("team:active:{sender}")
}

pub struct Orchestrator {
    store: Store,
    connector: Arc<dyn Connector>,
    router: EgressRouter,
    pipeline: Arc<RunPipeline>,
    executor: Option<Arc<RunExecutor>>,
    config: OrchestratorSection,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        connector: Arc<dyn Connector>,
        router: EgressRouter,
        pipeline: Arc<RunPipeline>,
        config: OrchestratorSection,
    ) -> Self {
        Self {
            store,
            connector,
            router,
            pipeline,
            executor: None,
            config,
        }
    }

    /// 启用持久化队列路径：批准后入队而不是内联执行
    pub fn with_executor(mut self, executor: Arc<RunExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// 处理一条入站消息
    ///
    /// 只有持久化错误会返回 Err，由轮询循环记录后下一轮重试。
    /// 出错时撤销本条的去重记录，重新投递会被完整处理一次；成功处理过的重复投递是 no-op。
    pub async fn handle_message(&self, msg: &InboundMessage) -> Result<OrchestrationResult, StoreError> {
        let hash = msg.dedupe_hash();
        let (record_hash, record_msg) = (hash.clone(), msg.clone());
        let fresh = self
            .store
            .call(move |s| s.record_message(&record_hash, &record_msg))
            .await?;
        if !fresh {
            tracing::debug!(message_id = %msg.id, channel = %msg.channel, "duplicate delivery ignored");
            return Ok(OrchestrationResult::silent(ResultKind::Duplicate));
        }
        match self.process(msg).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let forgotten = self.store.call(move |s| s.forget_message(&hash)).await;
                if let Err(forget_err) = forgotten {
                    tracing::warn!(message_id = %msg.id, "could not release dedupe record: {}", forget_err);
                }
                Err(e)
            }
        }
    }

    async fn process(&self, msg: &InboundMessage) -> Result<OrchestrationResult, StoreError> {
        let sender = normalize_sender(&msg.sender);
        let session_sender = sender.clone();
        self.store
            .call(move |s| s.upsert_session(&session_sender, None))
            .await?;

        let mut cmd = command::parse(&msg.text);
        if cmd.kind == CommandKind::Chat {
            if let Some(prefix) = self.config.required_prefix.as_deref() {
                match strip_required_prefix(&cmd.payload, prefix) {
                    Some(rest) => {
                        let workspace = cmd.workspace.take();
                        cmd = command::parse(rest);
                        cmd.workspace = cmd.workspace.or(workspace);
                    }
                    None => {
                        tracing::debug!(sender = %sender, "chat without required prefix ignored");
                        return Ok(OrchestrationResult::silent(ResultKind::Ignored));
                    }
                }
            }
        }
        tracing::info!(sender = %sender, kind = %cmd.kind, channel = %msg.channel, "handling message");

        let result = self.dispatch(msg, &sender, cmd).await?;
        if !result.response.is_empty() {
            if let Err(e) = self.send_reply(&msg.channel, &msg.sender, &result.response).await {
                tracing::warn!(channel = %msg.channel, "reply failed: {}", e);
            }
        }
        Ok(result)
    }

    async fn send_reply(&self, channel: &str, recipient: &str, text: &str) -> Result<(), SideEffectError> {
        self.router.reply(channel, recipient, text).await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        msg: &InboundMessage,
        sender: &str,
        cmd: ParsedCommand,
    ) -> Result<OrchestrationResult, StoreError> {
        let reply = |text: String| -> Result<OrchestrationResult, StoreError> {
            Ok(OrchestrationResult::reply(ResultKind::Replied, text))
        };
        match cmd.kind {
            CommandKind::Chat => {
                if cmd.payload.trim().is_empty() {
                    return Ok(OrchestrationResult::silent(ResultKind::Ignored));
                }
                let prompt = prompts::chat(self.active_team_preamble(sender).await?.as_deref(), &cmd.payload);
                reply(self.converse(sender, &prompt).await?)
            }
            CommandKind::Idea => {
                let prompt = prompts::idea(self.active_team_preamble(sender).await?.as_deref(), &cmd.payload);
                reply(self.converse(sender, &prompt).await?)
            }
            CommandKind::Plan => {
                let prompt = prompts::plan_only(self.active_team_preamble(sender).await?.as_deref(), &cmd.payload);
                reply(self.converse(sender, &prompt).await?)
            }
            CommandKind::ClearContext => {
                let thread = self.connector.reset_thread(sender).await;
                let owner = sender.to_string();
                self.store
                    .call(move |s| s.set_session_thread(&owner, &thread))
                    .await?;
                reply("Context cleared. Starting a fresh conversation.".into())
            }
            CommandKind::Status => reply(self.status_text(sender).await?),
            CommandKind::Health => reply(self.health_text().await?),
            CommandKind::Usage => reply(self.usage_text(sender).await?),
            CommandKind::Logs => reply(self.logs_text(&cmd.payload).await?),
            CommandKind::Help => reply(info::HELP_TEXT.to_string()),
            CommandKind::History => reply(self.history_text(msg, sender, &cmd.payload).await?),
            CommandKind::System => reply(self.system_command(sender, &cmd.payload).await?),
            CommandKind::Mute => {
                self.store.call(|s| s.set_flag(MUTED_KEY, true)).await?;
                reply("Companion muted. Send 'unmute' to turn proactive messages back on.".into())
            }
            CommandKind::Unmute => {
                self.store.call(|s| s.set_flag(MUTED_KEY, false)).await?;
                reply("Companion unmuted.".into())
            }
            CommandKind::Task | CommandKind::Project => self.start_run(msg, sender, &cmd).await,
            CommandKind::Approve | CommandKind::Deny => {
                if cmd.payload.is_empty() {
                    return reply(self.pending_list_text(sender, cmd.kind).await?);
                }
                self.resolve(sender, &cmd.payload, cmd.kind == CommandKind::Approve, Utc::now())
                    .await
            }
            CommandKind::DenyAll => self.deny_all(sender).await,
        }
    }

    /// 在发件人的对话线程上跑一轮
    async fn converse(&self, sender: &str, prompt: &str) -> Result<String, StoreError> {
        let owner = sender.to_string();
        let existing = self
            .store
            .call(move |s| Ok(s.get_session(&owner)?.and_then(|session| session.thread_id)))
            .await?;
        let thread = match existing {
            Some(thread) => thread,
            None => {
                let thread = self.connector.get_or_create_thread(sender).await;
                let (owner, id) = (sender.to_string(), thread.clone());
                self.store.call(move |s| s.set_session_thread(&owner, &id)).await?;
                thread
            }
        };
        Ok(self.connector.run_turn(&thread, prompt).await)
    }

    // ---- 变更类指令 ----

    async fn start_run(
        &self,
        msg: &InboundMessage,
        sender: &str,
        cmd: &ParsedCommand,
    ) -> Result<OrchestrationResult, StoreError> {
        let intent = cmd.payload.trim();
        if intent.is_empty() {
            return Ok(OrchestrationResult::reply(
                ResultKind::Rejected,
                format!("Usage: {}: <what to do>", cmd.kind),
            ));
        }
        let cwd = match self.resolve_workspace(cmd.workspace.as_deref()) {
            Ok(cwd) => cwd,
            Err(reason) => {
                tracing::debug!(sender, "workspace rejected: {}", reason);
                return Ok(OrchestrationResult::reply(ResultKind::Rejected, reason));
            }
        };

        let run = Run::new(
            sender,
            intent,
            cwd.to_string_lossy(),
            assess_risk(cmd.kind, intent),
            msg.source_context(),
        );
        let run_id = run.run_id.as_str();
        let (stored, kind) = (run.clone(), cmd.kind.as_str());
        let text = intent.to_string();
        self.store
            .call(move |s| {
                s.create_run(&stored)?;
                s.create_event(
                    Some(&stored.run_id),
                    "intake",
                    "received",
                    json!({ "kind": kind, "text": text }),
                )?;
                s.update_run_state(&stored.run_id, RunState::Planning)?;
                Ok(())
            })
            .await?;

        let thread = self
            .connector
            .get_or_create_thread(&RunPipeline::thread_key(run_id))
            .await;
        let plan = self
            .connector
            .run_turn(&thread, &prompts::planner(&run, cmd.kind.as_str()))
            .await;

        let now = Utc::now();
        let ttl = Duration::seconds(self.config.approval_ttl_secs as i64);
        let approval = ApprovalRequest {
            request_id: ApprovalRequest::new_request_id(),
            run_id: run_id.to_string(),
            sender: sender.to_string(),
            summary: prompts::truncate_chars(intent, 120),
            command_preview: prompts::truncate_chars(&plan, 500),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
        };
        let (pending, full_plan) = (approval.clone(), plan.clone());
        self.store
            .call(move |s| {
                s.update_run_state(&pending.run_id, RunState::AwaitingApproval)?;
                s.create_approval(&pending)?;
                s.create_event(
                    Some(&pending.run_id),
                    "plan",
                    pipeline::EVENT_PLAN_READY,
                    json!({ "plan": full_plan, "request_id": pending.request_id }),
                )?;
                Ok(())
            })
            .await?;
        tracing::info!(run_id, request_id = %approval.request_id, "run awaiting approval");

        let id = &approval.request_id;
        let response = format!(
            "Plan for {} ({run_id}):\n{plan}\n\nReply 'approve {id}' to run it or 'deny {id}' to cancel. \
             This request expires in {} min.",
            cmd.kind,
            ttl.num_minutes().max(1),
        );
        Ok(OrchestrationResult::reply(ResultKind::AwaitingApproval, response)
            .with_run(run_id)
            .with_request(id))
    }

    /// 解析 @alias 并检查白名单
    ///
    /// 未配置 allowed_workspaces 时，只允许默认工作区与已登记的别名路径。
    fn resolve_workspace(&self, alias: Option<&str>) -> Result<PathBuf, String> {
        let path = match alias {
            Some(alias) => self
                .config
                .workspaces
                .get(alias)
                .cloned()
                .ok_or_else(|| format!("Unknown workspace @{alias}. Nothing was changed."))?,
            None => self.config.default_workspace.clone(),
        };
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!(
                "Workspace {} is not allowed (parent directory references). Nothing was changed.",
                path.display()
            ));
        }
        let allowed = if self.config.allowed_workspaces.is_empty() {
            std::iter::once(&self.config.default_workspace)
                .chain(self.config.workspaces.values())
                .any(|root| path.starts_with(root))
        } else {
            self.config
                .allowed_workspaces
                .iter()
                .any(|root| path.starts_with(root))
        };
        if allowed {
            Ok(path)
        } else {
            Err(format!(
                "Workspace {} is not in the allow-list. Nothing was changed.",
                path.display()
            ))
        }
    }

    // ---- 审批 ----

    /// 发件人名下仍挂起的审批（归一化后比较）
    async fn pending_for(&self, sender: &str) -> Result<Vec<ApprovalRequest>, StoreError> {
        Ok(self
            .store
            .call(|s| s.list_pending_approvals(None))
            .await?
            .into_iter()
            .filter(|a| normalize_sender(&a.sender) == sender)
            .collect())
    }

    async fn load_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        let request_id = request_id.to_string();
        self.store.call(move |s| s.get_approval(&request_id)).await
    }

    async fn resolve(
        &self,
        sender: &str,
        request_id: &str,
        approve: bool,
        now: DateTime<Utc>,
    ) -> Result<OrchestrationResult, StoreError> {
        let verb = if approve { "approve" } else { "deny" };
        let Some(approval) = self.load_approval(request_id).await? else {
            tracing::debug!(sender, request_id, "unknown approval request");
            return Ok(OrchestrationResult::reply(
                ResultKind::UnknownRequest,
                format!("Unknown approval request {request_id}."),
            ));
        };
        let run_id = approval.run_id.clone();
        if normalize_sender(&approval.sender) != sender {
            tracing::debug!(sender, request_id, "approval attempted by another sender");
            return Ok(OrchestrationResult::reply(
                ResultKind::NotRequester,
                format!("Only the original requester can {verb} request {request_id}."),
            )
            .with_run(&run_id)
            .with_request(request_id));
        }
        if approval.status != ApprovalStatus::Pending {
            return Ok(self.already_resolved(&approval));
        }

        if !approve {
            if !self.deny_one(&approval).await? {
                return self.reload_resolved(request_id).await;
            }
            return Ok(OrchestrationResult::reply(
                ResultKind::Denied,
                format!("Denied {request_id}. Run {run_id} will not execute."),
            )
            .with_run(&run_id)
            .with_request(request_id));
        }

        if approval.is_expired_at(now) {
            if !self.expire_one(&approval).await? {
                return self.reload_resolved(request_id).await;
            }
            return Ok(OrchestrationResult::reply(
                ResultKind::Expired,
                format!(
                    "Request {request_id} expired before it was approved; run {run_id} was marked failed. \
                     Send the request again to get a fresh plan."
                ),
            )
            .with_run(&run_id)
            .with_request(request_id));
        }

        let (req, rid) = (request_id.to_string(), run_id.clone());
        let granted = self
            .store
            .call(move |s| {
                if !s.resolve_approval(&req, ApprovalStatus::Approved)? {
                    return Ok(None);
                }
                s.create_event(Some(&rid), "approval", "approved", json!({ "request_id": req }))?;
                s.get_run(&rid).map(Some)
            })
            .await?;
        let Some(run) = granted else {
            return self.reload_resolved(request_id).await;
        };
        tracing::info!(run_id = %run_id, request_id, "approval granted");

        let Some(run) = run else {
            return Ok(OrchestrationResult::reply(
                ResultKind::Failed,
                format!("Run {run_id} for request {request_id} no longer exists."),
            )
            .with_request(request_id));
        };

        if let Some(executor) = &self.executor {
            return Ok(match executor.enqueue(&run).await? {
                Some(job) => {
                    tracing::info!(run_id = %run_id, job_id = %job.job_id, "run queued");
                    OrchestrationResult::reply(
                        ResultKind::Queued,
                        format!("Approved {request_id}. Run {run_id} is queued; I'll report back when it finishes."),
                    )
                }
                None => OrchestrationResult::reply(
                    ResultKind::Failed,
                    format!("Approved {request_id}, but run {run_id} is no longer waiting for approval."),
                ),
            }
            .with_run(&run_id)
            .with_request(request_id));
        }

        let report = self.pipeline.execute(&run).await?;
        let kind = if report.state == RunState::Completed {
            ResultKind::Completed
        } else {
            ResultKind::Failed
        };
        Ok(OrchestrationResult::reply(kind, report.text)
            .with_run(&run_id)
            .with_request(request_id))
    }

    fn already_resolved(&self, approval: &ApprovalRequest) -> OrchestrationResult {
        OrchestrationResult::reply(
            ResultKind::AlreadyResolved,
            format!("Request {} is already {}.", approval.request_id, approval.status),
        )
        .with_run(&approval.run_id)
        .with_request(&approval.request_id)
    }

    /// 条件更新输给了并发的另一方：按最新状态回复
    async fn reload_resolved(&self, request_id: &str) -> Result<OrchestrationResult, StoreError> {
        Ok(match self.load_approval(request_id).await? {
            Some(approval) => self.already_resolved(&approval),
            None => OrchestrationResult::reply(
                ResultKind::UnknownRequest,
                format!("Unknown approval request {request_id}."),
            ),
        })
    }

    /// 审批解析为 status，同时把 Run 迁移到 run_state；输给并发方时返回 false
    async fn close_approval(
        &self,
        approval: &ApprovalRequest,
        status: ApprovalStatus,
        run_state: RunState,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let (request_id, run_id) = (approval.request_id.clone(), approval.run_id.clone());
        let event_type = status.as_str();
        self.store
            .call(move |s| {
                if !s.resolve_approval(&request_id, status)? {
                    return Ok(false);
                }
                s.update_run_state(&run_id, run_state)?;
                s.create_event(Some(&run_id), "approval", event_type, payload)?;
                Ok(true)
            })
            .await
    }

    async fn deny_one(&self, approval: &ApprovalRequest) -> Result<bool, StoreError> {
        let payload = json!({ "request_id": approval.request_id });
        if !self
            .close_approval(approval, ApprovalStatus::Denied, RunState::Denied, payload)
            .await?
        {
            return Ok(false);
        }
        tracing::info!(run_id = %approval.run_id, request_id = %approval.request_id, "approval denied");
        Ok(true)
    }

    async fn expire_one(&self, approval: &ApprovalRequest) -> Result<bool, StoreError> {
        let payload = json!({ "request_id": approval.request_id, "expires_at": approval.expires_at.to_rfc3339() });
        if !self
            .close_approval(approval, ApprovalStatus::Expired, RunState::Failed, payload)
            .await?
        {
            return Ok(false);
        }
        tracing::info!(run_id = %approval.run_id, request_id = %approval.request_id, "approval expired");
        Ok(true)
    }

    async fn deny_all(&self, sender: &str) -> Result<OrchestrationResult, StoreError> {
        let mut denied = 0;
        for approval in self.pending_for(sender).await? {
            if self.deny_one(&approval).await? {
                denied += 1;
            }
        }
        let text = if denied == 0 {
            "No pending approvals to deny.".to_string()
        } else {
            format!("Denied {denied} pending request(s). Nothing will execute.")
        };
        Ok(OrchestrationResult::reply(ResultKind::Denied, text))
    }

    /// 维护循环：把过期未处理的审批标为 expired、Run 标为 FAILED，并尽力通知请求人
    pub async fn expire_stale_approvals(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut expired = 0;
        let pending = self.store.call(|s| s.list_pending_approvals(None)).await?;
        for approval in pending {
            if !approval.is_expired_at(now) || !self.expire_one(&approval).await? {
                continue;
            }
            expired += 1;
            if let Err(e) = self.notify_expired(&approval).await {
                tracing::warn!(request_id = %approval.request_id, "expiry notice failed: {}", e);
            }
        }
        Ok(expired)
    }

    async fn notify_expired(&self, approval: &ApprovalRequest) -> Result<(), SideEffectError> {
        let run_id = approval.run_id.clone();
        let run = self
            .store
            .call(move |s| s.get_run(&run_id))
            .await?
            .ok_or_else(|| SideEffectError::InvalidContext(format!("run {} missing", approval.run_id)))?;
        let channel = run
            .source_context
            .get("channel")
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        let text = format!(
            "Request {} expired without a decision; run {} was not executed.",
            approval.request_id, approval.run_id
        );
        self.send_reply(channel, &approval.sender, &text).await
    }
}

/// 必需前缀：大小写不敏感，后面必须是边界；返回去掉前缀与分隔符后的正文
fn strip_required_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let text = text.trim_start();
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return Some(text);
    }
    let head = text.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &text[prefix.len()..];
    if rest.chars().next().is_some_and(|c| c.is_alphanumeric()) {
        return None;
    }
    Some(rest.trim_start_matches(|c: char| c == ':' || c == ',' || c.is_whitespace()))
}

/// 粗粒度风险评估
fn assess_risk(kind: CommandKind, intent: &str) -> RiskLevel {
    const DESTRUCTIVE: &[&str] = &[
        "rm ", "delete", "remove", "drop ", "sudo", "wipe", "format", "force", "deploy", "overwrite",
    ];
    let lowered = intent.to_lowercase();
    if DESTRUCTIVE.iter().any(|word| lowered.contains(word)) || kind == CommandKind::Project {
        RiskLevel::High
    } else {
        RiskLevel::Medium
    }
}
