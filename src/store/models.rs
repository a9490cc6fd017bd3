//! 持久化记录：Run、ApprovalRequest、Event、RunJob、ScheduledAction、Session
//!
//! 所有状态枚举以小写 snake_case 字符串落库，`as_str` / `parse` 互为逆。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::StoreError;

/// Run 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Received,
    Planning,
    AwaitingApproval,
    Queued,
    Executing,
    Verifying,
    Completed,
    Denied,
    Failed,
    Cancelled,
}

impl RunState {
    pub const ALL: [RunState; 10] = [
        RunState::Received,
        RunState::Planning,
        RunState::AwaitingApproval,
        RunState::Queued,
        RunState::Executing,
        RunState::Verifying,
        RunState::Completed,
        RunState::Denied,
        RunState::Failed,
        RunState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Received => "received",
            RunState::Planning => "planning",
            RunState::AwaitingApproval => "awaiting_approval",
            RunState::Queued => "queued",
            RunState::Executing => "executing",
            RunState::Verifying => "verifying",
            RunState::Completed => "completed",
            RunState::Denied => "denied",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown run state '{s}'")))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Denied | RunState::Failed | RunState::Cancelled
        )
    }

    /// 允许迁移到 `self` 的前驱状态
    ///
    /// Executing -> Executing 仅用于租约回收后的重新执行。
    pub fn predecessors(&self) -> &'static [RunState] {
        use RunState::*;
        match self {
            Received => &[],
            Planning => &[Received],
            AwaitingApproval => &[Planning],
            Queued => &[AwaitingApproval],
            Executing => &[AwaitingApproval, Queued, Executing],
            Verifying => &[Executing],
            Completed => &[Executing, Verifying],
            Denied | Cancelled => &[Planning, AwaitingApproval, Queued, Executing],
            Failed => &[Planning, AwaitingApproval, Queued, Executing, Verifying],
        }
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        next.predecessors().contains(self)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 风险等级（由指令类型推断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            other => Err(StoreError::Corrupt(format!("unknown risk level '{other}'"))),
        }
    }
}

/// 一次变更类指令的完整生命周期
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub sender: String,
    pub intent: String,
    pub state: RunState,
    pub cwd: String,
    pub risk_level: RiskLevel,
    /// 来源渠道与条目 ID（JSON），用于执行后的清理
    pub source_context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(
        sender: impl Into<String>,
        intent: impl Into<String>,
        cwd: impl Into<String>,
        risk_level: RiskLevel,
        source_context: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            sender: sender.into(),
            intent: intent.into(),
            state: RunState::Received,
            cwd: cwd.into(),
            risk_level,
            source_context,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "denied" => Ok(ApprovalStatus::Denied),
            "expired" => Ok(ApprovalStatus::Expired),
            other => Err(StoreError::Corrupt(format!("unknown approval status '{other}'"))),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 限时审批闸门
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub run_id: String,
    pub sender: String,
    pub summary: String,
    pub command_preview: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalRequest {
    /// request_id 形如 `req_1a2b3c4d`
    pub fn new_request_id() -> String {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        format!("req_{}", &simple[..8])
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// 审计事件（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub run_id: Option<String>,
    pub step: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// 队列任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown job status '{other}'"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// 持久化、可恢复的执行单元
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunJob {
    pub job_id: String,
    pub run_id: String,
    pub sender: String,
    pub phase: String,
    pub attempt: u32,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunJob {
    pub fn new(run: &Run, phase: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            job_id: format!("job_{}", uuid::Uuid::new_v4().simple()),
            run_id: run.run_id.clone(),
            sender: run.sender.clone(),
            phase: phase.into(),
            attempt: 0,
            payload,
            status: JobStatus::Queued,
            lease_owner: None,
            lease_expires_at: None,
            error_text: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 定时动作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Fired,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Fired => "fired",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "fired" => Ok(ActionStatus::Fired),
            "cancelled" => Ok(ActionStatus::Cancelled),
            other => Err(StoreError::Corrupt(format!("unknown action status '{other}'"))),
        }
    }
}

/// 定时触发的跟进动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub action_id: String,
    pub sender: String,
    pub action_type: String,
    pub trigger_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub status: ActionStatus,
}

/// 发件人会话：AI 线程 ID 与活跃度
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sender: String,
    pub thread_id: Option<String>,
    pub message_count: i64,
    pub last_seen_at: DateTime<Utc>,
}

/// 账本中的历史消息（用于 history 检索）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub sender: String,
    pub channel: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}
