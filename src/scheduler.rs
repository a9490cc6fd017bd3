//! 跟进调度：按时间触发的动作表
//!
//! `check_due` 只读；调用方在真正处理（如陪伴循环把它写进提醒）之后再显式 `mark_fired`，
//! 处理失败的动作下一轮仍会被看到。

use chrono::{DateTime, Duration, Utc};

use crate::core::StoreError;
use crate::store::{ActionStatus, ScheduledAction, Store};

/// 常用动作类型
pub const ACTION_FOLLOWUP: &str = "followup";

#[derive(Clone)]
pub struct FollowUpScheduler {
    store: Store,
}

impl FollowUpScheduler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// 安排一个 delay 之后触发的动作，返回 action_id
    pub async fn schedule(
        &self,
        sender: &str,
        action_type: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<String, StoreError> {
        self.schedule_at(sender, action_type, payload, Utc::now() + delay).await
    }

    pub async fn schedule_at(
        &self,
        sender: &str,
        action_type: &str,
        payload: serde_json::Value,
        trigger_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let action = ScheduledAction {
            action_id: format!("act_{}", uuid::Uuid::new_v4().simple()),
            sender: sender.to_string(),
            action_type: action_type.to_string(),
            trigger_at,
            payload,
            status: ActionStatus::Pending,
        };
        let action_id = action.action_id.clone();
        self.store.call(move |s| s.insert_action(&action)).await?;
        tracing::debug!(action_id = %action_id, sender, action_type, "action scheduled");
        Ok(action_id)
    }

    /// 到期的 pending 动作（不改变状态）
    pub async fn check_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAction>, StoreError> {
        self.store.call(move |s| s.due_actions(now)).await
    }

    pub async fn mark_fired(&self, action_id: &str) -> Result<bool, StoreError> {
        self.set_status(action_id, ActionStatus::Fired).await
    }

    pub async fn cancel(&self, action_id: &str) -> Result<bool, StoreError> {
        self.set_status(action_id, ActionStatus::Cancelled).await
    }

    pub async fn list_pending(&self, sender: &str) -> Result<Vec<ScheduledAction>, StoreError> {
        let sender = sender.to_string();
        self.store.call(move |s| s.pending_actions_for(&sender)).await
    }

    async fn set_status(&self, action_id: &str, status: ActionStatus) -> Result<bool, StoreError> {
        let action_id = action_id.to_string();
        self.store
            .call(move |s| s.set_action_status(&action_id, status))
            .await
    }
}
