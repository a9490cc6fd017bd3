//! 主动陪伴循环
//!
//! 按自己的节奏轮询：闸门（静音 / 免打扰 / 每小时限流）放行后收集观察项，
//! 关联后交给后端合成一条消息；后端回复 EMPTY 表示没必要打扰。
//! 每日摘要与每周回顾在 digest 子循环中按分钟检查。

mod digest;
pub mod gates;
pub mod observe;
pub mod sources;

use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDateTime, NaiveTime, TimeZone, Utc};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::channels::EgressRouter;
use crate::config::CompanionSection;
use crate::connector::{is_error_text, Connector};
use crate::core::{SideEffectError, StoreError};
use crate::orchestrator::prompts;
use crate::scheduler::FollowUpScheduler;
use crate::store::Store;

pub use digest::{DigestKind, DIGEST_MARKER_KEY, WEEKLY_MARKER_KEY};
pub use gates::Gate;
pub use observe::Observation;
pub use sources::{CalendarEvent, CalendarSource, Reminder, ReminderSource};

/// 后端表示「无需发送」的哨兵
pub const EMPTY_SENTINEL: &str = "EMPTY";

const THREAD_KEY: &str = "companion";

/// 一次检查的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NoRecipient,
    Blocked(Gate),
    NothingObserved,
    /// 后端回复 EMPTY 或出错
    Suppressed,
    SendFailed,
    Sent(String),
}

pub(crate) fn is_empty_sentinel(reply: &str) -> bool {
    reply.trim().eq_ignore_ascii_case(EMPTY_SENTINEL)
}

pub struct CompanionLoop {
    store: Store,
    connector: Arc<dyn Connector>,
    router: EgressRouter,
    scheduler: FollowUpScheduler,
    config: CompanionSection,
    channel: String,
    quiet: Option<(NaiveTime, NaiveTime)>,
    calendar: Option<Arc<dyn CalendarSource>>,
    reminders: Option<Arc<dyn ReminderSource>>,
}

impl CompanionLoop {
    pub fn new(
        store: Store,
        connector: Arc<dyn Connector>,
        router: EgressRouter,
        config: CompanionSection,
        default_channel: &str,
    ) -> Self {
        let quiet = match (config.quiet_start.as_deref(), config.quiet_end.as_deref()) {
            (Some(start), Some(end)) => match (gates::parse_hhmm(start), gates::parse_hhmm(end)) {
                (Some(s), Some(e)) => Some((s, e)),
                _ => {
                    tracing::warn!(start, end, "invalid quiet hours, ignoring");
                    None
                }
            },
            _ => None,
        };
        Self {
            scheduler: FollowUpScheduler::new(store.clone()),
            channel: config
                .channel
                .clone()
                .unwrap_or_else(|| default_channel.to_string()),
            store,
            connector,
            router,
            config,
            quiet,
            calendar: None,
            reminders: None,
        }
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarSource>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    pub fn with_reminders(mut self, reminders: Arc<dyn ReminderSource>) -> Self {
        self.reminders = Some(reminders);
        self
    }

    pub async fn check_and_notify(&self) -> Result<TickOutcome, StoreError> {
        self.check_and_notify_at(Local::now()).await
    }

    /// 一次完整检查；`now` 的时区决定免打扰与限流桶使用的本地时间
    pub async fn check_and_notify_at<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Result<TickOutcome, StoreError> {
        let local = now.naive_local();
        let utc = now.with_timezone(&Utc);
        let Some(recipient) = self.config.recipient.clone() else {
            return Ok(TickOutcome::NoRecipient);
        };

        let (quiet, max_per_hour) = (self.quiet, self.config.max_per_hour);
        let gate = self
            .store
            .call(move |s| gates::check(s, local, quiet, max_per_hour))
            .await?;
        if gate != Gate::Open {
            tracing::debug!(gate = ?gate, "companion gated");
            return Ok(TickOutcome::Blocked(gate));
        }

        let mut observations = self.gather(utc).await?;
        if observations.is_empty() {
            return Ok(TickOutcome::NothingObserved);
        }
        observe::correlate(&mut observations);
        let lines: Vec<String> = observations.iter().map(|o| o.text.clone()).collect();
        tracing::info!(count = lines.len(), "companion synthesizing observations");

        let thread = self.connector.get_or_create_thread(THREAD_KEY).await;
        let prompt = prompts::companion(&lines, &local.format("%a %H:%M").to_string());
        let reply = self.connector.run_turn(&thread, &prompt).await;
        if is_error_text(&reply) {
            tracing::warn!("companion synthesis failed: {}", reply);
            return Ok(TickOutcome::Suppressed);
        }
        if is_empty_sentinel(&reply) {
            tracing::debug!("companion chose not to send");
            return Ok(TickOutcome::Suppressed);
        }

        let text = reply.trim().to_string();
        if let Err(e) = self.router.reply(&self.channel, &recipient, &text).await {
            tracing::warn!(channel = %self.channel, "companion send failed: {}", e);
            return Ok(TickOutcome::SendFailed);
        }
        let sent = self.store.call(move |s| gates::record_send(s, local)).await?;
        tracing::info!(sent_this_hour = sent, "companion message sent");
        if let Err(e) = self.append_audit(utc, &text).await {
            tracing::warn!("companion audit log write failed: {}", e);
        }
        Ok(TickOutcome::Sent(text))
    }

    /// 收集观察项；单个数据源失败只记录日志
    async fn gather(&self, now: DateTime<Utc>) -> Result<Vec<Observation>, StoreError> {
        let mut out = Vec::new();

        let stale_after = Duration::minutes(self.config.stale_approval_mins);
        for approval in self.store.call(|s| s.list_pending_approvals(None)).await? {
            let waited = now - approval.created_at;
            if waited >= stale_after {
                out.push(Observation::new(
                    "approvals",
                    format!(
                        "Approval {} has been waiting {} min: {}",
                        approval.request_id,
                        waited.num_minutes(),
                        approval.summary
                    ),
                ));
            }
        }

        let lookahead = Duration::minutes(self.config.calendar_lookahead_mins);
        if let Some(calendar) = &self.calendar {
            match calendar.upcoming(lookahead).await {
                Ok(events) => {
                    for event in events {
                        let key = format!("companion:cooldown:event:{}", event.id);
                        if !self.claim_cooldown(key, now, lookahead * 2).await? {
                            continue;
                        }
                        let mins = (event.starts_at - now).num_minutes().max(0);
                        out.push(Observation::new(
                            "calendar",
                            format!("'{}' starts in {} min", event.title, mins),
                        ));
                    }
                }
                Err(e) => tracing::warn!("calendar source failed: {}", e),
            }
        }

        if let Some(reminders) = &self.reminders {
            match reminders.overdue(self.config.reminder_list.as_deref()).await {
                Ok(items) => {
                    for reminder in items {
                        let key = format!("companion:cooldown:reminder:{}", reminder.id);
                        if !self.claim_cooldown(key, now, Duration::hours(24)).await? {
                            continue;
                        }
                        out.push(Observation::new(
                            "reminders",
                            format!("Overdue reminder: {}", reminder.title),
                        ));
                    }
                }
                Err(e) => tracing::warn!("reminder source failed: {}", e),
            }
        }

        if let Some(path) = &self.config.inbox_file {
            match sources::count_untriaged(path).await {
                Ok(0) => {}
                Ok(n) => out.push(Observation::new("inbox", format!("{n} untriaged item(s) in the inbox"))),
                Err(e) => tracing::warn!(path = %path.display(), "inbox file unreadable: {}", e),
            }
        }

        for action in self.scheduler.check_due(now).await? {
            let detail = action
                .payload
                .get("intent")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| action.action_type.clone());
            out.push(Observation::new("followups", format!("Follow up on: {detail}")));
            self.scheduler.mark_fired(&action.action_id).await?;
        }

        Ok(out)
    }

    /// 冷却键：上次提及距今已超过 cooldown（或从未提及）时记下本次并返回 true
    async fn claim_cooldown(&self, key: String, now: DateTime<Utc>, cooldown: Duration) -> Result<bool, StoreError> {
        self.store
            .call(move |s| {
                let cooling = s
                    .get_state(&key)?
                    .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                    .is_some_and(|at| now - at.with_timezone(&Utc) < cooldown);
                if cooling {
                    return Ok(false);
                }
                s.set_state(&key, &now.to_rfc3339())?;
                Ok(true)
            })
            .await
    }

    async fn append_audit(&self, now: DateTime<Utc>, text: &str) -> Result<(), SideEffectError> {
        let Some(path) = &self.config.audit_log else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let line = format!("{}\t{}\t{}\n", now.to_rfc3339(), self.channel, flat);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// 主循环：按 poll_interval_secs 检查
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let every = std::time::Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut ticker = tokio::time::interval(every);
        tracing::info!(every_secs = every.as_secs(), channel = %self.channel, "companion loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match self.check_and_notify().await {
                    Ok(outcome) => tracing::debug!(outcome = ?outcome, "companion tick"),
                    Err(e) => tracing::warn!("companion tick failed: {}", e),
                },
            }
        }
        tracing::info!("companion loop stopped");
    }

    /// 摘要子循环：每 60 秒检查一次
    pub async fn run_digest(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.digest_tick_at(Local::now()).await {
                        tracing::warn!("digest tick failed: {}", e);
                    }
                }
            }
        }
    }
}

pub(crate) fn local_date_key(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%d").to_string()
}
