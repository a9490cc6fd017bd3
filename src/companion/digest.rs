//! 每日摘要与每周回顾
//!
//! 60 秒一次检查，目标时间 ±1 分钟内触发；先写标记再发送，保证同一天 / 同一 ISO 周最多一次。

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};

use super::{gates, is_empty_sentinel, local_date_key, CompanionLoop};
use crate::channels::normalize_sender;
use crate::connector::is_error_text;
use crate::core::StoreError;
use crate::orchestrator::{prompts, MUTED_KEY};
use crate::store::RunState;

pub const DIGEST_MARKER_KEY: &str = "companion:digest:last";
pub const WEEKLY_MARKER_KEY: &str = "companion:weekly:last";

const THREAD_KEY: &str = "digest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Daily,
    Weekly,
}

impl DigestKind {
    fn title(&self) -> &'static str {
        match self {
            DigestKind::Daily => "daily digest",
            DigestKind::Weekly => "weekly review",
        }
    }

    fn window(&self) -> Duration {
        match self {
            DigestKind::Daily => Duration::hours(24),
            DigestKind::Weekly => Duration::days(7),
        }
    }
}

/// 同一天内与目标时间相差不超过 1 分钟
fn near(now: NaiveTime, target: NaiveTime) -> bool {
    (now - target).num_seconds().abs() <= 60
}

impl CompanionLoop {
    /// 检查并发送到点的摘要；返回本次发出的种类
    pub async fn digest_tick_at<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Result<Vec<DigestKind>, StoreError> {
        let local = now.naive_local();
        let utc = now.with_timezone(&Utc);
        let mut sent = Vec::new();
        if self.config.recipient.is_none() || self.store.call(|s| s.get_flag(MUTED_KEY)).await? {
            return Ok(sent);
        }

        let daily_target = self.config.digest_time.as_deref().and_then(gates::parse_hhmm);
        if let Some(target) = daily_target {
            if near(local.time(), target)
                && self.claim_marker(DIGEST_MARKER_KEY, local_date_key(local)).await?
                && self.send_digest(DigestKind::Daily, utc).await?
            {
                sent.push(DigestKind::Daily);
            }
        }

        let weekly_day = self
            .config
            .weekly_review_day
            .as_deref()
            .and_then(|d| d.trim().parse::<Weekday>().ok());
        let weekly_target = self.config.weekly_review_time.as_deref().and_then(gates::parse_hhmm);
        if let (Some(day), Some(target)) = (weekly_day, weekly_target) {
            let week = local.date().iso_week();
            let marker = format!("{}-W{:02}", week.year(), week.week());
            if local.weekday() == day
                && near(local.time(), target)
                && self.claim_marker(WEEKLY_MARKER_KEY, marker).await?
                && self.send_digest(DigestKind::Weekly, utc).await?
            {
                sent.push(DigestKind::Weekly);
            }
        }
        Ok(sent)
    }

    /// 标记未写过该值时写入并返回 true
    async fn claim_marker(&self, key: &'static str, value: String) -> Result<bool, StoreError> {
        self.store
            .call(move |s| {
                if s.get_state(key)?.as_deref() == Some(value.as_str()) {
                    return Ok(false);
                }
                s.set_state(key, &value)?;
                Ok(true)
            })
            .await
    }

    async fn digest_facts(&self, kind: DigestKind, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let since = now - kind.window();
        let (runs, pending) = self
            .store
            .call(|s| Ok((s.list_runs(None, 500)?, s.list_pending_approvals(None)?.len())))
            .await?;
        let runs: Vec<_> = runs.into_iter().filter(|r| r.created_at >= since).collect();
        let mut facts = Vec::new();
        if !runs.is_empty() {
            let completed: Vec<&str> = runs
                .iter()
                .filter(|r| r.state == RunState::Completed)
                .map(|r| r.intent.as_str())
                .collect();
            let failed = runs.iter().filter(|r| r.state == RunState::Failed).count();
            facts.push(format!(
                "{} run(s) started, {} completed, {} failed",
                runs.len(),
                completed.len(),
                failed
            ));
            for intent in completed.iter().take(5) {
                facts.push(format!("Completed: {intent}"));
            }
        }
        if pending > 0 {
            facts.push(format!("{pending} approval(s) still pending"));
        }
        let recipient = normalize_sender(self.config.recipient.as_deref().unwrap_or_default());
        let upcoming = self.scheduler.list_pending(&recipient).await?;
        if !upcoming.is_empty() {
            facts.push(format!("{} follow-up(s) scheduled", upcoming.len()));
        }
        Ok(facts)
    }

    async fn send_digest(&self, kind: DigestKind, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let Some(recipient) = self.config.recipient.as_deref() else {
            return Ok(false);
        };
        let facts = self.digest_facts(kind, now).await?;
        let thread = self.connector.get_or_create_thread(THREAD_KEY).await;
        let reply = self
            .connector
            .run_turn(&thread, &prompts::digest(kind.title(), &facts))
            .await;
        if is_error_text(&reply) || is_empty_sentinel(&reply) {
            tracing::warn!(kind = kind.title(), "digest not sent: {}", reply.trim());
            return Ok(false);
        }
        let text = reply.trim();
        if let Err(e) = self.router.reply(&self.channel, recipient, text).await {
            tracing::warn!(kind = kind.title(), "digest send failed: {}", e);
            return Ok(false);
        }
        tracing::info!(kind = kind.title(), "digest sent");
        if let Err(e) = self.append_audit(now, text).await {
            tracing::warn!("companion audit log write failed: {}", e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channels::{EgressRouter, MemoryEgress};
    use crate::config::CompanionSection;
    use crate::connector::{MockConnector, TurnMode};
    use crate::store::Store;

    fn companion(tweak: impl FnOnce(&mut CompanionSection)) -> (CompanionLoop, Arc<MemoryEgress>, Arc<MockConnector>, Store) {
        let store = Store::open_in_memory().unwrap();
        let egress = Arc::new(MemoryEgress::new("console"));
        let mock = Arc::new(MockConnector::new());
        let mut config = CompanionSection {
            enabled: true,
            recipient: Some("+1555".into()),
            digest_time: Some("08:00".into()),
            ..CompanionSection::default()
        };
        tweak(&mut config);
        let c = CompanionLoop::new(
            store.clone(),
            mock.clone(),
            EgressRouter::new("console").register(egress.clone()),
            config,
            "console",
        );
        (c, egress, mock, store)
    }

    #[test]
    fn test_near_tolerance() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(near(t(8, 0), t(8, 0)));
        assert!(near(t(7, 59), t(8, 0)));
        assert!(near(t(8, 1), t(8, 0)));
        assert!(!near(t(8, 2), t(8, 0)));
    }

    #[tokio::test]
    async fn test_daily_digest_sends_once_per_day() {
        let (c, egress, mock, _) = companion(|_| {});
        let start = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let mut total = 0;
        for minute in 0..1440 {
            total += c.digest_tick_at(start + Duration::minutes(minute)).await.unwrap().len();
        }
        assert_eq!(total, 1);
        assert_eq!(egress.sent().len(), 1);
        assert_eq!(mock.calls_with_mode(TurnMode::Digest), 1);

        // 次日再发一次
        let next = Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).unwrap();
        assert_eq!(c.digest_tick_at(next).await.unwrap(), vec![DigestKind::Daily]);
    }

    #[tokio::test]
    async fn test_weekly_review_on_configured_day() {
        // 2026-10-16 是星期五
        let (c, egress, _, store) = companion(|cfg| {
            cfg.weekly_review_day = Some("fri".into());
            cfg.weekly_review_time = Some("18:00".into());
        });
        let start = Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap();
        let mut weekly = 0;
        for minute in 0..(2 * 1440) {
            weekly += c
                .digest_tick_at(start + Duration::minutes(minute))
                .await
                .unwrap()
                .iter()
                .filter(|k| **k == DigestKind::Weekly)
                .count();
        }
        assert_eq!(weekly, 1);
        // 两天各一次日报 + 一次周报
        assert_eq!(egress.sent().len(), 3);
        assert_eq!(store.get_state(WEEKLY_MARKER_KEY).unwrap().as_deref(), Some("2026-W42"));
    }

    #[tokio::test]
    async fn test_muted_skips_digest() {
        let (c, egress, _, store) = companion(|_| {});
        store.set_flag(MUTED_KEY, true).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 8, 0, 0).unwrap();
        assert!(c.digest_tick_at(at).await.unwrap().is_empty());
        assert!(egress.sent().is_empty());
        assert!(store.get_state(DIGEST_MARKER_KEY).unwrap().is_none());
    }
}
