//! 只读类指令的回复：status / health / usage / logs / history / help，以及团队切换

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{Duration, Utc};

use super::{team_key, Orchestrator};
use crate::channels::InboundMessage;
use crate::command::CommandKind;
use crate::core::StoreError;

pub(super) const HELP_TEXT: &str = "Commands:\n\
- just talk: chat with the assistant\n\
- idea: <text> / plan: <text>: brainstorm or draft a plan (nothing runs)\n\
- task: <text> / project: <text>: plan a change; runs only after you approve\n\
- approve <id> / deny <id> / deny all: resolve pending requests\n\
- @alias <command>: target a configured workspace\n\
- status, health, usage, logs [n], history: <query>\n\
- team list / team load <name> / team current / team unload\n\
- mute / unmute: proactive companion messages\n\
- clear: start a fresh conversation";

const DEFAULT_LOG_LINES: usize = 10;
const MAX_LOG_LINES: usize = 50;
const HISTORY_LIMIT: usize = 10;

fn format_counts<K: AsRef<str>>(counts: impl IntoIterator<Item = (K, i64)>) -> String {
    let parts: Vec<String> = counts
        .into_iter()
        .map(|(k, v)| format!("{}={}", k.as_ref(), v))
        .collect();
    if parts.is_empty() {
        "none".to_string()
    } else {
        parts.join(", ")
    }
}

impl Orchestrator {
    pub(super) async fn status_text(&self, sender: &str) -> Result<String, StoreError> {
        let now = Utc::now();
        let mut out = String::new();
        let pending = self.pending_for(sender).await?;
        if pending.is_empty() {
            out.push_str("No pending approvals.\n");
        } else {
            out.push_str("Pending approvals:\n");
            for a in &pending {
                let mins = (a.expires_at - now).num_minutes().max(0);
                let _ = writeln!(out, "- {} ({}): {} [expires in {} min]", a.request_id, a.run_id, a.summary, mins);
            }
        }
        let owner = sender.to_string();
        let runs = self.store.call(move |s| s.list_runs(Some(&owner), 5)).await?;
        if runs.is_empty() {
            out.push_str("No runs yet.");
        } else {
            out.push_str("Recent runs:");
            for run in runs {
                let _ = write!(out, "\n- {} [{}] {}", run.run_id, run.state, run.intent);
            }
        }
        Ok(out)
    }

    pub(super) async fn health_text(&self) -> Result<String, StoreError> {
        let connector = match self.connector.ensure_started().await {
            Ok(()) => "ready".to_string(),
            Err(e) => format!("unavailable ({e})"),
        };
        let (runs, jobs, approvals) = self
            .store
            .call(|s| {
                Ok((
                    s.run_counts_by_state()?,
                    s.job_counts_by_status()?,
                    s.approval_counts_by_status()?,
                ))
            })
            .await?;
        Ok(format!(
            "Connector: {connector}\nRuns: {}\nJobs: {}\nApprovals: {}",
            format_counts(runs.iter().map(|(k, v)| (k.as_str(), *v))),
            format_counts(jobs.iter().map(|(k, v)| (k.as_str(), *v))),
            format_counts(approvals),
        ))
    }

    /// 最近 24 小时的用量；账本、Run 与会话都按归一化发件人计
    pub(super) async fn usage_text(&self, sender: &str) -> Result<String, StoreError> {
        let since = Utc::now() - Duration::hours(24);
        let owner = sender.to_string();
        let (messages, runs, total) = self
            .store
            .call(move |s| {
                Ok((
                    s.count_messages_since(&owner, since)?,
                    s.count_runs_since(&owner, since)?,
                    s.get_session(&owner)?.map(|session| session.message_count).unwrap_or(0),
                ))
            })
            .await?;
        Ok(format!(
            "Last 24h: {messages} message(s), {runs} run(s). Messages this session: {total}."
        ))
    }

    pub(super) async fn logs_text(&self, arg: &str) -> Result<String, StoreError> {
        let n = arg
            .parse::<usize>()
            .unwrap_or(DEFAULT_LOG_LINES)
            .clamp(1, MAX_LOG_LINES);
        let events = self.store.call(move |s| s.list_events(None, n)).await?;
        if events.is_empty() {
            return Ok("No events recorded yet.".to_string());
        }
        let lines: Vec<String> = events
            .iter()
            .map(|e| {
                format!(
                    "{} {} {}/{}",
                    e.created_at.format("%m-%d %H:%M:%S"),
                    e.run_id.as_deref().unwrap_or("-"),
                    e.step,
                    e.event_type
                )
            })
            .collect();
        Ok(format!("Last {} event(s):\n{}", lines.len(), lines.join("\n")))
    }

    /// 检索发件人自己的历史消息（排除本条查询）
    pub(super) async fn history_text(
        &self,
        msg: &InboundMessage,
        sender: &str,
        query: &str,
    ) -> Result<String, StoreError> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Ok("Usage: history: <search words>".to_string());
        }
        let (owner, term) = (sender.to_string(), query.clone());
        let hits: Vec<_> = self
            .store
            .call(move |s| s.search_messages(Some(&owner), &term, HISTORY_LIMIT + 1))
            .await?
            .into_iter()
            .filter(|m| m.message_id != msg.id)
            .take(HISTORY_LIMIT)
            .collect();
        if hits.is_empty() {
            return Ok(format!("No messages matching '{query}'."));
        }
        let mut out = format!("Found {} message(s):", hits.len());
        for m in hits {
            let _ = write!(out, "\n- [{}] {}", m.received_at.format("%Y-%m-%d %H:%M"), m.text);
        }
        Ok(out)
    }

    pub(super) async fn pending_list_text(&self, sender: &str, kind: CommandKind) -> Result<String, StoreError> {
        let pending = self.pending_for(sender).await?;
        if pending.is_empty() {
            return Ok("No pending approvals.".to_string());
        }
        let mut out = format!("Which request? Reply '{} <id>':", kind);
        for a in pending {
            let _ = write!(out, "\n- {}: {}", a.request_id, a.summary);
        }
        Ok(out)
    }

    async fn active_team(&self, sender: &str) -> Result<Option<String>, StoreError> {
        let key = team_key(sender);
        self.store.call(move |s| s.get_state(&key)).await
    }

    /// 当前团队的提示词前言
    pub(super) async fn active_team_preamble(&self, sender: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .active_team(sender)
            .await?
            .and_then(|name| self.config.teams.get(&name).cloned()))
    }

    /// 系统指令；目前只有团队管理
    pub(super) async fn system_command(&self, sender: &str, command: &str) -> Result<String, StoreError> {
        let teams: BTreeMap<&String, &String> = self.config.teams.iter().collect();
        let mut words = command.split_whitespace();
        match (words.next(), words.next()) {
            (Some("team"), Some("list")) => {
                if teams.is_empty() {
                    return Ok("No teams configured.".to_string());
                }
                let names: Vec<&str> = teams.keys().map(|k| k.as_str()).collect();
                Ok(format!("Teams: {}", names.join(", ")))
            }
            (Some("team"), Some("current")) => Ok(match self.active_team(sender).await? {
                Some(name) => format!("Active team: {name}"),
                None => "No team loaded.".to_string(),
            }),
            (Some("team"), Some("load")) => {
                let name = words.collect::<Vec<_>>().join(" ");
                if name.is_empty() {
                    return Ok("Usage: team load <name>".to_string());
                }
                let Some(canonical) = teams
                    .keys()
                    .find(|k| k.eq_ignore_ascii_case(&name))
                    .map(|k| k.to_string())
                else {
                    return Ok(format!("Unknown team '{name}'. Try 'team list'."));
                };
                let (key, value) = (team_key(sender), canonical.clone());
                self.store.call(move |s| s.set_state(&key, &value)).await?;
                tracing::info!(sender, team = %canonical, "team loaded");
                Ok(format!("Team '{canonical}' loaded."))
            }
            (Some("team"), Some("unload")) => {
                let key = team_key(sender);
                Ok(if self.store.call(move |s| s.delete_state(&key)).await? {
                    "Team unloaded.".to_string()
                } else {
                    "No team was loaded.".to_string()
                })
            }
            _ => Ok(format!("Unknown system command '{command}'. Send 'help' for the list.")),
        }
    }
}
