//! Run、审批与审计事件

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{dt_to_ms, ms_to_dt, parse_json, Store};
use super::{ApprovalRequest, ApprovalStatus, Event, RiskLevel, Run, RunState};
use crate::core::StoreError;

const RUN_COLUMNS: &str =
    "run_id, sender, intent, state, cwd, risk_level, source_context, created_at, updated_at";

const APPROVAL_COLUMNS: &str =
    "request_id, run_id, sender, summary, command_preview, status, created_at, expires_at";

fn run_from_row(row: &Row<'_>) -> Result<Run, StoreError> {
    Ok(Run {
        run_id: row.get(0)?,
        sender: row.get(1)?,
        intent: row.get(2)?,
        state: RunState::parse(&row.get::<_, String>(3)?)?,
        cwd: row.get(4)?,
        risk_level: RiskLevel::parse(&row.get::<_, String>(5)?)?,
        source_context: parse_json(&row.get::<_, String>(6)?),
        created_at: ms_to_dt(row.get(7)?),
        updated_at: ms_to_dt(row.get(8)?),
    })
}

fn approval_from_row(row: &Row<'_>) -> Result<ApprovalRequest, StoreError> {
    Ok(ApprovalRequest {
        request_id: row.get(0)?,
        run_id: row.get(1)?,
        sender: row.get(2)?,
        summary: row.get(3)?,
        command_preview: row.get(4)?,
        status: ApprovalStatus::parse(&row.get::<_, String>(5)?)?,
        created_at: ms_to_dt(row.get(6)?),
        expires_at: ms_to_dt(row.get(7)?),
    })
}

/// 把静态状态列表拼成 SQL IN 列表（值均为内部常量）
fn state_list(states: &[RunState]) -> String {
    states
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Store {
    pub fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, sender, intent, state, cwd, risk_level, source_context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.run_id,
                    run.sender,
                    run.intent,
                    run.state.as_str(),
                    run.cwd,
                    run.risk_level.as_str(),
                    run.source_context.to_string(),
                    dt_to_ms(run.created_at),
                    dt_to_ms(run.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// 条件迁移：仅当当前状态是 `to` 的合法前驱时才更新；返回是否生效
    pub fn update_run_state(&self, run_id: &str, to: RunState) -> Result<bool, StoreError> {
        let preds = to.predecessors();
        if preds.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE runs SET state = ?1, updated_at = ?2 WHERE run_id = ?3 AND state IN ({})",
            state_list(preds)
        );
        self.with_conn(|conn| {
            let changed = conn.execute(&sql, params![to.as_str(), dt_to_ms(Utc::now()), run_id])?;
            Ok(changed == 1)
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
        self.with_conn(|conn| {
            conn.query_row(&sql, params![run_id], |row| Ok(run_from_row(row)))
                .optional()?
                .transpose()
        })
    }

    /// 最近的 Run（按创建时间倒序）；sender 为 None 时返回全部
    pub fn list_runs(&self, sender: Option<&str>, limit: usize) -> Result<Vec<Run>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE (?1 IS NULL OR sender = ?1)
             ORDER BY created_at DESC LIMIT ?2"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![sender, limit as i64], |row| Ok(run_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    pub fn count_runs_since(&self, sender: &str, since: DateTime<Utc>) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM runs WHERE sender = ?1 AND created_at >= ?2",
                params![sender, dt_to_ms(since)],
                |row| row.get(0),
            )?)
        })
    }

    /// 各状态的 Run 数量（健康报告）
    pub fn run_counts_by_state(&self) -> Result<BTreeMap<RunState, i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM runs GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (state, count) = row?;
                out.insert(RunState::parse(&state)?, count);
            }
            Ok(out)
        })
    }

    pub fn create_approval(&self, approval: &ApprovalRequest) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO approvals (request_id, run_id, sender, summary, command_preview, status, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    approval.request_id,
                    approval.run_id,
                    approval.sender,
                    approval.summary,
                    approval.command_preview,
                    approval.status.as_str(),
                    dt_to_ms(approval.created_at),
                    dt_to_ms(approval.expires_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>, StoreError> {
        let sql = format!("SELECT {APPROVAL_COLUMNS} FROM approvals WHERE request_id = ?1");
        self.with_conn(|conn| {
            conn.query_row(&sql, params![request_id], |row| Ok(approval_from_row(row)))
                .optional()?
                .transpose()
        })
    }

    /// 挂起中的审批（按创建时间升序）；sender 为 None 时返回全部
    pub fn list_pending_approvals(
        &self,
        sender: Option<&str>,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let sql = format!(
            "SELECT {APPROVAL_COLUMNS} FROM approvals
             WHERE status = 'pending' AND (?1 IS NULL OR sender = ?1)
             ORDER BY created_at ASC"
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![sender], |row| Ok(approval_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// 原子解析：仅 pending 可迁移到 approved / denied / expired；已解析返回 false（安全 no-op）
    pub fn resolve_approval(
        &self,
        request_id: &str,
        status: ApprovalStatus,
    ) -> Result<bool, StoreError> {
        if status == ApprovalStatus::Pending {
            return Ok(false);
        }
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE approvals SET status = ?1, resolved_at = ?2
                 WHERE request_id = ?3 AND status = 'pending'",
                params![status.as_str(), dt_to_ms(Utc::now()), request_id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn approval_counts_by_status(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM approvals GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (status, count) = row?;
                out.insert(status, count);
            }
            Ok(out)
        })
    }

    /// 追加审计事件
    pub fn create_event(
        &self,
        run_id: Option<&str>,
        step: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Event, StoreError> {
        let event = Event {
            event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
            run_id: run_id.map(str::to_string),
            step: step.to_string(),
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO events (event_id, run_id, step, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.event_id,
                    event.run_id,
                    event.step,
                    event.event_type,
                    event.payload.to_string(),
                    dt_to_ms(event.created_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(event)
    }

    /// 审计事件：指定 run 时按时间升序，否则返回全局最近 `limit` 条（倒序）
    pub fn list_events(&self, run_id: Option<&str>, limit: usize) -> Result<Vec<Event>, StoreError> {
        let sql = if run_id.is_some() {
            "SELECT event_id, run_id, step, event_type, payload, created_at FROM events
             WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        } else {
            "SELECT event_id, run_id, step, event_type, payload, created_at FROM events
             WHERE ?1 IS NULL ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![run_id, limit as i64], |row| {
                Ok(Event {
                    event_id: row.get(0)?,
                    run_id: row.get(1)?,
                    step: row.get(2)?,
                    event_type: row.get(3)?,
                    payload: parse_json(&row.get::<_, String>(4)?),
                    created_at: ms_to_dt(row.get(5)?),
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_run() -> Run {
        Run::new("+1555", "clean up /tmp", "/tmp", RiskLevel::Medium, serde_json::json!({}))
    }

    fn approval_for(run: &Run, ttl: Duration) -> ApprovalRequest {
        let now = Utc::now();
        ApprovalRequest {
            request_id: ApprovalRequest::new_request_id(),
            run_id: run.run_id.clone(),
            sender: run.sender.clone(),
            summary: run.intent.clone(),
            command_preview: "rm -rf /tmp/cache".into(),
            status: ApprovalStatus::Pending,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    #[test]
    fn test_run_transitions_follow_dag() {
        let store = Store::open_in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).unwrap();

        assert!(!store.update_run_state(&run.run_id, RunState::Executing).unwrap());
        assert!(store.update_run_state(&run.run_id, RunState::Planning).unwrap());
        assert!(store.update_run_state(&run.run_id, RunState::AwaitingApproval).unwrap());
        assert!(store.update_run_state(&run.run_id, RunState::Denied).unwrap());
        // 终态吸收
        assert!(!store.update_run_state(&run.run_id, RunState::Executing).unwrap());
        assert_eq!(store.get_run(&run.run_id).unwrap().unwrap().state, RunState::Denied);

        let counts = store.run_counts_by_state().unwrap();
        assert_eq!(counts.get(&RunState::Denied), Some(&1));
    }

    #[test]
    fn test_resolve_approval_only_once() {
        let store = Store::open_in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).unwrap();
        let approval = approval_for(&run, Duration::minutes(15));
        store.create_approval(&approval).unwrap();

        assert_eq!(store.list_pending_approvals(Some("+1555")).unwrap().len(), 1);
        assert!(store.resolve_approval(&approval.request_id, ApprovalStatus::Approved).unwrap());
        assert!(!store.resolve_approval(&approval.request_id, ApprovalStatus::Denied).unwrap());
        let stored = store.get_approval(&approval.request_id).unwrap().unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert!(store.list_pending_approvals(None).unwrap().is_empty());
    }

    #[test]
    fn test_one_open_approval_per_run() {
        let store = Store::open_in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).unwrap();
        store.create_approval(&approval_for(&run, Duration::minutes(5))).unwrap();
        assert!(store.create_approval(&approval_for(&run, Duration::minutes(5))).is_err());
    }

    #[test]
    fn test_events_are_listed_in_order() {
        let store = Store::open_in_memory().unwrap();
        store.create_event(Some("run_a"), "plan", "plan_created", serde_json::json!({"n": 1})).unwrap();
        store.create_event(Some("run_a"), "approval", "approval_requested", serde_json::json!({})).unwrap();
        store.create_event(Some("run_b"), "plan", "plan_created", serde_json::json!({})).unwrap();

        let events = store.list_events(Some("run_a"), 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "plan_created");
        assert_eq!(events[0].payload["n"], 1);

        let recent = store.list_events(None, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].run_id.as_deref(), Some("run_b"));
    }
}
