//! 定时动作表

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{dt_to_ms, ms_to_dt, parse_json, ActionStatus, ScheduledAction, Store};
use crate::core::StoreError;

const ACTION_COLUMNS: &str = "action_id, sender, action_type, trigger_at, payload, status";

fn action_from_row(row: &Row<'_>) -> Result<ScheduledAction, StoreError> {
    Ok(ScheduledAction {
        action_id: row.get(0)?,
        sender: row.get(1)?,
        action_type: row.get(2)?,
        trigger_at: ms_to_dt(row.get(3)?),
        payload: parse_json(&row.get::<_, String>(4)?),
        status: ActionStatus::parse(&row.get::<_, String>(5)?)?,
    })
}

impl Store {
    pub fn insert_action(&self, action: &ScheduledAction) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO scheduled_actions (action_id, sender, action_type, trigger_at, payload, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    action.action_id,
                    action.sender,
                    action.action_type,
                    dt_to_ms(action.trigger_at),
                    action.payload.to_string(),
                    action.status.as_str(),
                    dt_to_ms(Utc::now()),
                ],
            )?;
            Ok(())
        })
    }

    /// 到期且仍为 pending 的动作（只读，不修改行）
    pub fn due_actions(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledAction>, StoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM scheduled_actions
             WHERE status = 'pending' AND trigger_at <= ?1 ORDER BY trigger_at ASC"
        );
        self.query_actions(&sql, params![dt_to_ms(now)])
    }

    pub fn pending_actions_for(&self, sender: &str) -> Result<Vec<ScheduledAction>, StoreError> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM scheduled_actions
             WHERE status = 'pending' AND sender = ?1 ORDER BY trigger_at ASC"
        );
        self.query_actions(&sql, params![sender])
    }

    /// pending -> fired / cancelled；已非 pending 时返回 false
    pub fn set_action_status(&self, action_id: &str, status: ActionStatus) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE scheduled_actions SET status = ?1 WHERE action_id = ?2 AND status = 'pending'",
                params![status.as_str(), action_id],
            )?;
            Ok(changed == 1)
        })
    }

    fn query_actions(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ScheduledAction>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, |row| Ok(action_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }
}
