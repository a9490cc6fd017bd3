//! 持久化任务队列：入队、租约认领、续约、完成、过期回收
//!
//! 状态只沿 queued -> running -> {completed, failed, cancelled} 前进；
//! running -> queued 仅发生在租约过期回收。running 行总是带 lease_owner 与 lease_expires_at。

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::{dt_to_ms, ms_to_dt, parse_json, JobStatus, RunJob, Store};
use crate::core::StoreError;

const JOB_COLUMNS: &str = "job_id, run_id, sender, phase, attempt, payload, status, lease_owner, \
                           lease_expires_at, error_text, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> Result<RunJob, StoreError> {
    Ok(RunJob {
        job_id: row.get(0)?,
        run_id: row.get(1)?,
        sender: row.get(2)?,
        phase: row.get(3)?,
        attempt: row.get::<_, i64>(4)? as u32,
        payload: parse_json(&row.get::<_, String>(5)?),
        status: JobStatus::parse(&row.get::<_, String>(6)?)?,
        lease_owner: row.get(7)?,
        lease_expires_at: row.get::<_, Option<i64>>(8)?.map(ms_to_dt),
        error_text: row.get(9)?,
        created_at: ms_to_dt(row.get(10)?),
        updated_at: ms_to_dt(row.get(11)?),
    })
}

impl Store {
    pub fn enqueue_job(&self, job: &RunJob) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO run_jobs (job_id, run_id, sender, phase, attempt, payload, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8)",
                params![
                    job.job_id,
                    job.run_id,
                    job.sender,
                    job.phase,
                    job.attempt as i64,
                    job.payload.to_string(),
                    dt_to_ms(job.created_at),
                    dt_to_ms(job.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    /// 审批通过后入队：同一事务内把 Run 从 awaiting_approval 迁到 queued 并插入任务行；
    /// Run 已不在 awaiting_approval 时什么都不做，返回 false
    pub fn enqueue_for_run(&self, job: &RunJob) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE runs SET state = 'queued', updated_at = ?1
                 WHERE run_id = ?2 AND state = 'awaiting_approval'",
                params![dt_to_ms(Utc::now()), job.run_id],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO run_jobs (job_id, run_id, sender, phase, attempt, payload, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8)",
                params![
                    job.job_id,
                    job.run_id,
                    job.sender,
                    job.phase,
                    job.attempt as i64,
                    job.payload.to_string(),
                    dt_to_ms(job.created_at),
                    dt_to_ms(job.updated_at),
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// 认领最早的 queued 任务：先选后条件更新；条件更新影响 0 行即「抢输了」，返回 None 由调用方重试
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<RunJob>, StoreError> {
        let select_sql = format!("SELECT {JOB_COLUMNS} FROM run_jobs WHERE job_id = ?1");
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let candidate: Option<String> = tx
                .query_row(
                    "SELECT job_id FROM run_jobs WHERE status = 'queued'
                     ORDER BY created_at ASC, rowid ASC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(job_id) = candidate else {
                return Ok(None);
            };

            let changed = tx.execute(
                "UPDATE run_jobs
                 SET status = 'running', lease_owner = ?1, lease_expires_at = ?2,
                     attempt = attempt + 1, updated_at = ?3
                 WHERE job_id = ?4 AND status = 'queued'",
                params![worker_id, dt_to_ms(now + lease), dt_to_ms(now), job_id],
            )?;
            if changed == 0 {
                return Ok(None);
            }

            let job = tx.query_row(&select_sql, params![job_id], |row| Ok(job_from_row(row)))??;
            tx.commit()?;
            Ok(Some(job))
        })
    }

    /// 心跳续约：仅当任务仍在 running 且仍归属该 worker 时成功
    pub fn renew_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE run_jobs SET lease_expires_at = ?1, updated_at = ?2
                 WHERE job_id = ?3 AND status = 'running' AND lease_owner = ?4",
                params![dt_to_ms(now + lease), dt_to_ms(now), job_id, worker_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// 写入终态并清空租约字段；非终态或任务不在 running 时返回 false
    pub fn complete_job(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Ok(false);
        }
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE run_jobs
                 SET status = ?1, error_text = ?2, lease_owner = NULL, lease_expires_at = NULL, updated_at = ?3
                 WHERE job_id = ?4 AND status = 'running'",
                params![status.as_str(), error, dt_to_ms(Utc::now()), job_id],
            )?;
            Ok(changed == 1)
        })
    }

    /// 把租约已过期的 running 任务放回 queued；返回回收数量
    pub fn recover_expired_jobs(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE run_jobs
                 SET status = 'queued', lease_owner = NULL, lease_expires_at = NULL, updated_at = ?1
                 WHERE status = 'running' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1",
                params![dt_to_ms(now)],
            )?;
            Ok(changed)
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<RunJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM run_jobs WHERE job_id = ?1");
        self.with_conn(|conn| {
            conn.query_row(&sql, params![job_id], |row| Ok(job_from_row(row)))
                .optional()?
                .transpose()
        })
    }

    pub fn list_jobs_for_run(&self, run_id: &str) -> Result<Vec<RunJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM run_jobs WHERE run_id = ?1 ORDER BY created_at ASC");
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![run_id], |row| Ok(job_from_row(row)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    pub fn job_counts_by_status(&self) -> Result<BTreeMap<JobStatus, i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM run_jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (status, count) = row?;
                out.insert(JobStatus::parse(&status)?, count);
            }
            Ok(out)
        })
    }
}
