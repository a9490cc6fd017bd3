//! 持久化层：单文件 SQLite，单连接 + 单锁
//!
//! 会话、消息去重账本、Run、审批、审计事件、KV 状态、持久化任务队列、定时动作全部落在同一个库里。
//! 所有访问都经由 `Store::with_conn`，临界区保持短小；并发正确性依赖单写者纪律，而不是细粒度锁。
//! 同步方法会阻塞当前线程；异步路径统一经 `Store::call` 放到阻塞线程池执行。

mod actions;
mod jobs;
mod messages;
pub mod models;
mod runs;
mod state;

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

use crate::core::StoreError;

pub use messages::escape_like;
pub use models::{
    ActionStatus, ApprovalRequest, ApprovalStatus, Event, JobStatus, RiskLevel, Run, RunJob,
    RunState, ScheduledAction, Session, StoredMessage,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    sender TEXT PRIMARY KEY,
    thread_id TEXT,
    message_count INTEGER NOT NULL DEFAULT 0,
    last_seen_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    hash TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    channel TEXT NOT NULL,
    text TEXT NOT NULL,
    is_from_me INTEGER NOT NULL DEFAULT 0,
    received_at INTEGER NOT NULL,
    recorded_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender, received_at);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    intent TEXT NOT NULL,
    state TEXT NOT NULL,
    cwd TEXT NOT NULL,
    risk_level TEXT NOT NULL,
    source_context TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_sender ON runs(sender, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);

CREATE TABLE IF NOT EXISTS approvals (
    request_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    summary TEXT NOT NULL,
    command_preview TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    resolved_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status, expires_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_one_open_per_run
    ON approvals(run_id) WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    run_id TEXT,
    step TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, created_at);

CREATE TABLE IF NOT EXISTS kv_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS run_jobs (
    job_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    phase TEXT NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0,
    payload TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    error_text TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_run_jobs_status ON run_jobs(status, created_at);

CREATE TABLE IF NOT EXISTS scheduled_actions (
    action_id TEXT PRIMARY KEY,
    sender TEXT NOT NULL,
    action_type TEXT NOT NULL,
    trigger_at INTEGER NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_actions(status, trigger_at);
"#;

/// 线程安全的持久化句柄；Clone 共享同一连接
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl Store {
    /// 打开（或创建）数据库文件并初始化表结构；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::bootstrap(&conn, true)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// 内存库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::bootstrap(&conn, false)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    fn bootstrap(conn: &Connection, wal: bool) -> Result<(), StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        if wal {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        }
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// 关闭连接；之后的任何访问返回 `StoreError::Closed`
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            tracing::info!("store closed");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().map(|g| g.is_none()).unwrap_or(true)
    }

    /// 在锁内执行一段操作
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        f(conn)
    }

    /// 在阻塞线程池上执行一段存储操作
    ///
    /// 锁等待与 busy_timeout 都发生在池线程上，tokio worker 不会被卡住。
    /// 连续的多步操作放进同一个闭包，只占用一次池线程。
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Blocking(e.to_string()))?
    }
}

pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub(crate) fn parse_json(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/hive.db");
        let store = Store::open(&path).unwrap();
        assert!(path.exists());
        store.close().unwrap();
        assert!(store.is_closed());
    }

    #[test]
    fn test_closed_store_rejects_access() {
        let store = Store::open_in_memory().unwrap();
        store.close().unwrap();
        let err = store.get_state("anything").unwrap_err();
        assert!(matches!(err, StoreError::Closed));
        // 重复关闭是 no-op
        store.close().unwrap();
    }

    #[tokio::test]
    async fn test_call_does_not_stall_the_runtime() {
        let store = Store::open_in_memory().unwrap();
        let slow = tokio::spawn({
            let store = store.clone();
            async move {
                store
                    .call(|s| {
                        // 持锁期间模拟一次慢查询
                        s.with_conn(|_| {
                            std::thread::sleep(std::time::Duration::from_millis(400));
                            Ok(())
                        })?;
                        s.set_state("k", "v")
                    })
                    .await
            }
        });

        // 单线程运行时上，计时器仍能按时触发
        let started = std::time::Instant::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(started.elapsed() < std::time::Duration::from_millis(300));

        slow.await.unwrap().unwrap();
        assert_eq!(store.call(|s| s.get_state("k")).await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_call_surfaces_store_errors() {
        let store = Store::open_in_memory().unwrap();
        store.close().unwrap();
        let err = store.call(|s| s.get_state("k")).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");
        {
            let store = Store::open(&path).unwrap();
            store.set_state("cursor:console", "42").unwrap();
            store.close().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_state("cursor:console").unwrap().as_deref(), Some("42"));
    }
}
