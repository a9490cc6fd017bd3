//! 通用 CLI 连接器：每轮启动一次配置好的命令，提示词经 stdin 传入，stdout 作为回复
//!
//! 子进程在独立进程组中运行，超时或关闭时整组终止（SIGTERM -> 宽限 -> SIGKILL）。
//! 线程 ID 通过环境变量 HIVE_THREAD_ID 传给后端，由后端自行维持上下文。

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Connector, ERROR_PREFIX};
use crate::config::ConnectorSection;
use crate::core::process::terminate_process_group;

/// 单轮结果（在 select 之外处理，确保先终止进程组再返回）
enum TurnOutcome {
    Finished(std::io::Result<std::process::Output>),
    TimedOut,
    Cancelled,
}

pub struct CliConnector {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
    threads: Mutex<HashMap<String, String>>,
    /// 在途子进程的进程组 ID
    active: Mutex<HashSet<u32>>,
    shutdown: CancellationToken,
}

impl CliConnector {
    pub fn new(cfg: &ConnectorSection) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            kill_grace: Duration::from_secs(cfg.kill_grace_secs),
            threads: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn new_thread_id() -> String {
        format!("thread_{}", uuid::Uuid::new_v4().simple())
    }

    fn track(&self, pgid: u32, running: bool) {
        if let Ok(mut active) = self.active.lock() {
            if running {
                active.insert(pgid);
            } else {
                active.remove(&pgid);
            }
        }
    }

    fn build_command(&self, thread_id: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("HIVE_THREAD_ID", thread_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Connector for CliConnector {
    async fn ensure_started(&self) -> Result<(), String> {
        if self.shutdown.is_cancelled() {
            return Err("connector is shut down".into());
        }
        let check = Command::new(&self.command)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(Duration::from_secs(10), check).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("cannot start '{}': {}", self.command, e)),
            Err(_) => Err(format!("'{} --version' timed out", self.command)),
        }
    }

    async fn get_or_create_thread(&self, key: &str) -> String {
        let mut threads = match self.threads.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        threads
            .entry(key.to_string())
            .or_insert_with(Self::new_thread_id)
            .clone()
    }

    async fn reset_thread(&self, key: &str) -> String {
        let id = Self::new_thread_id();
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(key.to_string(), id.clone());
        }
        id
    }

    async fn run_turn(&self, thread_id: &str, prompt: &str) -> String {
        if self.shutdown.is_cancelled() {
            return format!("{ERROR_PREFIX}connector is shutting down");
        }

        let mut child = match self.build_command(thread_id).spawn() {
            Ok(child) => child,
            Err(e) => return format!("{ERROR_PREFIX}failed to start '{}': {}", self.command, e),
        };
        let Some(pgid) = child.id() else {
            return format!("{ERROR_PREFIX}backend exited before it could be tracked");
        };
        self.track(pgid, true);

        // 写入与读取输出必须并发，否则大提示词会在管道缓冲上互相等待
        let writer = child.stdin.take().map(|mut stdin| {
            let bytes = prompt.as_bytes().to_vec();
            let thread = thread_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::warn!(thread_id = %thread, "failed to write prompt to backend: {}", e);
                }
                // stdin 在此 drop，后端读到 EOF
            })
        });

        tracing::info!(thread_id, pgid, "backend turn started");
        let outcome = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(output) => TurnOutcome::Finished(output),
                Err(_) => TurnOutcome::TimedOut,
            },
            _ = self.shutdown.cancelled() => TurnOutcome::Cancelled,
        };
        if let Some(writer) = writer {
            writer.abort();
        }

        let reply = match outcome {
            TurnOutcome::Finished(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if output.status.success() {
                    if stdout.is_empty() {
                        format!("{ERROR_PREFIX}backend returned no output")
                    } else {
                        stdout
                    }
                } else {
                    format!("{ERROR_PREFIX}backend exited with {}: {}", output.status, stderr)
                }
            }
            TurnOutcome::Finished(Err(e)) => format!("{ERROR_PREFIX}backend I/O failed: {}", e),
            TurnOutcome::TimedOut => {
                terminate_process_group(pgid, self.kill_grace).await;
                format!("{ERROR_PREFIX}backend timed out after {}s", self.timeout.as_secs())
            }
            TurnOutcome::Cancelled => {
                terminate_process_group(pgid, self.kill_grace).await;
                format!("{ERROR_PREFIX}interrupted by shutdown")
            }
        };
        self.track(pgid, false);
        reply
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        let pgids: Vec<u32> = self
            .active
            .lock()
            .map(|a| a.iter().copied().collect())
            .unwrap_or_default();
        if !pgids.is_empty() {
            tracing::info!("terminating {} in-flight backend process group(s)", pgids.len());
        }
        futures_util::future::join_all(
            pgids
                .into_iter()
                .map(|pgid| terminate_process_group(pgid, self.kill_grace)),
        )
        .await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn connector(command: &str, args: &[&str], timeout_secs: u64) -> CliConnector {
        CliConnector::new(&ConnectorSection {
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout_secs,
            kill_grace_secs: 1,
        })
    }

    #[tokio::test]
    async fn test_prompt_goes_through_stdin() {
        let c = connector("cat", &[], 10);
        let thread = c.get_or_create_thread("+1555").await;
        assert_eq!(c.run_turn(&thread, "hello backend").await, "hello backend");
    }

    #[tokio::test]
    async fn test_large_prompt_does_not_deadlock() {
        let c = connector("cat", &[], 20);
        let prompt = "x".repeat(512 * 1024);
        let reply = tokio::time::timeout(Duration::from_secs(15), c.run_turn("t", &prompt))
            .await
            .unwrap();
        assert_eq!(reply.len(), 512 * 1024);
        assert!(!reply.starts_with(ERROR_PREFIX));
    }

    #[tokio::test]
    async fn test_failures_become_error_text() {
        let missing = connector("definitely-not-a-real-binary-hive", &[], 10);
        assert!(missing.run_turn("t", "x").await.starts_with(ERROR_PREFIX));
        assert!(missing.ensure_started().await.is_err());

        let failing = connector("sh", &["-c", "echo nope >&2; exit 3"], 10);
        let reply = failing.run_turn("t", "x").await;
        assert!(reply.starts_with(ERROR_PREFIX));
        assert!(reply.contains("nope"));
    }

    #[tokio::test]
    async fn test_timeout_kills_backend() {
        let slow = connector("sh", &["-c", "sleep 30"], 1);
        let started = std::time::Instant::now();
        let reply = slow.run_turn("t", "").await;
        assert!(reply.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_thread_env_is_passed() {
        let c = connector("sh", &["-c", "echo $HIVE_THREAD_ID"], 10);
        let thread = c.reset_thread("+1555").await;
        assert_eq!(c.run_turn(&thread, "").await, thread);
    }
}
