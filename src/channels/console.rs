//! 控制台渠道：从标准输入读取指令、向标准输出打印回复
//!
//! 没有外部桥接时也能直接在终端里使用守护进程。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Egress, InboundMessage, Ingress, IngressFilters, OutboundEchoCache};
use crate::core::ChannelError;

pub const CONSOLE_CHANNEL: &str = "console";

/// 标准输入：后台任务逐行读入，fetch_new 时一次性取出
pub struct ConsoleIngress {
    sender: String,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    next_id: AtomicU64,
    cursor: Mutex<Option<String>>,
}

impl ConsoleIngress {
    /// 启动 stdin 读取任务；token 取消或 EOF 时结束
    pub fn spawn(sender: impl Into<String>, token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) if !line.trim().is_empty() => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!("stdin read failed: {}", e);
                            break;
                        }
                    }
                }
            }
            tracing::debug!("console reader stopped");
        });

        Self {
            sender: sender.into(),
            rx: Mutex::new(rx),
            // 以启动时间为基，保证重启后 ID 不与账本中旧消息冲突
            next_id: AtomicU64::new(chrono::Utc::now().timestamp_millis() as u64),
            cursor: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Ingress for ConsoleIngress {
    fn name(&self) -> &str {
        CONSOLE_CHANNEL
    }

    async fn fetch_new(
        &self,
        _cursor: Option<&str>,
        filters: &IngressFilters,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        let mut lines = Vec::new();
        {
            let mut rx = self
                .rx
                .lock()
                .map_err(|_| ChannelError::FetchFailed("console receiver poisoned".into()))?;
            while let Ok(line) = rx.try_recv() {
                lines.push(line);
            }
        }

        let mut out = Vec::with_capacity(lines.len());
        for line in lines {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            let msg = InboundMessage::new(id.clone(), self.sender.clone(), line, CONSOLE_CHANNEL);
            if let Ok(mut cursor) = self.cursor.lock() {
                *cursor = Some(id);
            }
            if filters.accepts(&msg) {
                out.push(msg);
            }
        }
        Ok(out)
    }

    async fn mark_processed(&self, _id: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    fn latest_cursor(&self) -> Option<String> {
        self.cursor.lock().ok().and_then(|c| c.clone())
    }
}

/// 标准输出
#[derive(Debug, Default)]
pub struct ConsoleEgress {
    echo: OutboundEchoCache,
}

impl ConsoleEgress {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Egress for ConsoleEgress {
    fn name(&self) -> &str {
        CONSOLE_CHANNEL
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        println!("\n[hive -> {}]\n{}\n", recipient, text);
        Ok(())
    }

    fn was_recent_outbound(&self, sender: &str, text: &str) -> bool {
        self.echo.contains(sender, text)
    }

    fn mark_outbound(&self, recipient: &str, text: &str) {
        self.echo.mark(recipient, text);
    }
}
