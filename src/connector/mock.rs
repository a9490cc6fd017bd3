//! Mock 连接器（用于测试，无需真实后端）
//!
//! 按提示词首行的模式标记给出固定回复，并记录每一次调用，便于断言「拒绝后从未调用 executor」之类的性质。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Connector, TurnMode};

type Responder = Box<dyn Fn(TurnMode, &str) -> String + Send + Sync>;

/// 一次调用记录
#[derive(Debug, Clone)]
pub struct ConnectorCall {
    pub thread_id: String,
    pub mode: TurnMode,
    pub prompt: String,
}

pub struct MockConnector {
    responder: Responder,
    calls: Mutex<Vec<ConnectorCall>>,
    threads: Mutex<HashMap<String, String>>,
    next_thread: AtomicU64,
    delay: Option<Duration>,
    healthy: AtomicBool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            responder: Box::new(default_reply),
            calls: Mutex::new(Vec::new()),
            threads: Mutex::new(HashMap::new()),
            next_thread: AtomicU64::new(1),
            delay: None,
            healthy: AtomicBool::new(true),
        }
    }

    /// 自定义回复
    pub fn with_responder(
        mut self,
        responder: impl Fn(TurnMode, &str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.responder = Box::new(responder);
        self
    }

    /// 每轮人为延迟（测试租约续约 / 并发）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_with_mode(&self, mode: TurnMode) -> usize {
        self.calls().iter().filter(|c| c.mode == mode).count()
    }

    fn new_thread_id(&self) -> String {
        format!("thread-{}", self.next_thread.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

fn default_reply(mode: TurnMode, prompt: &str) -> String {
    match mode {
        TurnMode::Planner => "Plan:\n1. Inspect the target\n2. Apply the change\n3. Report back".into(),
        TurnMode::Executor => "Executed: all steps completed".into(),
        TurnMode::Verifier => "Verified: OK".into(),
        TurnMode::Companion => "EMPTY".into(),
        TurnMode::Digest => "Digest: nothing notable".into(),
        TurnMode::Chat => {
            let last = prompt.lines().last().unwrap_or("").trim();
            format!("Echo from Mock: {}", last)
        }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn ensure_started(&self) -> Result<(), String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("mock backend marked unhealthy".into())
        }
    }

    async fn get_or_create_thread(&self, key: &str) -> String {
        let mut threads = match self.threads.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(id) = threads.get(key) {
            return id.clone();
        }
        let id = self.new_thread_id();
        threads.insert(key.to_string(), id.clone());
        id
    }

    async fn reset_thread(&self, key: &str) -> String {
        let id = self.new_thread_id();
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(key.to_string(), id.clone());
        }
        id
    }

    async fn run_turn(&self, thread_id: &str, prompt: &str) -> String {
        let mode = TurnMode::detect(prompt);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ConnectorCall {
                thread_id: thread_id.to_string(),
                mode,
                prompt: prompt.to_string(),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(mode, prompt)
    }

    async fn shutdown(&self) {}
}
