//! 内存渠道（测试替身）：MemoryIngress 按队列吐出消息，MemoryEgress 记录所有发送

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Egress, InboundMessage, Ingress, IngressFilters, OutboundEchoCache};
use crate::core::ChannelError;

/// 内存入站队列
#[derive(Debug, Default)]
pub struct MemoryIngress {
    name: String,
    pending: Mutex<VecDeque<InboundMessage>>,
    processed: Mutex<Vec<String>>,
    cursor: Mutex<Option<String>>,
    fail_next: AtomicBool,
}

impl MemoryIngress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn push(&self, msg: InboundMessage) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(msg);
        }
    }

    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// 让下一次 fetch 失败（模拟桥接故障）
    pub fn fail_next_fetch(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Ingress for MemoryIngress {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_new(
        &self,
        _cursor: Option<&str>,
        filters: &IngressFilters,
    ) -> Result<Vec<InboundMessage>, ChannelError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ChannelError::FetchFailed(format!("{} unavailable", self.name)));
        }
        let drained: Vec<InboundMessage> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return Err(ChannelError::FetchFailed("queue lock poisoned".into())),
        };
        if let Some(last) = drained.last() {
            if let Ok(mut cursor) = self.cursor.lock() {
                *cursor = Some(last.id.clone());
            }
        }
        Ok(drained.into_iter().filter(|m| filters.accepts(m)).collect())
    }

    async fn mark_processed(&self, id: &str) -> Result<(), ChannelError> {
        if let Ok(mut processed) = self.processed.lock() {
            processed.push(id.to_string());
        }
        Ok(())
    }

    fn latest_cursor(&self) -> Option<String> {
        self.cursor.lock().ok().and_then(|c| c.clone())
    }
}

/// 内存出站：记录所有发送与归档
#[derive(Debug)]
pub struct MemoryEgress {
    name: String,
    sent: Mutex<Vec<(String, String)>>,
    archived: Mutex<Vec<String>>,
    archive_supported: bool,
    echo: OutboundEchoCache,
}

impl MemoryEgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sent: Mutex::new(Vec::new()),
            archived: Mutex::new(Vec::new()),
            archive_supported: false,
            echo: OutboundEchoCache::default(),
        }
    }

    pub fn with_archive(mut self) -> Self {
        self.archive_supported = true;
        self
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }

    pub fn last_text(&self) -> Option<String> {
        self.sent().pop().map(|(_, text)| text)
    }

    pub fn archived(&self) -> Vec<String> {
        self.archived.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Egress for MemoryEgress {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .map_err(|_| ChannelError::SendFailed("sent log poisoned".into()))?
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }

    fn was_recent_outbound(&self, sender: &str, text: &str) -> bool {
        self.echo.contains(sender, text)
    }

    fn mark_outbound(&self, recipient: &str, text: &str) {
        self.echo.mark(recipient, text);
    }

    fn supports_archive(&self) -> bool {
        self.archive_supported
    }

    async fn archive(&self, item_id: &str) -> Result<(), ChannelError> {
        if !self.archive_supported {
            return Err(ChannelError::Unsupported(self.name.clone()));
        }
        self.archived
            .lock()
            .map_err(|_| ChannelError::SendFailed("archive log poisoned".into()))?
            .push(item_id.to_string());
        Ok(())
    }
}
