//! 渠道抽象：Ingress（拉取入站）、Egress（发送出站）与入站消息模型
//!
//! 真正读写邮件 / 备忘录 / 提醒 / 日历 / 本地消息库的桥接不在本 crate 内，只通过这里的 trait 接入。
//! 本模块自带两类实现：console（标准输入输出，便于本地使用）与 memory（测试替身）。

pub mod console;
pub mod echo;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::ChannelError;

pub use console::{ConsoleEgress, ConsoleIngress};
pub use echo::OutboundEchoCache;
pub use memory::{MemoryEgress, MemoryIngress};

/// 入站消息：由 Ingress 构造，Orchestrator 消费一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub is_from_me: bool,
    /// 来源渠道名（如 imessage / mail / reminders / notes / calendar / console）
    pub channel: String,
    /// 渠道特定上下文（如 item_id、list、mailbox），用于执行后的清理
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            text: text.into(),
            received_at: Utc::now(),
            is_from_me: false,
            channel: channel.into(),
            context: HashMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn from_me(mut self) -> Self {
        self.is_from_me = true;
        self
    }

    /// 去重键：sha256(sender, id, text)
    pub fn dedupe_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sender.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// 来源上下文（写入 Run.source_context）
    pub fn source_context(&self) -> serde_json::Value {
        serde_json::json!({
            "channel": self.channel,
            "message_id": self.id,
            "context": self.context,
        })
    }
}

/// 发件人归一化：去空白、去 tel:/mailto: 前缀、小写；电话号码只保留 + 与数字
pub fn normalize_sender(raw: &str) -> String {
    let trimmed = raw.trim();
    let lowered = trimmed.to_lowercase();
    let stripped = lowered
        .strip_prefix("tel:")
        .or_else(|| lowered.strip_prefix("mailto:"))
        .unwrap_or(&lowered)
        .trim();

    let looks_like_phone = !stripped.is_empty()
        && stripped
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.'))
        && stripped.chars().any(|c| c.is_ascii_digit());
    if looks_like_phone {
        let mut out = String::new();
        for (i, c) in stripped.chars().filter(|c| *c == '+' || c.is_ascii_digit()).enumerate() {
            if c == '+' && i != 0 {
                continue;
            }
            out.push(c);
        }
        return out;
    }
    stripped.to_string()
}

/// 入站过滤条件
#[derive(Debug, Clone, Default)]
pub struct IngressFilters {
    /// 非空时只接受这些发件人（归一化后比较）
    pub allowed_senders: Vec<String>,
    pub include_from_me: bool,
}

impl IngressFilters {
    pub fn accepts(&self, msg: &InboundMessage) -> bool {
        if msg.is_from_me && !self.include_from_me {
            return false;
        }
        if self.allowed_senders.is_empty() {
            return true;
        }
        let sender = normalize_sender(&msg.sender);
        self.allowed_senders
            .iter()
            .any(|allowed| normalize_sender(allowed) == sender)
    }
}

/// 入站渠道
#[async_trait]
pub trait Ingress: Send + Sync {
    fn name(&self) -> &str;

    /// 拉取游标之后的新条目
    async fn fetch_new(
        &self,
        cursor: Option<&str>,
        filters: &IngressFilters,
    ) -> Result<Vec<InboundMessage>, ChannelError>;

    async fn mark_processed(&self, id: &str) -> Result<(), ChannelError>;

    /// 最近一次 fetch 之后的游标
    fn latest_cursor(&self) -> Option<String>;
}

/// 出站渠道
#[async_trait]
pub trait Egress: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, recipient: &str, text: &str) -> Result<(), ChannelError>;

    /// 是否是我们刚发出的内容（回声抑制）
    fn was_recent_outbound(&self, sender: &str, text: &str) -> bool;

    fn mark_outbound(&self, recipient: &str, text: &str);

    /// 是否支持归档来源条目（提醒 / 备忘录 / 日历事件）
    fn supports_archive(&self) -> bool {
        false
    }

    async fn archive(&self, _item_id: &str) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported(self.name().to_string()))
    }
}

/// 出站路由：按渠道名找到 Egress，找不到时回落到默认渠道
#[derive(Clone)]
pub struct EgressRouter {
    egresses: HashMap<String, Arc<dyn Egress>>,
    default_channel: String,
}

impl EgressRouter {
    pub fn new(default_channel: impl Into<String>) -> Self {
        Self {
            egresses: HashMap::new(),
            default_channel: default_channel.into(),
        }
    }

    pub fn register(mut self, egress: Arc<dyn Egress>) -> Self {
        self.egresses.insert(egress.name().to_string(), egress);
        self
    }

    /// 精确查找
    pub fn get(&self, channel: &str) -> Option<Arc<dyn Egress>> {
        self.egresses.get(channel).cloned()
    }

    /// 回复用：渠道不存在时回落到默认渠道
    pub fn for_reply(&self, channel: &str) -> Result<Arc<dyn Egress>, ChannelError> {
        self.get(channel)
            .or_else(|| self.get(&self.default_channel))
            .ok_or_else(|| ChannelError::UnknownChannel(channel.to_string()))
    }

    /// 发送并登记出站记录
    pub async fn reply(&self, channel: &str, recipient: &str, text: &str) -> Result<(), ChannelError> {
        let egress = self.for_reply(channel)?;
        egress.mark_outbound(recipient, text);
        egress.send(recipient, text).await
    }

    pub fn channels(&self) -> impl Iterator<Item = &String> {
        self.egresses.keys()
    }
}
