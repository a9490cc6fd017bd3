//! 出站回声缓存：记录最近发出的 (收件人, 文本)，入站时据此识别自己的回声

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::normalize_sender;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct OutboundEchoCache {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<VecDeque<(String, String, Instant)>>,
}

impl OutboundEchoCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            capacity: DEFAULT_CAPACITY,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn key_text(text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    pub fn mark(&self, recipient: &str, text: &str) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let now = Instant::now();
        entries.retain(|(_, _, at)| now.duration_since(*at) < self.ttl);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back((normalize_sender(recipient), Self::key_text(text), now));
    }

    /// 同一对端、同样文本且在 TTL 内发出过
    pub fn contains(&self, sender: &str, text: &str) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        let now = Instant::now();
        let sender = normalize_sender(sender);
        let text = Self::key_text(text);
        entries
            .iter()
            .any(|(r, t, at)| now.duration_since(*at) < self.ttl && *r == sender && *t == text)
    }
}

impl Default for OutboundEchoCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}
