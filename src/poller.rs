//! 渠道轮询：按间隔拉取 Ingress 新条目并交给编排器
//!
//! 游标持久化在 KV `cursor:<channel>`；只有整批都处理成功（无持久化错误）才推进游标，
//! 失败的批次下一轮重新拉取，由去重账本挡住已处理过的条目。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::channels::{normalize_sender, EgressRouter, InboundMessage, Ingress, IngressFilters};
use crate::core::{HiveError, StoreError};
use crate::orchestrator::Orchestrator;

pub fn cursor_key(channel: &str) -> String {
    format!("cursor:{channel}")
}

/// 一轮拉取的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub fetched: usize,
    pub echoes: usize,
    pub handled: usize,
    pub failed: usize,
}

pub struct ChannelPoller {
    ingress: Arc<dyn Ingress>,
    orchestrator: Arc<Orchestrator>,
    router: EgressRouter,
    filters: IngressFilters,
    interval: Duration,
}

impl ChannelPoller {
    pub fn new(
        ingress: Arc<dyn Ingress>,
        orchestrator: Arc<Orchestrator>,
        router: EgressRouter,
        filters: IngressFilters,
        interval: Duration,
    ) -> Self {
        Self {
            ingress,
            orchestrator,
            router,
            filters,
            interval,
        }
    }

    pub fn channel(&self) -> &str {
        self.ingress.name()
    }

    /// 拉取并处理一批
    ///
    /// 同一发件人的消息按到达顺序串行处理（保证 "task" 先于 "approve"），不同发件人之间并发。
    pub async fn poll_once(&self) -> Result<PollStats, HiveError> {
        let store = self.orchestrator.store();
        let key = cursor_key(self.channel());
        let cursor = {
            let key = key.clone();
            store.call(move |s| s.get_state(&key)).await?
        };
        let batch = self.ingress.fetch_new(cursor.as_deref(), &self.filters).await?;
        let mut stats = PollStats {
            fetched: batch.len(),
            ..PollStats::default()
        };

        let egress = self.router.get(self.channel());
        let mut by_sender: BTreeMap<String, Vec<InboundMessage>> = BTreeMap::new();
        for msg in batch {
            if egress
                .as_ref()
                .is_some_and(|e| e.was_recent_outbound(&msg.sender, &msg.text))
            {
                tracing::debug!(channel = %msg.channel, message_id = %msg.id, "skipping our own echo");
                stats.echoes += 1;
                if let Err(e) = self.ingress.mark_processed(&msg.id).await {
                    tracing::warn!(message_id = %msg.id, "mark_processed failed: {}", e);
                }
                continue;
            }
            by_sender.entry(normalize_sender(&msg.sender)).or_default().push(msg);
        }

        let mut tasks = JoinSet::new();
        for (_, messages) in by_sender {
            let orchestrator = Arc::clone(&self.orchestrator);
            let ingress = Arc::clone(&self.ingress);
            tasks.spawn(async move { dispatch_in_order(orchestrator, ingress, messages).await });
        }

        let mut store_failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((handled, Ok(()))) => stats.handled += handled,
                Ok((handled, Err(e))) => {
                    stats.handled += handled;
                    stats.failed += 1;
                    store_failed = true;
                    tracing::warn!(channel = %self.channel(), "message handling failed: {}", e);
                }
                Err(e) => {
                    stats.failed += 1;
                    store_failed = true;
                    tracing::error!(channel = %self.channel(), "dispatch task aborted: {}", e);
                }
            }
        }

        if !store_failed {
            if let Some(latest) = self.ingress.latest_cursor() {
                if cursor.as_deref() != Some(latest.as_str()) {
                    store.call(move |s| s.set_state(&key, &latest)).await?;
                }
            }
        }
        Ok(stats)
    }

    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        tracing::info!(channel = %self.channel(), every_secs = self.interval.as_secs(), "poller started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(stats) if stats.fetched > 0 => {
                        tracing::debug!(channel = %self.channel(), ?stats, "poll finished")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(channel = %self.channel(), "poll failed: {}", e),
                },
            }
        }
        tracing::info!(channel = %self.channel(), "poller stopped");
    }
}

/// 串行处理同一发件人的消息；遇到持久化错误即停止，剩余的留给下一轮
async fn dispatch_in_order(
    orchestrator: Arc<Orchestrator>,
    ingress: Arc<dyn Ingress>,
    messages: Vec<InboundMessage>,
) -> (usize, Result<(), StoreError>) {
    let mut handled = 0;
    for msg in messages {
        match orchestrator.handle_message(&msg).await {
            Ok(result) => {
                handled += 1;
                tracing::debug!(message_id = %msg.id, kind = ?result.kind, "message handled");
                if let Err(e) = ingress.mark_processed(&msg.id).await {
                    tracing::warn!(message_id = %msg.id, "mark_processed failed: {}", e);
                }
            }
            Err(e) => return (handled, Err(e)),
        }
    }
    (handled, Ok(()))
}
