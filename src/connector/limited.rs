//! 全局并发闸：所有渠道、陪伴循环与执行 worker 共享一个 Semaphore，限制同时在跑的 AI 调用数

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{Connector, ERROR_PREFIX};

pub struct LimitedConnector {
    inner: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
}

impl LimitedConnector {
    pub fn new(inner: Arc<dyn Connector>, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// 获取一次调用许可；信号量关闭（关停中）时返回 None
    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl Connector for LimitedConnector {
    async fn ensure_started(&self) -> Result<(), String> {
        self.inner.ensure_started().await
    }

    async fn get_or_create_thread(&self, key: &str) -> String {
        self.inner.get_or_create_thread(key).await
    }

    async fn reset_thread(&self, key: &str) -> String {
        self.inner.reset_thread(key).await
    }

    async fn run_turn(&self, thread_id: &str, prompt: &str) -> String {
        let Some(_permit) = self.acquire().await else {
            return format!("{ERROR_PREFIX}connector is shutting down");
        };
        self.inner.run_turn(thread_id, prompt).await
    }

    async fn run_turn_streaming(
        &self,
        thread_id: &str,
        prompt: &str,
        on_progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> String {
        let Some(_permit) = self.acquire().await else {
            return format!("{ERROR_PREFIX}connector is shutting down");
        };
        self.inner.run_turn_streaming(thread_id, prompt, on_progress).await
    }

    async fn shutdown(&self) {
        self.permits.close();
        self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    /// 记录并发峰值的后端
    struct PeakConnector {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Connector for PeakConnector {
        async fn ensure_started(&self) -> Result<(), String> {
            Ok(())
        }
        async fn get_or_create_thread(&self, key: &str) -> String {
            key.to_string()
        }
        async fn reset_thread(&self, key: &str) -> String {
            key.to_string()
        }
        async fn run_turn(&self, _thread_id: &str, _prompt: &str) -> String {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            "ok".into()
        }
        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_bounds_concurrency() {
        let backend = Arc::new(PeakConnector {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let limited = Arc::new(LimitedConnector::new(backend.clone(), 2));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let limited = Arc::clone(&limited);
                tokio::spawn(async move { limited.run_turn(&i.to_string(), "x").await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap(), "ok");
        }
        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_turns() {
        let limited = LimitedConnector::new(Arc::new(crate::connector::MockConnector::new()), 1);
        limited.shutdown().await;
        assert!(limited.run_turn("t", "hello").await.starts_with(ERROR_PREFIX));
    }
}
