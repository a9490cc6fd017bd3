//! 优雅关闭
//!
//! 统一监听关闭信号（Ctrl+C / SIGTERM / 致命错误），并按注册顺序执行清理：
//! - 停止接收新消息（取消 token）
//! - 在超时内等待在途任务做完
//! - 关闭连接器（终止在途子进程）
//! - 关闭 SQLite 连接

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::connector::Connector;
use crate::core::HiveError;
use crate::store::Store;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 所有循环共享的取消 token
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(reason = ?reason, "shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> Result<(), HiveError>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序逐个执行清理，每个清理有独立超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行所有清理任务；返回成功完成的名称列表
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());
        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);
        let mut done = Vec::new();

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed", name);
                    done.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
        done
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接器清理：终止在途子进程
pub struct ConnectorCleanup {
    connector: Arc<dyn Connector>,
}

impl ConnectorCleanup {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ConnectorCleanup {
    async fn cleanup(&self) -> Result<(), HiveError> {
        self.connector.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Connector"
    }
}

/// SQLite 清理：关闭唯一的连接
pub struct StoreCleanup {
    store: Store,
}

impl StoreCleanup {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for StoreCleanup {
    async fn cleanup(&self) -> Result<(), HiveError> {
        self.store.call(|s| s.close()).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SQLite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::MockConnector;

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[tokio::test]
    async fn test_reason_is_broadcast() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown(ShutdownReason::FatalError("store gone".into()));
        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::FatalError("store gone".into()));
    }

    struct Slow;

    #[async_trait::async_trait]
    impl ShutdownCleanup for Slow {
        async fn cleanup(&self) -> Result<(), HiveError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_order_and_closes_store() {
        let store = Store::open_in_memory().unwrap();
        let mut coordinator = ShutdownCoordinator::new().with_timeout(1);
        coordinator.register(Slow);
        coordinator.register(ConnectorCleanup::new(Arc::new(MockConnector::new())));
        coordinator.register(StoreCleanup::new(store.clone()));

        let done = coordinator.run_cleanup().await;
        assert_eq!(done, vec!["Connector", "SQLite"]);
        assert!(store.is_closed());
    }
}
