//! 守护进程：装配所有组件，托管各循环的生命周期
//!
//! 一个 tokio 运行时里跑：N 个渠道轮询、陪伴循环与摘要子循环、执行队列 worker、维护循环。
//! 关闭顺序固定：取消 token 停止接收 -> 超时内等待在途任务 -> 关闭连接器 -> 关闭存储。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::{EgressRouter, Ingress, IngressFilters};
use crate::companion::{CalendarSource, CompanionLoop, ReminderSource};
use crate::config::AppConfig;
use crate::connector::{Connector, LimitedConnector};
use crate::core::shutdown::{ConnectorCleanup, StoreCleanup};
use crate::core::{HiveError, ShutdownCoordinator};
use crate::executor::RunExecutor;
use crate::orchestrator::{Orchestrator, RunPipeline};
use crate::poller::ChannelPoller;
use crate::store::Store;

/// 审批过期扫描间隔
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub struct Daemon {
    config: AppConfig,
    store: Store,
    connector: Arc<dyn Connector>,
    router: EgressRouter,
    orchestrator: Arc<Orchestrator>,
    executor: Option<Arc<RunExecutor>>,
    companion: Option<CompanionLoop>,
    ingresses: Vec<Arc<dyn Ingress>>,
}

impl Daemon {
    /// 装配；存储打不开是致命错误
    ///
    /// 连接器外面会包一层并发上限（orchestrator.max_concurrent_turns），所有渠道共享。
    pub fn init(config: AppConfig, connector: Arc<dyn Connector>, router: EgressRouter) -> Result<Self, HiveError> {
        let store = Store::open(config.app.resolved_db_path())?;
        let connector: Arc<dyn Connector> = Arc::new(LimitedConnector::new(
            connector,
            config.orchestrator.max_concurrent_turns,
        ));

        let pipeline = Arc::new(RunPipeline::new(
            store.clone(),
            connector.clone(),
            router.clone(),
            &config.orchestrator,
        ));
        let mut orchestrator = Orchestrator::new(
            store.clone(),
            connector.clone(),
            router.clone(),
            pipeline.clone(),
            config.orchestrator.clone(),
        );
        let executor = if config.orchestrator.durable_queue {
            let executor = Arc::new(RunExecutor::new(
                store.clone(),
                pipeline,
                router.clone(),
                &config.executor,
            ));
            orchestrator = orchestrator.with_executor(executor.clone());
            Some(executor)
        } else {
            None
        };

        let companion = config.companion.enabled.then(|| {
            CompanionLoop::new(
                store.clone(),
                connector.clone(),
                router.clone(),
                config.companion.clone(),
                &config.channels.reply_channel,
            )
        });

        tracing::info!(
            durable_queue = executor.is_some(),
            companion = companion.is_some(),
            "daemon initialized"
        );
        Ok(Self {
            config,
            store,
            connector,
            router,
            orchestrator: Arc::new(orchestrator),
            executor,
            companion,
            ingresses: Vec::new(),
        })
    }

    pub fn with_ingress(mut self, ingress: Arc<dyn Ingress>) -> Self {
        self.ingresses.push(ingress);
        self
    }

    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarSource>) -> Self {
        self.companion = self.companion.map(|c| c.with_calendar(calendar));
        self
    }

    pub fn with_reminders(mut self, reminders: Arc<dyn ReminderSource>) -> Self {
        self.companion = self.companion.map(|c| c.with_reminders(reminders));
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// 运行直到 token 被取消，然后按顺序关闭
    pub async fn run(self, token: CancellationToken) -> Result<(), HiveError> {
        if let Err(e) = self.connector.ensure_started().await {
            tracing::warn!("connector not ready at startup: {}", e);
        }

        let filters = IngressFilters {
            allowed_senders: self.config.channels.allowed_senders.clone(),
            include_from_me: self.config.channels.include_from_me,
        };
        let poll_every = Duration::from_secs(self.config.channels.poll_interval_secs.max(1));

        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        for ingress in &self.ingresses {
            let poller = Arc::new(ChannelPoller::new(
                ingress.clone(),
                self.orchestrator.clone(),
                self.router.clone(),
                filters.clone(),
                poll_every,
            ));
            loops.push(tokio::spawn(poller.run(token.clone())));
        }

        if let Some(companion) = self.companion {
            let companion = Arc::new(companion);
            loops.push(tokio::spawn(companion.clone().run(token.clone())));
            loops.push(tokio::spawn(companion.run_digest(token.clone())));
        }

        loops.push(tokio::spawn(maintenance_loop(self.orchestrator.clone(), token.clone())));

        let workers = match &self.executor {
            Some(executor) => executor.spawn_workers(self.config.executor.workers, token.clone()),
            None => Vec::new(),
        };
        tracing::info!(
            channels = self.ingresses.len(),
            workers = workers.len(),
            "daemon running"
        );

        token.cancelled().await;
        tracing::info!("stopping intake, draining in-flight work");

        let drain = Duration::from_secs(self.config.executor.drain_timeout_secs);
        drain_with_timeout("executor workers", workers, drain).await;
        drain_with_timeout("loops", loops, drain).await;

        let mut coordinator = ShutdownCoordinator::new();
        coordinator.register(ConnectorCleanup::new(self.connector.clone()));
        coordinator.register(StoreCleanup::new(self.store.clone()));
        coordinator.run_cleanup().await;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// 等待任务结束；超时后中止剩余任务（被中止的任务租约会在下次启动时回收）
async fn drain_with_timeout(what: &str, handles: Vec<JoinHandle<()>>, timeout: Duration) {
    if handles.is_empty() {
        return;
    }
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    match tokio::time::timeout(timeout, join_all(handles)).await {
        Ok(results) => {
            for result in results {
                if let Err(e) = result {
                    tracing::warn!(what, "task ended abnormally: {}", e);
                }
            }
        }
        Err(_) => {
            tracing::warn!(what, timeout_secs = timeout.as_secs(), "drain timed out, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// 维护循环：过期审批扫描
async fn maintenance_loop(orchestrator: Arc<Orchestrator>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match orchestrator.expire_stale_approvals(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(expired = n, "expired stale approvals"),
                Err(e) => tracing::warn!("approval expiry sweep failed: {}", e),
            },
        }
    }
}
