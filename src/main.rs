//! Hive - Rust 个人自动化守护进程
//!
//! 入口：初始化日志、加载配置、装配守护进程，并运行到收到关闭信号。
//! 用法：`hive [config.toml]`；未接入外部桥接时通过控制台（stdin/stdout）交互。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::channels::{ConsoleEgress, ConsoleIngress, EgressRouter};
use hive::config::load_config;
use hive::connector::CliConnector;
use hive::core::ShutdownManager;
use hive::{observability, Daemon};

/// 控制台会话的发件人
const CONSOLE_SENDER: &str = "console";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let connector = Arc::new(CliConnector::new(&config.connector));
    let router = EgressRouter::new(config.channels.reply_channel.clone()).register(Arc::new(ConsoleEgress::new()));
    let console = Arc::new(ConsoleIngress::spawn(CONSOLE_SENDER, shutdown.token()));

    let daemon = Daemon::init(config, connector, router)
        .context("Failed to initialize daemon")?
        .with_ingress(console);

    daemon.run(shutdown.token()).await.context("Daemon run failed")?;
    Ok(())
}
