//! 错误类型
//!
//! 分层：StoreError（持久化）、ChannelError（渠道收发）、SideEffectError（尽力而为的旁路副作用），
//! 以及汇总它们的 HiveError。连接器错误不在此列：按约定转成 "Error: ..." 文本返回。

use thiserror::Error;

/// 持久化层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Store is closed")]
    Closed,

    /// 行内容无法解析（如未知的状态字符串）
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 阻塞线程池上的存储任务未能完成（panic 或运行时关闭）
    #[error("Blocking store task failed: {0}")]
    Blocking(String),
}

/// 渠道（Ingress / Egress）错误
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Channel '{0}' not registered")]
    UnknownChannel(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Operation not supported by channel '{0}'")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 尽力而为的副作用失败（审计写入、清理、跟进安排、陪伴日志）
///
/// 调用方只记录日志，不向主流程传播。
#[derive(Error, Debug)]
pub enum SideEffectError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid source context: {0}")]
    InvalidContext(String),
}

/// 守护进程级错误
#[derive(Error, Debug)]
pub enum HiveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Connector unavailable: {0}")]
    ConnectorUnavailable(String),

    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Task join error: {0}")]
    Join(String),
}

impl From<config::ConfigError> for HiveError {
    fn from(e: config::ConfigError) -> Self {
        HiveError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for HiveError {
    fn from(e: tokio::task::JoinError) -> Self {
        HiveError::Join(e.to_string())
    }
}
