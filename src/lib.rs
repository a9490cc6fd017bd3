//! Hive - Rust 个人自动化守护进程
//!
//! 模块划分：
//! - **channels**: 渠道抽象（Ingress / Egress）、控制台与内存实现、回声抑制
//! - **command**: 指令解析（前缀、同义词、@工作区别名）
//! - **companion**: 主动陪伴循环、每日摘要与每周回顾
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **connector**: AI 后端连接器（CLI 子进程 / Mock）与并发上限
//! - **core**: 错误类型、子进程组管理、优雅关闭
//! - **daemon**: 组件装配与生命周期
//! - **executor**: 基于租约的持久化执行队列
//! - **observability**: tracing 初始化
//! - **orchestrator**: 审批状态机与执行流水线
//! - **poller**: 渠道轮询
//! - **scheduler**: 延时跟进
//! - **store**: SQLite 持久化（单连接、单锁）

pub mod channels;
pub mod command;
pub mod companion;
pub mod config;
pub mod connector;
pub mod core;
pub mod daemon;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod poller;
pub mod scheduler;
pub mod store;

pub use daemon::Daemon;
pub use orchestrator::{OrchestrationResult, Orchestrator, ResultKind};
