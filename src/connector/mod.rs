//! AI 后端连接器抽象
//!
//! 所有后端（通用 CLI 子进程 / Mock）实现 Connector：按会话线程跑一轮对话，返回文本。
//! 约定：run_turn 永不失败，后端错误一律转成以 "Error: " 开头的文本。

pub mod cli;
pub mod limited;
pub mod mock;

use async_trait::async_trait;

pub use cli::CliConnector;
pub use limited::LimitedConnector;
pub use mock::MockConnector;

/// 后端出错时返回文本的统一前缀
pub const ERROR_PREFIX: &str = "Error: ";

/// 连接器 trait
#[async_trait]
pub trait Connector: Send + Sync {
    /// 确认后端可用（健康检查 / 启动时调用）
    async fn ensure_started(&self) -> Result<(), String>;

    /// 获取或创建 key（通常是发件人）对应的线程 ID
    async fn get_or_create_thread(&self, key: &str) -> String;

    /// 丢弃旧线程，返回新线程 ID
    async fn reset_thread(&self, key: &str) -> String;

    /// 跑一轮；失败时返回 "Error: ..." 文本
    async fn run_turn(&self, thread_id: &str, prompt: &str) -> String;

    /// 流式版本：on_progress 接收中间输出；默认退化为非流式
    async fn run_turn_streaming(
        &self,
        thread_id: &str,
        prompt: &str,
        on_progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> String {
        let text = self.run_turn(thread_id, prompt).await;
        on_progress(&text);
        text
    }

    /// 终止在途调用，释放资源
    async fn shutdown(&self);
}

/// 提示词模式：写在提示词首行，后端据此切换角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    Chat,
    Planner,
    Executor,
    Verifier,
    Companion,
    Digest,
}

impl TurnMode {
    pub fn marker(&self) -> &'static str {
        match self {
            TurnMode::Chat => "[mode: chat]",
            TurnMode::Planner => "[mode: planner]",
            TurnMode::Executor => "[mode: executor]",
            TurnMode::Verifier => "[mode: verifier]",
            TurnMode::Companion => "[mode: companion]",
            TurnMode::Digest => "[mode: digest]",
        }
    }

    /// 从提示词首行识别模式；无标记视为 Chat
    pub fn detect(prompt: &str) -> TurnMode {
        let first = prompt.lines().next().unwrap_or("").trim();
        [
            TurnMode::Planner,
            TurnMode::Executor,
            TurnMode::Verifier,
            TurnMode::Companion,
            TurnMode::Digest,
        ]
        .into_iter()
        .find(|mode| first == mode.marker())
        .unwrap_or(TurnMode::Chat)
    }
}

/// 是否是连接器错误文本
pub fn is_error_text(text: &str) -> bool {
    text.trim_start().starts_with(ERROR_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_detection() {
        assert_eq!(TurnMode::detect("[mode: planner]\nplan it"), TurnMode::Planner);
        assert_eq!(TurnMode::detect("[mode: verifier]"), TurnMode::Verifier);
        assert_eq!(TurnMode::detect("hello"), TurnMode::Chat);
        assert_eq!(TurnMode::detect(""), TurnMode::Chat);
    }

    #[test]
    fn test_error_text() {
        assert!(is_error_text("Error: backend crashed"));
        assert!(!is_error_text("All good"));
    }
}
