//! 指令解析：纯文本 -> ParsedCommand
//!
//! 确定性、无 I/O，任何输入都不会报错。优先级：
//! 固定关键字 > approve/deny > 系统指令自然语言同义词 > `prefix:` 形式 > 默认 Chat。
//! 开头的 `@alias` 在任何分支下都会被剥离到 workspace 字段。

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// 指令类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Chat,
    Idea,
    Plan,
    Task,
    Project,
    System,
    History,
    Status,
    Help,
    Health,
    Usage,
    Logs,
    ClearContext,
    Mute,
    Unmute,
    Approve,
    Deny,
    DenyAll,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Chat => "chat",
            CommandKind::Idea => "idea",
            CommandKind::Plan => "plan",
            CommandKind::Task => "task",
            CommandKind::Project => "project",
            CommandKind::System => "system",
            CommandKind::History => "history",
            CommandKind::Status => "status",
            CommandKind::Help => "help",
            CommandKind::Health => "health",
            CommandKind::Usage => "usage",
            CommandKind::Logs => "logs",
            CommandKind::ClearContext => "clear_context",
            CommandKind::Mute => "mute",
            CommandKind::Unmute => "unmute",
            CommandKind::Approve => "approve",
            CommandKind::Deny => "deny",
            CommandKind::DenyAll => "deny_all",
        }
    }

    /// 会改动用户环境、需要审批的指令
    pub fn is_mutating(&self) -> bool {
        matches!(self, CommandKind::Task | CommandKind::Project)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解析结果（不落库）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandKind,
    /// 去掉关键字 / 前缀后的正文；System 指令为规范化后的子命令（如 `team load ops`）
    pub payload: String,
    pub workspace: Option<String>,
}

impl ParsedCommand {
    fn new(kind: CommandKind, payload: impl Into<String>, workspace: Option<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            workspace,
        }
    }
}

const CLEAR_SYNONYMS: &[&str] = &[
    "clear",
    "reset",
    "new",
    "clear context",
    "reset context",
    "new chat",
    "/clear",
    "/reset",
    "/new",
];

const DENY_ALL_SYNONYMS: &[&str] = &["deny all", "deny-all", "reject all", "cancel all"];

const TEAM_LIST: &[&str] = &["team list", "list teams"];
const TEAM_CURRENT: &[&str] = &["team current", "current team", "which team"];
const TEAM_UNLOAD: &[&str] = &["team unload", "unload team"];

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static command pattern is valid"))
}

fn alias_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^@([A-Za-z0-9_][A-Za-z0-9_.-]*)(?:\s+|$)")
}

fn logs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)^logs(?:\s+(\d+))?$")
}

fn resolve_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)^(approve|deny)(?:\s+(\S+))?$")
}

fn team_load_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?i)^(?:team\s+load|load\s+team)\s+(\S.*)$")
}

fn prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"(?is)^(idea|plan|task|project|system|history)\s*:\s*(.*)$")
}

/// 小写 + 折叠空白，用于关键字比较
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// 剥离开头的 `@alias`
fn split_alias(raw: &str) -> (Option<String>, &str) {
    let trimmed = raw.trim();
    match alias_re().captures(trimmed) {
        Some(caps) => {
            let alias = caps.get(1).map(|m| m.as_str().to_string());
            let rest = &trimmed[caps.get(0).map_or(0, |m| m.end())..];
            (alias, rest.trim())
        }
        None => (None, trimmed),
    }
}

/// 解析一条原始文本
pub fn parse(raw: &str) -> ParsedCommand {
    let (workspace, body) = split_alias(raw);
    let lowered = normalize(body);

    // (1) 固定关键字
    let fixed = match lowered.as_str() {
        "status" => Some(CommandKind::Status),
        "help" => Some(CommandKind::Help),
        "health" => Some(CommandKind::Health),
        "usage" => Some(CommandKind::Usage),
        "mute" => Some(CommandKind::Mute),
        "unmute" => Some(CommandKind::Unmute),
        s if CLEAR_SYNONYMS.contains(&s) => Some(CommandKind::ClearContext),
        _ => None,
    };
    if let Some(kind) = fixed {
        return ParsedCommand::new(kind, "", workspace);
    }
    if let Some(caps) = logs_re().captures(&lowered) {
        let n = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        return ParsedCommand::new(CommandKind::Logs, n, workspace);
    }

    // (2) 审批
    if DENY_ALL_SYNONYMS.contains(&lowered.as_str()) {
        return ParsedCommand::new(CommandKind::DenyAll, "", workspace);
    }
    if let Some(caps) = resolve_re().captures(body) {
        let kind = if caps[1].eq_ignore_ascii_case("approve") {
            CommandKind::Approve
        } else {
            CommandKind::Deny
        };
        let id = caps.get(2).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        return ParsedCommand::new(kind, id, workspace);
    }

    // (3) 系统指令同义词
    if TEAM_LIST.contains(&lowered.as_str()) {
        return ParsedCommand::new(CommandKind::System, "team list", workspace);
    }
    if TEAM_CURRENT.contains(&lowered.as_str()) {
        return ParsedCommand::new(CommandKind::System, "team current", workspace);
    }
    if TEAM_UNLOAD.contains(&lowered.as_str()) {
        return ParsedCommand::new(CommandKind::System, "team unload", workspace);
    }
    if let Some(caps) = team_load_re().captures(body) {
        let name = caps[1].trim();
        return ParsedCommand::new(CommandKind::System, format!("team load {name}"), workspace);
    }

    // (4) prefix: 形式
    if let Some(caps) = prefix_re().captures(body) {
        let kind = match caps[1].to_lowercase().as_str() {
            "idea" => CommandKind::Idea,
            "plan" => CommandKind::Plan,
            "task" => CommandKind::Task,
            "project" => CommandKind::Project,
            "system" => CommandKind::System,
            _ => CommandKind::History,
        };
        let payload = caps[2].trim();
        let payload = if kind == CommandKind::System {
            normalize(payload)
        } else {
            payload.to_string()
        };
        return ParsedCommand::new(kind, payload, workspace);
    }

    // (5) 默认 Chat
    ParsedCommand::new(CommandKind::Chat, body, workspace)
}
