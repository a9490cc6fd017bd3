//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__EXECUTOR__WORKERS=4`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub companion: CompanionSection,
    #[serde(default)]
    pub connector: ConnectorSection,
    #[serde(default)]
    pub channels: ChannelsSection,
}

/// [app] 段：应用名、数据目录、数据库路径
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 数据目录，未设置时用 ./data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// SQLite 文件路径；未设置时为 data_dir/hive.db
    pub db_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
            db_path: None,
        }
    }
}

impl AppSection {
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("hive.db"))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// [orchestrator] 段：审批策略、工作区白名单、团队
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 若设置，普通对话必须以此前缀开头，否则忽略（如 "hive"）
    pub required_prefix: Option<String>,
    /// 审批有效期（秒）
    #[serde(default = "default_approval_ttl_secs")]
    pub approval_ttl_secs: u64,
    /// 执行后是否跑 verifier 模式
    #[serde(default = "default_true")]
    pub verifier_enabled: bool,
    /// true: 批准后进入持久化队列（RunExecutor）；false: 直接内联执行
    #[serde(default = "default_true")]
    pub durable_queue: bool,
    /// 未指定 @alias 时的默认工作区
    #[serde(default = "default_workspace")]
    pub default_workspace: PathBuf,
    /// 工作区别名：alias -> 路径
    #[serde(default)]
    pub workspaces: HashMap<String, PathBuf>,
    /// 允许执行变更操作的根目录
    #[serde(default)]
    pub allowed_workspaces: Vec<PathBuf>,
    /// 执行完成后的跟进延迟（秒）；0 表示不安排跟进
    #[serde(default = "default_followup_delay_secs")]
    pub followup_delay_secs: u64,
    /// 全局并发 AI 调用上限
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,
    /// 团队：名称 -> 提示词前言
    #[serde(default)]
    pub teams: HashMap<String, String>,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            required_prefix: None,
            approval_ttl_secs: default_approval_ttl_secs(),
            verifier_enabled: true,
            durable_queue: true,
            default_workspace: default_workspace(),
            workspaces: HashMap::new(),
            allowed_workspaces: Vec::new(),
            followup_delay_secs: default_followup_delay_secs(),
            max_concurrent_turns: default_max_concurrent_turns(),
            teams: HashMap::new(),
        }
    }
}

fn default_approval_ttl_secs() -> u64 {
    15 * 60
}

fn default_true() -> bool {
    true
}

fn default_workspace() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_followup_delay_secs() -> u64 {
    24 * 3600
}

fn default_max_concurrent_turns() -> usize {
    3
}

/// [executor] 段：持久化队列 worker 参数
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 租约时长（秒），续约间隔为 lease_secs / 3
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// 队列为空时的休眠间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 过期租约回收扫描的最小间隔（秒）
    #[serde(default = "default_recover_interval_secs")]
    pub recover_interval_secs: u64,
    /// 关闭时等待在途任务的超时（秒）
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lease_secs: default_lease_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            recover_interval_secs: default_recover_interval_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_lease_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_recover_interval_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    20
}

/// [companion] 段：主动陪伴循环的节奏与闸门
#[derive(Debug, Clone, Deserialize)]
pub struct CompanionSection {
    #[serde(default)]
    pub enabled: bool,
    /// 主动消息的接收人
    pub recipient: Option<String>,
    /// 发送所用渠道；未设置时用 channels.reply_channel
    pub channel: Option<String>,
    #[serde(default = "default_companion_poll_secs")]
    pub poll_interval_secs: u64,
    /// 免打扰开始时间 HH:MM
    pub quiet_start: Option<String>,
    /// 免打扰结束时间 HH:MM
    pub quiet_end: Option<String>,
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,
    /// 审批挂起超过该分钟数视为「陈旧」
    #[serde(default = "default_stale_approval_mins")]
    pub stale_approval_mins: i64,
    #[serde(default = "default_calendar_lookahead_mins")]
    pub calendar_lookahead_mins: i64,
    /// 仅关注该提醒列表的过期提醒
    pub reminder_list: Option<String>,
    /// 外部收件箱文件（Markdown 任务列表）
    pub inbox_file: Option<PathBuf>,
    /// 每次发送追加一行的审计日志
    pub audit_log: Option<PathBuf>,
    /// 每日摘要时间 HH:MM
    pub digest_time: Option<String>,
    /// 周回顾：星期几（mon..sun）
    pub weekly_review_day: Option<String>,
    /// 周回顾时间 HH:MM
    pub weekly_review_time: Option<String>,
}

impl Default for CompanionSection {
    fn default() -> Self {
        Self {
            enabled: false,
            recipient: None,
            channel: None,
            poll_interval_secs: default_companion_poll_secs(),
            quiet_start: None,
            quiet_end: None,
            max_per_hour: default_max_per_hour(),
            stale_approval_mins: default_stale_approval_mins(),
            calendar_lookahead_mins: default_calendar_lookahead_mins(),
            reminder_list: None,
            inbox_file: None,
            audit_log: None,
            digest_time: None,
            weekly_review_day: None,
            weekly_review_time: None,
        }
    }
}

fn default_companion_poll_secs() -> u64 {
    300
}

fn default_max_per_hour() -> u32 {
    2
}

fn default_stale_approval_mins() -> i64 {
    60
}

fn default_calendar_lookahead_mins() -> i64 {
    30
}

/// [connector] 段：AI 后端子进程
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorSection {
    /// 后端命令；提示词经 stdin 传入
    #[serde(default = "default_connector_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 单轮超时（秒）
    #[serde(default = "default_turn_timeout_secs")]
    pub timeout_secs: u64,
    /// SIGTERM 后等待多久升级为 SIGKILL（秒）
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

impl Default for ConnectorSection {
    fn default() -> Self {
        Self {
            command: default_connector_command(),
            args: Vec::new(),
            timeout_secs: default_turn_timeout_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

fn default_connector_command() -> String {
    "claude".to_string()
}

fn default_turn_timeout_secs() -> u64 {
    600
}

fn default_kill_grace_secs() -> u64 {
    5
}

/// [channels] 段：轮询节奏与发件人过滤
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsSection {
    #[serde(default = "default_channel_poll_secs")]
    pub poll_interval_secs: u64,
    /// 非空时仅处理这些发件人
    #[serde(default)]
    pub allowed_senders: Vec<String>,
    /// 是否处理「自己发出」的消息（自聊天场景）
    #[serde(default)]
    pub include_from_me: bool,
    /// 回复默认渠道
    #[serde(default = "default_reply_channel")]
    pub reply_channel: String,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_channel_poll_secs(),
            allowed_senders: Vec::new(),
            include_from_me: false,
            reply_channel: default_reply_channel(),
        }
    }
}

fn default_channel_poll_secs() -> u64 {
    5
}

fn default_reply_channel() -> String {
    "console".to_string()
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 则追加该文件（可覆盖前面的键）；显式指定的文件不存在时报错
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if !path.exists() {
            return Err(config::ConfigError::Message(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
