//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKBEE__*` 覆盖（双下划线表示嵌套，如 `TASKBEE__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub memory: MemorySection,
    pub approval: ApprovalSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 文件工具与 shell 的根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [llm] 段：后端选择、模型参数与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；实际选择还取决于是否有 API Key
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            temperature: default_temperature(),
            max_tokens: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [agent] 段：迭代 / 重试上限与截断长度
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试退避基数（毫秒），0 表示立即重试
    #[serde(default)]
    pub retry_backoff_ms: u64,
    /// 前序步骤结果在 prompt 中的截断长度
    #[serde(default = "default_step_output_chars")]
    pub step_output_chars: usize,
    #[serde(default = "default_tool_output_chars")]
    pub tool_output_chars: usize,
    #[serde(default = "default_planning_temperature")]
    pub planning_temperature: f32,
    #[serde(default = "default_reflection_temperature")]
    pub reflection_temperature: f32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_retries: default_max_retries(),
            retry_backoff_ms: 0,
            step_output_chars: default_step_output_chars(),
            tool_output_chars: default_tool_output_chars(),
            planning_temperature: default_planning_temperature(),
            reflection_temperature: default_reflection_temperature(),
        }
    }
}

fn default_max_iterations() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_output_chars() -> usize {
    500
}

fn default_tool_output_chars() -> usize {
    4000
}

fn default_planning_temperature() -> f32 {
    0.2
}

fn default_reflection_temperature() -> f32 {
    0.1
}

/// [memory] 段：滑动窗口、摘要阈值、存储位置
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// 未摘要消息数超过该值时触发后台摘要
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            summary_threshold: default_summary_threshold(),
            db_path: default_db_path(),
            sessions_dir: default_sessions_dir(),
        }
    }
}

fn default_window_size() -> usize {
    20
}

fn default_summary_threshold() -> usize {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/taskbee.db")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("data/sessions")
}

/// [approval] 段：审批等待超时（秒）；不设则一直等待
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ApprovalSection {
    pub timeout_secs: Option<u64>,
}

/// [tools] 段：工具超时、危险工具名单、Shell 白名单、web_fetch 域名
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 额外标记为危险的工具名（与工具自身的分类取并集）
    #[serde(default = "default_dangerous")]
    pub dangerous: Vec<String>,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            dangerous: default_dangerous(),
            shell: ShellSection::default(),
            search: SearchSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_dangerous() -> Vec<String> {
    vec!["shell".into(), "write_file".into()]
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    ["ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "cargo", "rustc"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// [tools.search] 段：web_fetch 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
pub struct SearchSection {
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_search_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    8000
}

fn default_allowed_domains() -> Vec<String> {
    [
        "en.wikipedia.org",
        "zh.wikipedia.org",
        "github.com",
        "raw.githubusercontent.com",
        "docs.rs",
        "crates.io",
        "doc.rust-lang.org",
        "stackoverflow.com",
        "developer.mozilla.org",
        "arxiv.org",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// 从 config 目录加载配置，环境变量 TASKBEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKBEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKBEE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("tools.dangerous")
            .with_list_parse_key("tools.shell.allowed_commands")
            .with_list_parse_key("tools.search.allowed_domains"),
    );

    builder.build()?.try_deserialize()
}
