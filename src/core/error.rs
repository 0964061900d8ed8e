//! Agent 错误类型
//!
//! 组件边界处把内部错误转为结构化结果（失败的 StepResult / Reflection）；
//! 只有回合首次调用时 Memory Store 或 LLM 的致命错误会以 AgentError 的形式返回给调用方。

use thiserror::Error;

use crate::llm::LlmError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 回合内没有用户消息，Planner 无法工作
    #[error("No user message in turn")]
    NoUserInput,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// 同一会话已有回合在执行（Driver 不可重入）
    #[error("Session {0} is busy with another turn")]
    SessionBusy(String),

    /// 会话停在待审批状态，需先 resume
    #[error("Session {0} has a pending approval; resume it first")]
    PendingApproval(String),

    #[error("Approval gate unavailable: {0}")]
    ApprovalUnavailable(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}
