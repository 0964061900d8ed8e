//! taskbee - Rust 任务型智能体编排器
//!
//! 模块划分：
//! - **agent**: Planner、StepExecutor、Reflector、审批闸门与回合驱动（agent / chat 两种模式）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、回合状态机、组件构建器、会话管理
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）
//! - **memory**: 消息模型、Memory Store（SQLite / 内存）、滑动窗口、摘要、会话快照
//! - **observability**: 日志初始化
//! - **tools**: 工具 trait、注册表、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::agent::{SessionMode, TurnDriver};
pub use crate::core::{AgentError, ChatResponse, SessionManager};
