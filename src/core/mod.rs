//! 核心层：错误类型、回合状态机、组件构建器、会话管理

pub mod builder;
pub mod error;
pub mod session_manager;
pub mod state;

pub use builder::{create_agent_builder, create_llm_from_config, AgentBuilder};
pub use error::AgentError;
pub use session_manager::{ChatResponse, SessionManager};
pub use state::{transition, PhaseEvent, TurnPhase};
