//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, deepseek_api_key, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{MockLlmClient, RecordedCall, ScriptedLlmClient};
pub use openai::{OpenAiClient, StructuredMode, TokenUsage};
pub use traits::{
    CompletionOptions, LlmClient, LlmError, LlmResponse, StructuredSchema, TimeoutLlmClient,
    ToolSpec,
};
