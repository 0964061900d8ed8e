//! DeepSeek 预设：OpenAI 兼容端点，结构化输出只支持 json_object

use crate::config::LlmSection;
use crate::llm::{OpenAiClient, StructuredMode};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// DEEPSEEK_API_KEY 优先，provider 明确为 deepseek 时接受 OPENAI_API_KEY
pub fn deepseek_api_key(provider: &str) -> Option<String> {
    std::env::var("DEEPSEEK_API_KEY").ok().or_else(|| {
        provider
            .eq_ignore_ascii_case("deepseek")
            .then(|| std::env::var("OPENAI_API_KEY").ok())
            .flatten()
    })
}

/// 配置里的 model 若不是 deepseek-* 系列（例如沿用 OpenAI 的默认值），换成 deepseek-chat
fn deepseek_model(cfg: &LlmSection) -> String {
    std::env::var("DEEPSEEK_MODEL")
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| {
            if cfg.model.starts_with("deepseek-") {
                cfg.model.clone()
            } else {
                DEEPSEEK_CHAT.to_string()
            }
        })
}

pub fn create_deepseek_client(cfg: &LlmSection, api_key: &str) -> OpenAiClient {
    let base_url = cfg.base_url.as_deref().unwrap_or(DEEPSEEK_BASE_URL);
    OpenAiClient::new(Some(base_url), &deepseek_model(cfg), Some(api_key))
        .with_structured_mode(StructuredMode::JsonObject)
}
