//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient::complete：
//! 输入消息与选项（可绑定工具、可要求结构化输出），返回文本 / 结构化对象 / 工具调用请求。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{Message, ToolCall};

/// LLM 调用错误：Provider 错误可被 Driver 区分并直接上报，不做无限重试
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// 绑定给模型的工具描述（name / description / 参数 JSON Schema）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// 结构化输出要求：schema 名与 JSON Schema
#[derive(Debug, Clone)]
pub struct StructuredSchema {
    pub name: String,
    pub schema: serde_json::Value,
}

/// 单次调用选项
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub tools: Vec<ToolSpec>,
    pub structured: Option<StructuredSchema>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            tools: Vec::new(),
            structured: None,
            temperature: 0.7,
            max_tokens: None,
        }
    }
}

impl CompletionOptions {
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_structured(mut self, name: impl Into<String>, schema: serde_json::Value) -> Self {
        self.structured = Some(StructuredSchema {
            name: name.into(),
            schema,
        });
        self
    }
}

/// 调用结果；三个字段可同时为空（模型返回空内容）
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: Option<String>,
    pub structured: Option<serde_json::Value>,
    pub tool_calls: Vec<ToolCall>,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn structured(value: serde_json::Value) -> Self {
        Self {
            text: Some(value.to_string()),
            structured: Some(value),
            ..Self::default()
        }
    }

    /// 文本内容（无则为空串）
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 为任意客户端施加请求超时，超时转为 LlmError::Timeout
pub struct TimeoutLlmClient {
    inner: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl TimeoutLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, timeout_secs: u64) -> Self {
        Self {
            inner,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl LlmClient for TimeoutLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError> {
        match tokio::time::timeout(self.timeout, self.inner.complete(messages, options)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout.as_secs())),
        }
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient;

    #[async_trait]
    impl LlmClient for SlowClient {
        async fn complete(
            &self,
            _messages: &[Message],
            _options: &CompletionOptions,
        ) -> Result<LlmResponse, LlmError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(LlmResponse::text("late"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_client_converts_hang_to_timeout() {
        let client = TimeoutLlmClient::new(Arc::new(SlowClient), 2);
        let err = client
            .complete(&[Message::user("hi")], &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(2)));
    }
}
