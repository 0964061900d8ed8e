//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 的 byot（bring your own types）接口调用任意 OpenAI 兼容端点（可配置 base_url），
//! 请求体直接用 JSON 组装，以便同时支持 tools、response_format 与 tool 角色消息。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{CompletionOptions, LlmClient, LlmError, LlmResponse};
use crate::memory::{Message, Role, ToolCall};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// 结构化输出模式：json_schema（OpenAI）或 json_object（DeepSeek 等仅支持 JSON 模式的端点）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredMode {
    JsonSchema,
    JsonObject,
}

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    structured_mode: StructuredMode,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            structured_mode: StructuredMode::JsonSchema,
            usage: TokenUsage::new(),
        }
    }

    pub fn with_structured_mode(mut self, mode: StructuredMode) -> Self {
        self.structured_mode = mode;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, messages: &[Message], options: &CompletionOptions) -> Value {
        let mut wire = to_wire_messages(messages);
        let mut body = json!({
            "model": self.model,
            "temperature": options.temperature,
        });

        if let Some(max) = options.max_tokens {
            body["max_tokens"] = json!(max);
        }

        if !options.tools.is_empty() {
            let tools: Vec<Value> = options
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        if let Some(ref structured) = options.structured {
            match self.structured_mode {
                StructuredMode::JsonSchema => {
                    body["response_format"] = json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": structured.name,
                            "schema": structured.schema,
                            "strict": false,
                        }
                    });
                }
                StructuredMode::JsonObject => {
                    // JSON 模式要求提示中出现 "json"，schema 以说明形式附在最前
                    wire.insert(
                        0,
                        json!({
                            "role": "system",
                            "content": format!(
                                "Respond with a single json object matching this JSON Schema:\n{}",
                                structured.schema
                            ),
                        }),
                    );
                    body["response_format"] = json!({ "type": "json_object" });
                }
            }
        }

        body["messages"] = Value::Array(wire);
        body
    }
}

/// 将内部消息转为 OpenAI wire 格式。
///
/// 窗口截断可能留下孤立的 tool_result 或缺少结果的 tool_calls，二者都会被 API 拒绝：
/// 只保留结果齐全的调用，孤立的结果降级为普通 user 文本。
pub fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    let result_ids: HashSet<&str> = messages
        .iter()
        .filter(|m| m.role == Role::ToolResult)
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();

    let mut emitted_calls: HashSet<String> = HashSet::new();
    let mut wire = Vec::with_capacity(messages.len());

    for m in messages {
        match m.role {
            Role::System => wire.push(json!({ "role": "system", "content": m.content })),
            Role::User => wire.push(json!({ "role": "user", "content": m.content })),
            Role::Assistant => {
                let calls: Vec<&ToolCall> = m
                    .tool_calls
                    .iter()
                    .filter(|c| result_ids.contains(c.id.as_str()))
                    .collect();
                if calls.is_empty() {
                    let content = if m.content.is_empty() && m.has_tool_calls() {
                        let names: Vec<&str> = m.tool_calls.iter().map(|c| c.name.as_str()).collect();
                        format!("(requested tools: {})", names.join(", "))
                    } else {
                        m.content.clone()
                    };
                    wire.push(json!({ "role": "assistant", "content": content }));
                } else {
                    let tool_calls: Vec<Value> = calls
                        .iter()
                        .map(|c| {
                            emitted_calls.insert(c.id.clone());
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": c.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    wire.push(json!({
                        "role": "assistant",
                        "content": if m.content.is_empty() { Value::Null } else { json!(m.content) },
                        "tool_calls": tool_calls,
                    }));
                }
            }
            Role::ToolResult => match m.tool_call_id.as_deref() {
                Some(id) if emitted_calls.contains(id) => wire.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": m.content,
                })),
                _ => wire.push(json!({
                    "role": "user",
                    "content": format!("Tool result: {}", m.content),
                })),
            },
        }
    }
    wire
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<LlmResponse, LlmError> {
        let request = self.build_request(messages, options);
        tracing::debug!(model = %self.model, tools = options.tools.len(), "llm request");

        let response: ChatResponse = self
            .client
            .chat()
            .create_byot(request)
            .await
            .map_err(|e| LlmError::Provider(e.to_string()))?;

        if let Some(usage) = &response.usage {
            self.usage.add(usage.prompt_tokens, usage.completion_tokens);
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("no choices in response".to_string()))?;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                // 参数不是合法 JSON 时保留原文，交给工具自行报错
                arguments: serde_json::from_str(&c.function.arguments)
                    .unwrap_or(Value::String(c.function.arguments)),
            })
            .collect();

        let structured = if options.structured.is_some() {
            message
                .content
                .as_deref()
                .and_then(|c| serde_json::from_str::<Value>(c.trim()).ok())
        } else {
            None
        };

        Ok(LlmResponse {
            text: message.content,
            structured,
            tool_calls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolSpec;

    #[test]
    fn test_wire_messages_keep_complete_tool_exchange() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "calculator".into(),
            arguments: json!({"expression": "1+1"}),
        };
        let msgs = vec![
            Message::user("what is 1+1"),
            Message::assistant_with_tool_calls("", vec![call]),
            Message::tool_result("call_1", "2"),
        ];
        let wire = to_wire_messages(&msgs);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(wire[2]["role"], "tool");
    }

    #[test]
    fn test_wire_messages_degrade_orphans() {
        let msgs = vec![
            Message::tool_result("gone", "stale output"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "call_9".into(),
                    name: "shell".into(),
                    arguments: json!({}),
                }],
            ),
        ];
        let wire = to_wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "user");
        assert!(wire[1].get("tool_calls").is_none());
        assert!(wire[1]["content"].as_str().unwrap().contains("shell"));
    }

    #[test]
    fn test_build_request_json_object_mode_injects_schema() {
        let client = OpenAiClient::new(Some("http://localhost"), "m", Some("k"))
            .with_structured_mode(StructuredMode::JsonObject);
        let options = CompletionOptions::default()
            .with_tools(vec![ToolSpec {
                name: "calculator".into(),
                description: "math".into(),
                parameters: json!({"type": "object"}),
            }])
            .with_structured("plan", json!({"type": "object"}));
        let body = client.build_request(&[Message::user("hi")], &options);
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["name"], "calculator");
    }
}
