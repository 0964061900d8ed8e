//! 消息模型
//!
//! 会话日志中的单条消息：角色、内容、可选的工具调用描述与工具结果关联 id。
//! 写入 Memory Store 后不可变，`summarized` 只能从 false 变为 true。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致，另加 tool_result）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::ToolResult => "tool_result",
        }
    }

    /// 从存储中的字符串还原；未知值按 system 处理
    pub fn parse(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool_result" | "tool" => Role::ToolResult,
            _ => Role::System,
        }
    }
}

/// 模型请求的一次工具调用（也作为 assistant 消息上的描述符持久化）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// 存储分配的自增 id；尚未写入时为 None
    #[serde(default)]
    pub id: Option<i64>,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub summarized: bool,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            created_at: Utc::now(),
            summarized: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// 带工具调用描述符的 assistant 消息
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// 工具结果消息，tool_call_id 关联到触发它的调用
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::ToolResult, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 取最后一条 user 消息的内容
pub fn last_user_content(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}

/// 按字符截断，超出时追加省略标记
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}...[truncated]", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_through_str() {
        for role in [Role::User, Role::Assistant, Role::System, Role::ToolResult] {
            assert_eq!(Role::parse(role.as_str()), role);
        }
        assert_eq!(Role::parse("tool"), Role::ToolResult);
    }

    #[test]
    fn test_last_user_content() {
        let msgs = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
            Message::tool_result("c1", "out"),
        ];
        assert_eq!(last_user_content(&msgs), Some("second"));
        assert_eq!(last_user_content(&[Message::system("s")]), None);
    }

    #[test]
    fn test_truncate_chars_handles_multibyte() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        let t = truncate_chars("你好世界你好", 2);
        assert!(t.starts_with("你好"));
        assert!(t.ends_with("[truncated]"));
    }
}
