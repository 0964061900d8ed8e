//! Memory Store 抽象
//!
//! 每个会话一条只追加的消息日志，外加至多一条滚动摘要（upsert）。
//! 已标记 summarized 的消息不会被取消标记；实现必须可在多个会话间并发使用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::memory::Message;

/// 会话摘要：覆盖的消息数与最后一条被覆盖消息的 id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub session_id: String,
    pub content: String,
    pub covered_count: usize,
    pub last_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// get_messages 查询参数
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub limit: Option<usize>,
    pub offset: usize,
    pub exclude_summarized: bool,
    pub order: SortOrder,
}

impl MessageQuery {
    /// 最近 n 条（降序取，调用方自行反转）
    pub fn latest(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            order: SortOrder::Descending,
            ..Default::default()
        }
    }

    pub fn unsummarized() -> Self {
        Self {
            exclude_summarized: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 追加消息，返回存储分配的 id（会话内单调递增）
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<i64, AgentError>;

    async fn get_messages(
        &self,
        session_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, AgentError>;

    async fn get_summary(&self, session_id: &str) -> Result<Option<ConversationSummary>, AgentError>;

    /// upsert：每个会话只保留一条摘要
    async fn save_summary(
        &self,
        session_id: &str,
        content: &str,
        covered_count: usize,
        last_message_id: i64,
    ) -> Result<(), AgentError>;

    async fn mark_summarized(&self, ids: &[i64]) -> Result<(), AgentError>;

    async fn get_message_count(
        &self,
        session_id: &str,
        exclude_summarized: bool,
    ) -> Result<usize, AgentError>;

    /// 删除会话的全部消息与摘要
    async fn delete_session(&self, session_id: &str) -> Result<(), AgentError>;

    /// 追加一批消息，返回带 id 的副本
    async fn append_messages(
        &self,
        session_id: &str,
        messages: &[Message],
    ) -> Result<Vec<Message>, AgentError> {
        let mut stored = Vec::with_capacity(messages.len());
        for m in messages {
            let id = self.append_message(session_id, m).await?;
            let mut m = m.clone();
            m.id = Some(id);
            stored.push(m);
        }
        Ok(stored)
    }
}

/// 对消息列表套用查询（过滤 / 排序 / 分页），供内存实现复用
pub(crate) fn apply_query(mut messages: Vec<Message>, query: &MessageQuery) -> Vec<Message> {
    if query.exclude_summarized {
        messages.retain(|m| !m.summarized);
    }
    if query.order == SortOrder::Descending {
        messages.reverse();
    }
    let iter = messages.into_iter().skip(query.offset);
    match query.limit {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

#[derive(Default)]
struct InMemoryState {
    next_id: i64,
    messages: HashMap<String, Vec<Message>>,
    summaries: HashMap<String, ConversationSummary>,
}

/// 进程内存储（测试与 mock 运行）
#[derive(Default)]
pub struct InMemoryMemoryStore {
    state: RwLock<InMemoryState>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<i64, AgentError> {
        let mut state = self.state.write().await;
        state.next_id += 1;
        let id = state.next_id;
        let mut stored = message.clone();
        stored.id = Some(id);
        stored.summarized = false;
        state
            .messages
            .entry(session_id.to_string())
            .or_default()
            .push(stored);
        Ok(id)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, AgentError> {
        let state = self.state.read().await;
        let all = state.messages.get(session_id).cloned().unwrap_or_default();
        Ok(apply_query(all, query))
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<ConversationSummary>, AgentError> {
        Ok(self.state.read().await.summaries.get(session_id).cloned())
    }

    async fn save_summary(
        &self,
        session_id: &str,
        content: &str,
        covered_count: usize,
        last_message_id: i64,
    ) -> Result<(), AgentError> {
        let summary = ConversationSummary {
            session_id: session_id.to_string(),
            content: content.to_string(),
            covered_count,
            last_message_id,
            updated_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .summaries
            .insert(session_id.to_string(), summary);
        Ok(())
    }

    async fn mark_summarized(&self, ids: &[i64]) -> Result<(), AgentError> {
        let mut state = self.state.write().await;
        for messages in state.messages.values_mut() {
            for m in messages.iter_mut() {
                if m.id.is_some_and(|id| ids.contains(&id)) {
                    m.summarized = true;
                }
            }
        }
        Ok(())
    }

    async fn get_message_count(
        &self,
        session_id: &str,
        exclude_summarized: bool,
    ) -> Result<usize, AgentError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(session_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| !exclude_summarized || !m.summarized)
                    .count()
            })
            .unwrap_or(0))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let mut state = self.state.write().await;
        state.messages.remove(session_id);
        state.summaries.remove(session_id);
        Ok(())
    }
}
