//! 滑动窗口：最近 N 条未摘要消息 + 当前滚动摘要，作为有界上下文

use std::sync::Arc;

use crate::core::AgentError;
use crate::memory::store::{ConversationSummary, MemoryStore, MessageQuery};
use crate::memory::Message;

/// 有界上下文：摘要（若有）+ 按时间升序的最近消息
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    pub summary: Option<ConversationSummary>,
    pub messages: Vec<Message>,
}

impl ContextWindow {
    /// 组装送给模型的消息：system prompt、摘要（作为 system 消息）、窗口消息
    pub fn to_llm_messages(&self, system_prompt: Option<&str>) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 2);
        if let Some(prompt) = system_prompt {
            out.push(Message::system(prompt));
        }
        if let Some(summary) = &self.summary {
            out.push(Message::system(format!(
                "Summary of the earlier conversation:\n{}",
                summary.content
            )));
        }
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.messages.is_empty()
    }
}

pub struct SlidingWindow {
    store: Arc<dyn MemoryStore>,
    window_size: usize,
}

impl SlidingWindow {
    pub fn new(store: Arc<dyn MemoryStore>, window_size: usize) -> Self {
        Self {
            store,
            window_size: window_size.max(1),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// 读取上下文；只读操作，重复调用结果一致
    pub async fn get_context(&self, session_id: &str) -> Result<ContextWindow, AgentError> {
        let summary = self.store.get_summary(session_id).await?;
        let query = MessageQuery {
            exclude_summarized: true,
            ..MessageQuery::latest(self.window_size)
        };
        let mut messages = self.store.get_messages(session_id, &query).await?;
        messages.reverse();
        // 摘要已覆盖的消息不再重复出现
        if let Some(s) = &summary {
            messages.retain(|m| m.id.map_or(true, |id| id > s.last_message_id));
        }
        Ok(ContextWindow { summary, messages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryMemoryStore;

    async fn seeded(n: usize) -> (Arc<InMemoryMemoryStore>, Vec<i64>) {
        let store = Arc::new(InMemoryMemoryStore::new());
        let mut ids = Vec::new();
        for i in 1..=n {
            ids.push(
                store
                    .append_message("s", &Message::user(format!("m{}", i)))
                    .await
                    .unwrap(),
            );
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_window_keeps_most_recent() {
        let (store, _) = seeded(8).await;
        let window = SlidingWindow::new(store, 3);
        let ctx = window.get_context("s").await.unwrap();
        let contents: Vec<_> = ctx.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m6", "m7", "m8"]);
        assert!(ctx.summary.is_none());
    }

    #[tokio::test]
    async fn test_get_context_is_idempotent() {
        let (store, _) = seeded(5).await;
        let window = SlidingWindow::new(store, 4);
        let a = window.get_context("s").await.unwrap();
        let b = window.get_context("s").await.unwrap();
        assert_eq!(
            a.messages.iter().map(|m| m.id).collect::<Vec<_>>(),
            b.messages.iter().map(|m| m.id).collect::<Vec<_>>()
        );
        assert_eq!(a.summary, b.summary);
    }

    #[tokio::test]
    async fn test_summary_and_window_do_not_overlap() {
        let (store, ids) = seeded(6).await;
        store.save_summary("s", "m1..m4", 4, ids[3]).await.unwrap();
        store.mark_summarized(&ids[..4]).await.unwrap();

        let window = SlidingWindow::new(store.clone(), 10);
        let ctx = window.get_context("s").await.unwrap();
        assert_eq!(ctx.summary.as_ref().unwrap().content, "m1..m4");
        let contents: Vec<_> = ctx.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m5", "m6"]);

        let llm = ctx.to_llm_messages(Some("sys"));
        assert_eq!(llm.len(), 4);
        assert!(llm[1].content.contains("m1..m4"));
    }
}
