//! 后台摘要器
//!
//! 未摘要消息数超过阈值时，把除最近 window_size 条之外的未摘要消息连同旧摘要
//! 压缩成新的滚动摘要，写回 store 并标记这些消息为 summarized。
//! 每个会话同一时刻最多一个后台任务；失败只记日志，不影响对话。

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient, LlmError};
use crate::memory::store::{MemoryStore, MessageQuery};
use crate::memory::{truncate_chars, Message, Role};

const SUMMARY_PROMPT: &str = "You maintain a running summary of a conversation between a user and an assistant. \
Merge the previous summary (if any) with the new messages into one concise summary. \
Keep key facts, decisions, user preferences, tool results that matter later, and open tasks. \
Use short bullet points. Output only the summary.";

/// 单条消息在摘要输入中的最大字符数
const MAX_CHARS_PER_MESSAGE: usize = 1500;

/// 一次摘要的结果
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutcome {
    pub summarized_now: usize,
    pub covered_count: usize,
    pub last_message_id: i64,
}

#[derive(Clone)]
pub struct Summarizer {
    store: Arc<dyn MemoryStore>,
    llm: Arc<dyn LlmClient>,
    window_size: usize,
    threshold: usize,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// 任务结束（含 panic）时移出 in-flight 集合
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.session_id);
        }
    }
}

impl Summarizer {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        llm: Arc<dyn LlmClient>,
        window_size: usize,
        threshold: usize,
    ) -> Self {
        Self {
            store,
            llm,
            window_size,
            threshold,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// 超过阈值则摘要；未触发时返回 None
    pub async fn maybe_summarize(&self, session_id: &str) -> Result<Option<SummaryOutcome>, AgentError> {
        let unsummarized = self.store.get_message_count(session_id, true).await?;
        if unsummarized <= self.threshold {
            return Ok(None);
        }
        let messages = self
            .store
            .get_messages(session_id, &MessageQuery::unsummarized())
            .await?;
        if messages.len() <= self.window_size {
            return Ok(None);
        }
        let cut = messages.len() - self.window_size;
        let batch = &messages[..cut];
        let ids: Vec<i64> = batch.iter().filter_map(|m| m.id).collect();
        let Some(&last_message_id) = ids.last() else {
            return Ok(None);
        };

        let previous = self.store.get_summary(session_id).await?;
        let mut input = String::new();
        if let Some(prev) = &previous {
            input.push_str("Previous summary:\n");
            input.push_str(&prev.content);
            input.push_str("\n\n");
        }
        input.push_str("New messages:\n");
        input.push_str(&format_transcript(batch));

        let prompt = vec![Message::system(SUMMARY_PROMPT), Message::user(input)];
        let options = CompletionOptions::default().with_temperature(0.3);
        let response = self.llm.complete(&prompt, &options).await?;
        let content = response.text_or_empty().trim().to_string();
        if content.is_empty() {
            return Err(LlmError::InvalidResponse("empty summary".into()).into());
        }

        let covered_count = previous.map(|p| p.covered_count).unwrap_or(0) + ids.len();
        self.store
            .save_summary(session_id, &content, covered_count, last_message_id)
            .await?;
        self.store.mark_summarized(&ids).await?;
        tracing::info!(
            session_id = %session_id,
            summarized = ids.len(),
            covered = covered_count,
            "conversation summarized"
        );
        Ok(Some(SummaryOutcome {
            summarized_now: ids.len(),
            covered_count,
            last_message_id,
        }))
    }

    /// 后台触发（fire-and-forget）；该会话已有任务在跑时返回 None
    pub fn spawn(&self, session_id: &str) -> Option<JoinHandle<()>> {
        {
            let mut set = self.in_flight.lock().ok()?;
            if !set.insert(session_id.to_string()) {
                tracing::debug!(session_id = %session_id, "summarizer already running");
                return None;
            }
        }
        let guard = InFlightGuard {
            set: Arc::clone(&self.in_flight),
            session_id: session_id.to_string(),
        };
        let this = self.clone();
        let session_id = session_id.to_string();
        Some(tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.maybe_summarize(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "background summarization failed");
            }
        }))
    }
}

fn format_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let mut line = format!(
                "{}: {}",
                m.role.as_str(),
                truncate_chars(&m.content, MAX_CHARS_PER_MESSAGE)
            );
            if m.role == Role::Assistant && m.has_tool_calls() {
                let names: Vec<&str> = m.tool_calls.iter().map(|c| c.name.as_str()).collect();
                line.push_str(&format!(" [called: {}]", names.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}
