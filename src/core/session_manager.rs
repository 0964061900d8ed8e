//! 会话管理：每个会话 id 一份 Session，对外暴露 chat(session_id, mode, message)
//!
//! - 同一会话同一时刻只允许一个回合（try_lock 失败即 SessionBusy），不同会话并发执行
//! - 回合开始前从 Memory Store 读取滑动窗口上下文；回合消息先缓存在 Session 里，结束时一次写入
//! - 回合以错误结束时恢复回合前的 Session（持久化状态不变）；审批前端不可用时保留待审批调用以便 resume
//! - 回合结束后后台触发摘要，不阻塞返回

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::{
    AgentEvent, Decision, EventSink, Plan, Session, SessionMode, StepResults, TurnDriver,
    TurnOutcome,
};
use crate::core::AgentError;
use crate::memory::{
    validate_session_id, MemoryStore, Message, SessionInfo, SlidingWindow, SnapshotStore,
    Summarizer,
};

/// chat 的返回：回复文本与回合元数据
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub decision: Decision,
    /// 本回合迭代数
    pub iterations: u32,
    pub plan: Option<Plan>,
    pub step_results: Option<StepResults>,
    pub error: Option<String>,
}

pub struct SessionManager {
    driver: Arc<TurnDriver>,
    store: Arc<dyn MemoryStore>,
    window: SlidingWindow,
    summarizer: Option<Summarizer>,
    snapshots: SnapshotStore,
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    /// 当前取消令牌；每个回合用子 token，cancel_all 后换新
    cancel_token: std::sync::Mutex<CancellationToken>,
}

impl SessionManager {
    pub fn new(
        driver: Arc<TurnDriver>,
        store: Arc<dyn MemoryStore>,
        window: SlidingWindow,
        snapshots: SnapshotStore,
    ) -> Self {
        Self {
            driver,
            store,
            window,
            summarizer: None,
            snapshots,
            sessions: RwLock::new(HashMap::new()),
            cancel_token: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn store(&self) -> &Arc<dyn MemoryStore> {
        &self.store
    }

    pub fn summarizer(&self) -> Option<&Summarizer> {
        self.summarizer.as_ref()
    }

    /// 取消所有进行中的回合（Ctrl+C）
    pub fn cancel_all(&self) {
        let mut token = match self.cancel_token.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        token.cancel();
        *token = CancellationToken::new();
    }

    fn turn_token(&self) -> CancellationToken {
        match self.cancel_token.lock() {
            Ok(t) => t.child_token(),
            Err(poisoned) => poisoned.into_inner().child_token(),
        }
    }

    /// 取内存中的会话；不在内存则从快照加载，都没有则新建
    async fn handle(&self, session_id: &str, mode: SessionMode) -> Result<Arc<Mutex<Session>>, AgentError> {
        validate_session_id(session_id)?;
        if let Some(h) = self.sessions.read().await.get(session_id) {
            return Ok(Arc::clone(h));
        }
        let session = match self.snapshots.load(session_id).await? {
            Some(s) => {
                tracing::info!(session_id = %session_id, "session loaded from snapshot");
                s
            }
            None => Session::new(session_id, mode),
        };
        let mut sessions = self.sessions.write().await;
        let h = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(session)));
        Ok(Arc::clone(h))
    }

    async fn lock(&self, session_id: &str, mode: SessionMode) -> Result<OwnedMutexGuard<Session>, AgentError> {
        self.handle(session_id, mode)
            .await?
            .try_lock_owned()
            .map_err(|_| AgentError::SessionBusy(session_id.to_string()))
    }

    pub async fn chat(&self, session_id: &str, mode: SessionMode, message: &str) -> Result<ChatResponse, AgentError> {
        self.chat_with_events(session_id, mode, message, &EventSink::none())
            .await
    }

    /// 跑一个回合，过程事件发到 events
    pub async fn chat_with_events(
        &self,
        session_id: &str,
        mode: SessionMode,
        message: &str,
        events: &EventSink,
    ) -> Result<ChatResponse, AgentError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AgentError::NoUserInput);
        }
        let mut session = self.lock(session_id, mode).await?;
        if session.has_pending_approval() {
            return Err(AgentError::PendingApproval(session_id.to_string()));
        }

        let context = self.window.get_context(session_id).await?.to_llm_messages(None);
        let backup = session.clone();
        session.begin_turn(mode);
        session.push_message(Message::user(message));
        tracing::info!(session_id = %session_id, mode = %mode, context = context.len(), "turn started");

        self.drive(&mut *session, backup, &context, events).await
    }

    /// 恢复停在待审批状态的回合（崩溃或审批前端断开后）；没有待审批调用时返回 None
    pub async fn resume(&self, session_id: &str) -> Result<Option<ChatResponse>, AgentError> {
        self.resume_with_events(session_id, &EventSink::none()).await
    }

    pub async fn resume_with_events(
        &self,
        session_id: &str,
        events: &EventSink,
    ) -> Result<Option<ChatResponse>, AgentError> {
        let mut session = self.lock(session_id, SessionMode::default()).await?;
        if !session.has_pending_approval() {
            return Ok(None);
        }
        let context = self.window.get_context(session_id).await?.to_llm_messages(None);
        let backup = session.clone();
        tracing::info!(session_id = %session_id, "resuming turn with pending approval");
        self.drive(&mut *session, backup, &context, events).await.map(Some)
    }

    async fn drive(
        &self,
        session: &mut Session,
        backup: Session,
        context: &[Message],
        events: &EventSink,
    ) -> Result<ChatResponse, AgentError> {
        let cancel = self.turn_token();
        let result = match session.mode {
            SessionMode::Agent => self.driver.run(session, context, events, &cancel).await,
            SessionMode::Chat => self.driver.run_chat(session, context, events, &cancel).await,
        };
        match result {
            Ok(outcome) => self.finish_turn(session, outcome).await,
            Err(e) => {
                events.emit(AgentEvent::Error { text: e.to_string() });
                if matches!(e, AgentError::ApprovalUnavailable(_)) && session.has_pending_approval() {
                    // 待审批调用已在快照里，保留以便 resume
                    tracing::warn!(session_id = %session.id, error = %e, "approval unavailable, turn suspended");
                } else {
                    tracing::warn!(session_id = %session.id, error = %e, "turn failed, restoring session");
                    *session = backup;
                    self.save_snapshot(session).await;
                }
                Err(e)
            }
        }
    }

    async fn finish_turn(&self, session: &mut Session, outcome: TurnOutcome) -> Result<ChatResponse, AgentError> {
        let pending = std::mem::take(&mut session.turn_messages);
        let written = match self.store.append_messages(&session.id, &pending).await {
            Ok(w) => w,
            Err(e) => {
                session.turn_messages = pending;
                return Err(e);
            }
        };
        session.message_count += written.len();
        session.touch();
        self.save_snapshot(session).await;
        if let Some(summarizer) = &self.summarizer {
            summarizer.spawn(&session.id);
        }

        let has_plan = session.mode == SessionMode::Agent;
        Ok(ChatResponse {
            session_id: session.id.clone(),
            response: outcome.response,
            decision: outcome.decision,
            iterations: session.iterations,
            plan: session.plan.clone().filter(|_| has_plan),
            step_results: (!session.step_results.is_empty()).then(|| session.step_results.clone()),
            error: outcome.error,
        })
    }

    async fn save_snapshot(&self, session: &Session) {
        if let Err(e) = self.snapshots.save(session).await {
            tracing::warn!(session_id = %session.id, error = %e, "snapshot save failed");
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>, AgentError> {
        self.snapshots.list().await
    }

    /// 会话当前状态；回合进行中时读快照
    pub async fn session_snapshot(&self, session_id: &str) -> Result<Option<Session>, AgentError> {
        validate_session_id(session_id)?;
        if let Some(h) = self.sessions.read().await.get(session_id) {
            if let Ok(s) = h.try_lock() {
                return Ok(Some(s.clone()));
            }
        }
        self.snapshots.load(session_id).await
    }

    /// 删除快照、消息与摘要；回合进行中时返回 SessionBusy
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, AgentError> {
        validate_session_id(session_id)?;
        let mut sessions = self.sessions.write().await;
        if let Some(h) = sessions.get(session_id) {
            if h.try_lock().is_err() {
                return Err(AgentError::SessionBusy(session_id.to_string()));
            }
            sessions.remove(session_id);
        }
        drop(sessions);
        let existed = self.snapshots.delete(session_id).await?;
        let had_messages = self.store.get_message_count(session_id, false).await? > 0;
        self.store.delete_session(session_id).await?;
        tracing::info!(session_id = %session_id, "session deleted");
        Ok(existed || had_messages)
    }
}
