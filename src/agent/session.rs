//! 会话状态
//!
//! Session 是 Driver 唯一可变的状态；整个结构可序列化，checkpoint 时原样写成快照，
//! 崩溃后从快照恢复（包括待审批的工具调用与本回合尚未入库的消息）。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::plan::{Plan, Reflection, Step, StepResult, StepResults, StepStatus};
use crate::core::state::TurnPhase;
use crate::memory::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// 直接的工具增强回复循环
    Chat,
    /// Plan → Execute → Reflect
    #[default]
    Agent,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Chat => write!(f, "chat"),
            SessionMode::Agent => write!(f, "agent"),
        }
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Ok(SessionMode::Chat),
            "agent" => Ok(SessionMode::Agent),
            other => Err(format!("unknown mode '{}', expected chat|agent", other)),
        }
    }
}

/// 等待人工审批的危险工具调用；每个会话至多一个
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub step_id: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub plan: Option<Plan>,
    /// 当前步骤的 0 基索引
    pub step_index: usize,
    #[serde(default)]
    pub step_results: StepResults,
    /// 本回合迭代数（回合开始时归零，回合内只增）
    pub iterations: u32,
    /// 生命周期累计迭代数
    #[serde(default)]
    pub total_iterations: u64,
    pub last_error: Option<String>,
    #[serde(default)]
    pub pending_tool_call: Option<PendingToolCall>,
    #[serde(default)]
    pub last_reflection: Option<Reflection>,
    pub phase: TurnPhase,
    /// 本回合产生、尚未写入 Memory Store 的消息
    #[serde(default)]
    pub turn_messages: Vec<Message>,
    /// 已入库的消息数
    #[serde(default)]
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            mode,
            plan: None,
            step_index: 0,
            step_results: StepResults::new(),
            iterations: 0,
            total_iterations: 0,
            last_error: None,
            pending_tool_call: None,
            last_reflection: None,
            phase: TurnPhase::Terminal,
            turn_messages: Vec::new(),
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// 新回合：清空上一回合的计划与中间状态，累计计数保留
    pub fn begin_turn(&mut self, mode: SessionMode) {
        self.mode = mode;
        self.plan = None;
        self.step_index = 0;
        self.step_results.clear();
        self.iterations = 0;
        self.last_error = None;
        self.pending_tool_call = None;
        self.last_reflection = None;
        self.turn_messages.clear();
        self.phase = TurnPhase::Planning;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn bump_iteration(&mut self) {
        self.iterations += 1;
        self.total_iterations += 1;
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.plan.as_ref().and_then(|p| p.step(self.step_index))
    }

    pub fn current_result(&self) -> Option<&StepResult> {
        let id = self.current_step()?.id;
        self.step_results.get(&id)
    }

    pub fn retries_for(&self, step_id: usize) -> u32 {
        self.step_results.get(&step_id).map(|r| r.retries).unwrap_or(0)
    }

    /// 记录步骤结果；沿用已有的 retries（重试计数只由 Reflector 递增）
    pub fn record_result(&mut self, mut result: StepResult) {
        result.retries = self.retries_for(result.step_id);
        let status = if result.success {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        };
        if let Some(plan) = self.plan.as_mut() {
            if let Some(index) = plan.steps.iter().position(|s| s.id == result.step_id) {
                plan.set_status(index, status);
            }
        }
        self.step_results.insert(result.step_id, result);
    }

    pub fn has_pending_approval(&self) -> bool {
        self.pending_tool_call.is_some()
    }

    pub fn push_message(&mut self, message: Message) {
        self.turn_messages.push(message);
    }

    /// 本回合最后一条 assistant 可见回复
    pub fn last_assistant_reply(&self) -> Option<&str> {
        self.turn_messages
            .iter()
            .rev()
            .find(|m| m.role == crate::memory::Role::Assistant && !m.content.trim().is_empty())
            .map(|m| m.content.as_str())
    }
}
