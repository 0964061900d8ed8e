//! 回合过程事件：计划、步骤执行、审批、反思、最终回复，供前端流式展示

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::state::TurnPhase;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PhaseChanged { phase: TurnPhase, iteration: u32 },
    PlanCreated { goal: String, steps: Vec<String>, simple: bool },
    StepStarted { step_id: usize, description: String },
    ToolCall { tool: String, args: serde_json::Value },
    /// 工具返回（预览）
    Observation { tool: String, preview: String },
    ApprovalRequested { tool: String, args: serde_json::Value },
    ApprovalResolved { tool: String, approved: bool },
    StepFinished { step_id: usize, success: bool, preview: String },
    Reflected { decision: String, reasoning: String },
    MessageDone { text: String },
    Error { text: String },
}

/// 可选的事件发送端；没有接收方时静默丢弃
#[derive(Clone, Default)]
pub struct EventSink(Option<mpsc::UnboundedSender<AgentEvent>>);

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}
