//! 回合状态机
//!
//! Planning → Executing → {AwaitingApproval, Reflecting} → Executing | Terminal。
//! transition 是纯函数，Driver 用一个 loop 驱动它，每次转换后写 checkpoint。

use serde::{Deserialize, Serialize};

use crate::agent::Decision;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Planning,
    Executing,
    AwaitingApproval,
    Reflecting,
    Terminal,
}

impl TurnPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnPhase::Terminal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Planning => "planning",
            TurnPhase::Executing => "executing",
            TurnPhase::AwaitingApproval => "awaiting_approval",
            TurnPhase::Reflecting => "reflecting",
            TurnPhase::Terminal => "terminal",
        }
    }
}

/// 驱动状态转换的事件
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Planner 产出了计划
    Planned,
    /// Planner 失败（无输入 / 模型不可达）
    PlanFailed,
    /// Executor 返回（含失败）；pending 表示记录了待审批的危险调用
    Executed { pending: bool },
    /// 审批已处理（批准后执行完毕或被拒绝）
    ApprovalResolved,
    Reflected(Decision),
    Cancelled,
}

/// 纯转换函数；非法组合返回 None
pub fn transition(from: TurnPhase, event: PhaseEvent) -> Option<TurnPhase> {
    use PhaseEvent::*;
    use TurnPhase::*;

    match (from, event) {
        (Terminal, _) => None,
        (_, Cancelled) => Some(Terminal),
        (Planning, Planned) => Some(Executing),
        (Planning, PlanFailed) => Some(Terminal),
        (Executing, Executed { pending: true }) => Some(AwaitingApproval),
        (Executing, Executed { pending: false }) => Some(Reflecting),
        (AwaitingApproval, ApprovalResolved) => Some(Reflecting),
        (Reflecting, Reflected(Decision::Continue | Decision::Retry)) => Some(Executing),
        (Reflecting, Reflected(Decision::Finish | Decision::Error)) => Some(Terminal),
        _ => None,
    }
}
