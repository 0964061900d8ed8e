//! Agent 层：Planner / StepExecutor / Reflector / ApprovalGate，以及把它们串起来的 TurnDriver

pub mod approval;
pub mod chat;
pub mod driver;
pub mod events;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod reflector;
pub mod session;

pub use approval::{
    parse_verdict, shared_stdin, ApprovalGate, ApprovalRequest, ApprovalVerdict,
    ChannelApprovalGate, PromptApprovalGate, StaticApprovalGate, StdinApprovalGate,
};
pub use driver::{TurnDriver, TurnOutcome};
pub use events::{AgentEvent, EventSink};
pub use executor::{ExecOutcome, StepExecutor};
pub use plan::{
    Complexity, Decision, Plan, QueryKind, Reflection, Step, StepResult, StepResults, StepStatus,
};
pub use planner::{classify_conversational, ConversationalKind, Planner};
pub use reflector::Reflector;
pub use session::{PendingToolCall, Session, SessionMode};
