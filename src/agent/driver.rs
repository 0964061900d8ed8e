//! Orchestration Driver：回合状态机主循环
//!
//! 以 session.phase 为当前状态，循环调用 Planner / StepExecutor / ApprovalGate / Reflector，
//! 每次转换后写 checkpoint 快照。回合从 Planning 开始；从快照恢复时从 AwaitingApproval 继续。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::approval::{ApprovalGate, ApprovalVerdict};
use crate::agent::events::{AgentEvent, EventSink};
use crate::agent::executor::{ExecOutcome, StepExecutor};
use crate::agent::plan::Decision;
use crate::agent::{PendingToolCall, Planner, Reflector, Session};
use crate::core::state::{transition, PhaseEvent, TurnPhase};
use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::{truncate_chars, Message, SnapshotStore};

const SYNTHESIS_PROMPT: &str = "You are taskbee. The steps of a plan have been executed. \
Using the step results below, write the final answer to the user's request. \
Be direct and complete; do not describe the plan itself.";

/// 回合结果
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: String,
    pub decision: Decision,
    pub error: Option<String>,
}

pub struct TurnDriver {
    pub(crate) planner: Planner,
    pub(crate) executor: StepExecutor,
    pub(crate) reflector: Reflector,
    pub(crate) approval: Arc<dyn ApprovalGate>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) snapshots: Option<SnapshotStore>,
    pub(crate) approval_timeout: Option<Duration>,
    pub(crate) retry_backoff: Duration,
    pub(crate) chat_max_rounds: u32,
}

impl TurnDriver {
    pub fn new(
        planner: Planner,
        executor: StepExecutor,
        reflector: Reflector,
        approval: Arc<dyn ApprovalGate>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let chat_max_rounds = reflector.max_iterations();
        Self {
            planner,
            executor,
            reflector,
            approval,
            llm,
            snapshots: None,
            approval_timeout: None,
            retry_backoff: Duration::ZERO,
            chat_max_rounds,
        }
    }

    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// None 表示无限等待；超时自动拒绝
    pub fn with_approval_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.approval_timeout = timeout;
        self
    }

    /// 重试退避基数；第 n 次重试前等待 base * 2^(n-1)
    pub fn with_retry_backoff(mut self, base: Duration) -> Self {
        self.retry_backoff = base;
        self
    }

    pub fn snapshots(&self) -> Option<&SnapshotStore> {
        self.snapshots.as_ref()
    }

    pub(crate) async fn checkpoint(&self, session: &mut Session) {
        session.touch();
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(session).await {
                tracing::warn!(session_id = %session.id, error = %e, "checkpoint failed");
            }
        }
    }

    pub(crate) fn advance(
        &self,
        session: &mut Session,
        event: PhaseEvent,
        events: &EventSink,
    ) -> Result<(), AgentError> {
        let next = transition(session.phase, event).ok_or_else(|| {
            AgentError::Storage(format!(
                "invalid transition from {} on {:?}",
                session.phase.as_str(),
                event
            ))
        })?;
        tracing::debug!(session_id = %session.id, from = session.phase.as_str(), to = next.as_str(), "phase");
        session.phase = next;
        events.emit(AgentEvent::PhaseChanged {
            phase: next,
            iteration: session.iterations,
        });
        Ok(())
    }

    /// 等待审批；可被取消，配置了超时则到期自动拒绝
    pub(crate) async fn await_verdict(
        &self,
        pending: &PendingToolCall,
        cancel: &CancellationToken,
    ) -> Result<ApprovalVerdict, AgentError> {
        let request = async {
            match self.approval_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.approval.request(pending)).await {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::warn!(tool = %pending.tool_name, secs = limit.as_secs(), "approval timed out, rejecting");
                        Ok(ApprovalVerdict::reject("approval timed out"))
                    }
                },
                None => self.approval.request(pending).await,
            }
        };
        tokio::select! {
            verdict = request => verdict,
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    async fn backoff(&self, retries: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
        if self.retry_backoff.is_zero() || retries == 0 {
            return Ok(());
        }
        let factor = 1u32 << (retries - 1).min(10);
        let wait = self.retry_backoff.saturating_mul(factor);
        tracing::debug!(ms = wait.as_millis() as u64, "retry backoff");
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    /// 跑一个 agent 模式回合（或从 AwaitingApproval 恢复）；context 为本回合之前的窗口上下文
    pub async fn run(
        &self,
        session: &mut Session,
        context: &[Message],
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let tool_descriptions = self.executor.tools().descriptions();
        let mut last_decision = Decision::Error;

        while !session.phase.is_terminal() {
            if cancel.is_cancelled() {
                self.advance(session, PhaseEvent::Cancelled, events)?;
                return Err(AgentError::Cancelled);
            }
            let full_context: Vec<Message> = context
                .iter()
                .chain(session.turn_messages.iter())
                .cloned()
                .collect();

            match session.phase {
                TurnPhase::Planning => {
                    // 规划失败（无输入 / 模型不可达）：转入 Terminal 后上报，不写 checkpoint
                    let plan = match self
                        .planner
                        .plan(session, &full_context, &tool_descriptions)
                        .await
                    {
                        Ok(plan) => plan,
                        Err(e) => {
                            self.advance(session, PhaseEvent::PlanFailed, events)?;
                            return Err(e);
                        }
                    };
                    events.emit(AgentEvent::PlanCreated {
                        goal: plan.goal.clone(),
                        steps: plan.steps.iter().map(|s| s.description.clone()).collect(),
                        simple: plan.is_simple(),
                    });
                    session.plan = Some(plan);
                    self.advance(session, PhaseEvent::Planned, events)?;
                }
                TurnPhase::Executing => {
                    let outcome = self.executor.execute(session, &full_context, events).await;
                    let pending = matches!(outcome, ExecOutcome::AwaitingApproval(_));
                    if let ExecOutcome::AwaitingApproval(p) = &outcome {
                        events.emit(AgentEvent::ApprovalRequested {
                            tool: p.tool_name.clone(),
                            args: p.arguments.clone(),
                        });
                    }
                    self.advance(session, PhaseEvent::Executed { pending }, events)?;
                }
                TurnPhase::AwaitingApproval => {
                    if let Some(pending) = session.pending_tool_call.clone() {
                        let verdict = self.await_verdict(&pending, cancel).await?;
                        tracing::info!(
                            session_id = %session.id,
                            tool = %pending.tool_name,
                            approved = verdict.approved,
                            "approval resolved"
                        );
                        events.emit(AgentEvent::ApprovalResolved {
                            tool: pending.tool_name.clone(),
                            approved: verdict.approved,
                        });
                        self.executor.resolve_approval(session, &verdict, events).await;
                    }
                    self.advance(session, PhaseEvent::ApprovalResolved, events)?;
                }
                TurnPhase::Reflecting => {
                    let reflection = self.reflector.reflect(session).await;
                    events.emit(AgentEvent::Reflected {
                        decision: reflection.decision.as_str().to_string(),
                        reasoning: reflection.reasoning.clone(),
                    });
                    let mut decision = self.reflector.apply(session, reflection);
                    if matches!(decision, Decision::Continue | Decision::Retry) {
                        if session.iterations >= self.reflector.max_iterations() {
                            session.last_error = Some(format!(
                                "iteration ceiling reached ({})",
                                self.reflector.max_iterations()
                            ));
                            decision = Decision::Error;
                        } else {
                            if decision == Decision::Retry {
                                let retries = session
                                    .current_step()
                                    .map(|s| session.retries_for(s.id))
                                    .unwrap_or(0);
                                self.backoff(retries, cancel).await?;
                            }
                            session.bump_iteration();
                        }
                    }
                    last_decision = decision;
                    self.advance(session, PhaseEvent::Reflected(decision), events)?;
                }
                TurnPhase::Terminal => break,
            }
            self.checkpoint(session).await;
        }

        let outcome = self.compose_outcome(session, last_decision).await;
        events.emit(AgentEvent::MessageDone {
            text: outcome.response.clone(),
        });
        tracing::info!(
            session_id = %session.id,
            decision = outcome.decision.as_str(),
            iterations = session.iterations,
            "turn finished"
        );
        Ok(outcome)
    }

    async fn compose_outcome(&self, session: &mut Session, decision: Decision) -> TurnOutcome {
        if decision == Decision::Finish {
            let response = self.final_answer(session).await;
            return TurnOutcome {
                response,
                decision,
                error: None,
            };
        }
        let error = session
            .last_error
            .clone()
            .unwrap_or_else(|| "the task could not be completed".to_string());
        let mut response = format!("I couldn't complete the request: {}", error);
        if let Some(partial) = session
            .step_results
            .values()
            .rev()
            .find(|r| r.success && !r.output.trim().is_empty())
        {
            response.push_str(&format!(
                "\n\nPartial result:\n{}",
                truncate_chars(&partial.output, 1000)
            ));
        }
        session.push_message(Message::assistant(response.clone()));
        TurnOutcome {
            response,
            decision,
            error: Some(error),
        }
    }

    /// finish 时的最终回复：多步或来自工具的结果走一次综合调用，失败回退到最后一步输出
    async fn final_answer(&self, session: &mut Session) -> String {
        let last_output = session
            .step_results
            .values()
            .rev()
            .find(|r| r.success)
            .map(|r| r.output.clone())
            .unwrap_or_default();
        let Some(plan) = session.plan.as_ref() else {
            return last_output;
        };
        let needs_synthesis = !plan.is_simple()
            && (plan.len() > 1 || session.step_results.values().any(|r| r.from_tools));
        if !needs_synthesis {
            return session
                .last_assistant_reply()
                .map(str::to_string)
                .unwrap_or(last_output);
        }

        let results: Vec<String> = plan
            .steps
            .iter()
            .filter_map(|s| {
                session.step_results.get(&s.id).map(|r| {
                    format!(
                        "Step {} - {} ({}):\n{}",
                        s.id,
                        s.description,
                        if r.success { "ok" } else { "failed" },
                        truncate_chars(r.display_text(), 2000)
                    )
                })
            })
            .collect();
        let body = format!("Request: {}\n\n{}", plan.goal, results.join("\n\n"));
        let messages = vec![Message::system(SYNTHESIS_PROMPT), Message::user(body)];
        let answer = match self.llm.complete(&messages, &CompletionOptions::default()).await {
            Ok(r) if !r.text_or_empty().trim().is_empty() => r.text_or_empty().trim().to_string(),
            Ok(_) => last_output,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "final synthesis failed, using last step output");
                last_output
            }
        };
        session.push_message(Message::assistant(answer.clone()));
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::approval::{ChannelApprovalGate, StaticApprovalGate};
    use crate::agent::plan::StepStatus;
    use crate::agent::SessionMode;
    use crate::llm::{LlmError, LlmResponse, ScriptedLlmClient};
    use crate::memory::ToolCall;
    use crate::tools::{CalculatorTool, ShellTool, ToolExecutor, ToolRegistry};
    use serde_json::json;

    fn driver(
        llm: Arc<ScriptedLlmClient>,
        gate: Arc<dyn ApprovalGate>,
        max_iterations: u32,
        max_retries: u32,
    ) -> TurnDriver {
        let mut reg = ToolRegistry::new();
        reg.register(CalculatorTool);
        reg.register(ShellTool::new(vec!["echo".into()], 5));
        let tools = Arc::new(ToolExecutor::new(reg, 5));
        TurnDriver::new(
            Planner::new(llm.clone()),
            StepExecutor::new(llm.clone(), tools).with_limits(max_retries, 500, 4000),
            Reflector::new(llm.clone(), max_iterations, max_retries),
            gate,
            llm,
        )
    }

    fn turn(text: &str) -> Session {
        let mut s = Session::new("d", SessionMode::Agent);
        s.begin_turn(SessionMode::Agent);
        s.push_message(Message::user(text));
        s
    }

    fn plan_json(steps: &[(&str, &[&str])]) -> LlmResponse {
        let steps: Vec<_> = steps
            .iter()
            .map(|(d, t)| json!({"description": d, "tools_needed": t}))
            .collect();
        LlmResponse::structured(json!({"goal": "goal", "complexity": "moderate", "steps": steps}))
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_recovers_after_retries_with_backoff() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(plan_json(&[("compute the answer", &["calculator"])])),
            Err(LlmError::Provider("flaky".into())),
            Ok(LlmResponse::text("not json")),
            Err(LlmError::Provider("flaky".into())),
            Ok(LlmResponse::text("still not json")),
            Ok(LlmResponse::text("42")),
        ]));
        let d = driver(llm.clone(), Arc::new(StaticApprovalGate::reject_all()), 10, 3)
            .with_retry_backoff(Duration::from_millis(100));
        let mut s = turn("what is six times seven");
        let started = tokio::time::Instant::now();
        let out = d
            .run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.decision, Decision::Finish);
        assert_eq!(out.response, "42");
        let r = s.step_results.get(&1).unwrap();
        assert!(r.success);
        assert_eq!(r.retries, 2);
        assert_eq!(s.iterations, 3);
        assert_eq!(s.phase, TurnPhase::Terminal);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(llm.remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_timeout_rejects() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![
            plan_json(&[("run echo in the shell", &["shell"])]),
            LlmResponse::tool_calls(vec![ToolCall {
                id: "call_1".into(),
                name: "shell".into(),
                arguments: json!({"command": "echo hi"}),
            }]),
            LlmResponse::structured(json!({
                "assessment": "not approved",
                "success": false,
                "decision": "error",
                "reasoning": "the user did not approve the command"
            })),
        ]));
        let (gate, _rx) = ChannelApprovalGate::new(1);
        let d = driver(llm, Arc::new(gate), 10, 3)
            .with_approval_timeout(Some(Duration::from_secs(5)));
        let mut s = turn("say hi from the shell");
        let out = d
            .run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.decision, Decision::Error);
        assert!(s.pending_tool_call.is_none());
        let r = s.step_results.get(&1).unwrap();
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("approval timed out"));
        assert!(out.response.contains("did not approve"));
    }

    #[tokio::test]
    async fn test_iteration_ceiling_stops_long_plan() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![plan_json(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &[]),
            ("d", &[]),
            ("e", &[]),
        ])]));
        let d = driver(llm, Arc::new(StaticApprovalGate::approve_all()), 3, 3);
        let mut s = turn("do five things");
        let out = d
            .run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.decision, Decision::Error);
        assert_eq!(s.iterations, 3);
        assert!(s.last_error.as_deref().unwrap().contains("ceiling"));
        let plan = s.plan.as_ref().unwrap();
        assert_eq!(plan.steps[3].status, StepStatus::Pending);
        // 已完成的部分作为部分结果返回
        assert!(out.response.contains("Partial result"));
    }

    #[tokio::test]
    async fn test_multi_step_finish_synthesizes() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![
            plan_json(&[("find the number", &[]), ("double it", &[])]),
            LlmResponse::text("21"),
            LlmResponse::structured(json!({
                "assessment": "found", "success": true, "decision": "continue", "reasoning": "next"
            })),
            LlmResponse::text("42"),
            LlmResponse::text("The doubled number is 42."),
        ]));
        let d = driver(llm.clone(), Arc::new(StaticApprovalGate::approve_all()), 10, 3);
        let mut s = turn("find a number and double it");
        let out = d
            .run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.decision, Decision::Finish);
        assert_eq!(out.response, "The doubled number is 42.");
        assert_eq!(s.iterations, 2);
        assert_eq!(s.last_assistant_reply(), Some("The doubled number is 42."));
        assert_eq!(llm.call_count(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_turn_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let llm = Arc::new(ScriptedLlmClient::new(vec![]));
        let d = driver(llm.clone(), Arc::new(StaticApprovalGate::approve_all()), 10, 3)
            .with_snapshots(store.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut s = turn("hello");
        let err = d.run(&mut s, &[], &EventSink::none(), &cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
        assert_eq!(llm.call_count(), 0);

        let mut s = turn("hello");
        d.run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();
        let saved = store.load("d").await.unwrap().unwrap();
        assert_eq!(saved.phase, TurnPhase::Terminal);
        assert_eq!(saved.iterations, 1);
    }

    #[tokio::test]
    async fn test_no_user_input_is_error() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![]));
        let d = driver(llm, Arc::new(StaticApprovalGate::approve_all()), 10, 3);
        let mut s = Session::new("d", SessionMode::Agent);
        s.begin_turn(SessionMode::Agent);
        let err = d
            .run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NoUserInput));
        assert!(s.plan.is_none());
        assert_eq!(s.phase, TurnPhase::Terminal);
    }

    #[tokio::test]
    async fn test_rejected_step_never_finishes_on_continue() {
        let continue_anyway = || {
            LlmResponse::structured(json!({
                "assessment": "command was rejected",
                "success": false,
                "decision": "continue",
                "reasoning": "move on"
            }))
        };
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![
            plan_json(&[("run echo in the shell", &["shell"])]),
            LlmResponse::tool_calls(vec![ToolCall {
                id: "call_1".into(),
                name: "shell".into(),
                arguments: json!({"command": "echo hi"}),
            }]),
            continue_anyway(),
        ]));
        let d = driver(llm.clone(), Arc::new(StaticApprovalGate::reject_all()), 10, 1);
        let mut s = turn("say hi from the shell");
        let out = d
            .run(&mut s, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.decision, Decision::Error);
        assert!(out.error.is_some());
        assert!(!out.response.is_empty());
        assert_eq!(s.step_index, 0);
        let r = s.step_results.get(&1).unwrap();
        assert!(!r.success);
        assert_eq!(r.retries, 1);
        assert_eq!(llm.remaining(), 0);
    }
}
