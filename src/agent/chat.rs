//! chat 模式：不规划、不反思的工具增强回复循环
//!
//! 每轮一次模型调用（绑定全部工具）；安全工具并发执行后把结果喂回模型，直到模型给出纯文本回复。
//! 危险调用逐个经过审批闸门，未处理的那个记在 session.pending_tool_call 里，崩溃后可恢复。
//! 相位同样经 core::state::transition 推进；没有 Reflector，由循环自己给出 continue / finish / error。

use tokio_util::sync::CancellationToken;

use crate::agent::driver::{TurnDriver, TurnOutcome};
use crate::agent::events::{AgentEvent, EventSink};
use crate::agent::plan::{Decision, Plan};
use crate::agent::{PendingToolCall, Session};
use crate::core::state::{PhaseEvent, TurnPhase};
use crate::core::AgentError;
use crate::llm::CompletionOptions;
use crate::memory::{last_user_content, Message, ToolCall};

const CHAT_PROMPT: &str = "You are taskbee, a helpful assistant with tools. \
Call a tool when it helps answer the user; otherwise reply directly and concisely.";

impl TurnDriver {
    /// 跑一个 chat 模式回合（或从 AwaitingApproval 恢复）
    pub async fn run_chat(
        &self,
        session: &mut Session,
        context: &[Message],
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        if session.phase == TurnPhase::Planning {
            let history: Vec<Message> = context.iter().chain(session.turn_messages.iter()).cloned().collect();
            let Some(request) = last_user_content(&history)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
            else {
                self.advance(session, PhaseEvent::PlanFailed, events)?;
                return Err(AgentError::NoUserInput);
            };
            // 单步计划只用来承载 StepResult 与审批的 step_id
            session.plan = Some(Plan::direct_answer(&request));
            self.advance(session, PhaseEvent::Planned, events)?;
        }

        let tools = self.executor.tools().clone();
        let options = CompletionOptions::default().with_tools(tools.specs());
        let mut queued: Vec<ToolCall> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                self.advance(session, PhaseEvent::Cancelled, events)?;
                return Err(AgentError::Cancelled);
            }

            if session.pending_tool_call.is_none() {
                if let Some(call) = (!queued.is_empty()).then(|| queued.remove(0)) {
                    session.pending_tool_call = Some(PendingToolCall {
                        tool_call_id: call.id,
                        tool_name: call.name,
                        arguments: call.arguments,
                        step_id: 1,
                    });
                }
            }
            if let Some(pending) = session.pending_tool_call.clone() {
                // 从快照恢复时已经处于 AwaitingApproval
                if session.phase == TurnPhase::Executing {
                    self.advance(session, PhaseEvent::Executed { pending: true }, events)?;
                }
                events.emit(AgentEvent::ApprovalRequested {
                    tool: pending.tool_name.clone(),
                    args: pending.arguments.clone(),
                });
                self.checkpoint(session).await;
                let verdict = self.await_verdict(&pending, cancel).await?;
                events.emit(AgentEvent::ApprovalResolved {
                    tool: pending.tool_name.clone(),
                    approved: verdict.approved,
                });
                self.executor.resolve_approval(session, &verdict, events).await;
                self.advance(session, PhaseEvent::ApprovalResolved, events)?;
                self.advance(session, PhaseEvent::Reflected(Decision::Continue), events)?;
                self.checkpoint(session).await;
                continue;
            }

            if session.iterations >= self.chat_max_rounds {
                let error = format!("iteration ceiling reached ({})", self.chat_max_rounds);
                return self.finish_chat(session, Decision::Error, Some(error), events);
            }

            let mut messages = vec![Message::system(CHAT_PROMPT)];
            messages.extend(context.iter().cloned());
            messages.extend(session.turn_messages.iter().cloned());
            let response = match self.llm.complete(&messages, &options).await {
                Ok(r) => r,
                // 回合内第一次调用失败直接上报；之后的失败转为 error 结果
                Err(e) if session.iterations == 0 => return Err(e.into()),
                Err(e) => {
                    let error = format!("model error: {}", e);
                    return self.finish_chat(session, Decision::Error, Some(error), events);
                }
            };
            session.bump_iteration();
            let text = response.text_or_empty().trim().to_string();

            if response.tool_calls.is_empty() {
                session.push_message(Message::assistant(text));
                return self.finish_chat(session, Decision::Finish, None, events);
            }

            session.push_message(Message::assistant_with_tool_calls(
                text,
                response.tool_calls.clone(),
            ));
            let (dangerous, safe): (Vec<ToolCall>, Vec<ToolCall>) = response
                .tool_calls
                .into_iter()
                .partition(|c| tools.is_dangerous(&c.name));
            if !safe.is_empty() {
                let outputs = self.executor.run_tools(&safe, events).await;
                for (call, output) in safe.iter().zip(outputs) {
                    session.push_message(Message::tool_result(call.id.clone(), output));
                }
            }
            queued.extend(dangerous);
            self.checkpoint(session).await;
        }
    }

    fn finish_chat(
        &self,
        session: &mut Session,
        decision: Decision,
        error: Option<String>,
        events: &EventSink,
    ) -> Result<TurnOutcome, AgentError> {
        if session.phase == TurnPhase::Executing {
            self.advance(session, PhaseEvent::Executed { pending: false }, events)?;
        }
        self.advance(session, PhaseEvent::Reflected(decision), events)?;
        let response = match &error {
            None => session.last_assistant_reply().unwrap_or_default().to_string(),
            Some(e) => {
                session.last_error = Some(e.clone());
                let text = format!("I couldn't complete the request: {}", e);
                session.push_message(Message::assistant(text.clone()));
                text
            }
        };
        events.emit(AgentEvent::MessageDone {
            text: response.clone(),
        });
        tracing::info!(
            session_id = %session.id,
            decision = decision.as_str(),
            iterations = session.iterations,
            "chat turn finished"
        );
        Ok(TurnOutcome {
            response,
            decision,
            error,
        })
    }
}
