//! StepExecutor：执行当前步骤
//!
//! simple 计划走一次不带工具的直答；complex 计划拼上下文 prompt（目标、当前步骤、前序结果摘要、工具说明），
//! 模型请求工具时：只要有危险工具就只记录第一个危险调用为 PendingToolCall、什么都不执行；
//! 否则并发执行全部安全工具。模型或工具错误都转为失败的 StepResult，由 Reflector 决定后续。

use std::sync::Arc;

use futures_util::future::join_all;

use crate::agent::events::{AgentEvent, EventSink};
use crate::agent::plan::{Plan, Step, StepResult, StepStatus};
use crate::agent::{ApprovalVerdict, PendingToolCall, Session};
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::{truncate_chars, Message, ToolCall};
use crate::tools::ToolExecutor;

/// 纯综合 / 分析类步骤关键字：命中则不绑定工具
const SYNTHESIS_KEYWORDS: &[&str] = &[
    "summarize",
    "summarise",
    "summary",
    "synthesize",
    "analyze",
    "analyse",
    "explain",
    "compare",
    "conclude",
    "report",
    "总结",
    "分析",
    "汇总",
    "归纳",
    "解释",
    "比较",
];

const DIRECT_PROMPT: &str = "You are taskbee, a helpful task assistant. Reply to the user directly and concisely.";

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// 计划已执行完（索引越过最后一步）
    Completed,
    /// 步骤已执行，结果已写入 session（成功或失败）
    StepDone { success: bool },
    /// 记录了待审批的危险调用
    AwaitingApproval(PendingToolCall),
    /// 步骤重试已耗尽，已设置 session.last_error
    RetriesExhausted,
}

pub struct StepExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolExecutor>,
    max_retries: u32,
    step_output_chars: usize,
    tool_output_chars: usize,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl StepExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, tools: Arc<ToolExecutor>) -> Self {
        Self {
            llm,
            tools,
            max_retries: 3,
            step_output_chars: 500,
            tool_output_chars: 4000,
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_limits(mut self, max_retries: u32, step_output_chars: usize, tool_output_chars: usize) -> Self {
        self.max_retries = max_retries;
        self.step_output_chars = step_output_chars;
        self.tool_output_chars = tool_output_chars;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn tools(&self) -> &Arc<ToolExecutor> {
        &self.tools
    }

    /// 执行当前步骤；context 为窗口消息 + 本回合消息
    pub async fn execute(&self, session: &mut Session, context: &[Message], events: &EventSink) -> ExecOutcome {
        let Some(plan) = session.plan.clone() else {
            return ExecOutcome::Completed;
        };
        let Some(step) = plan.step(session.step_index).cloned() else {
            return ExecOutcome::Completed;
        };

        let retries = session.retries_for(step.id);
        if retries >= self.max_retries {
            let msg = format!("step {} failed after {} retries", step.id, retries);
            tracing::warn!(session_id = %session.id, step = step.id, "retries exhausted");
            session.last_error = Some(msg);
            return ExecOutcome::RetriesExhausted;
        }

        if let Some(p) = session.plan.as_mut() {
            p.set_status(session.step_index, StepStatus::Running);
        }
        events.emit(AgentEvent::StepStarted {
            step_id: step.id,
            description: step.description.clone(),
        });
        tracing::info!(session_id = %session.id, step = step.id, retries, "executing step");

        if plan.is_simple() {
            return self.direct_reply(session, &step, context, events).await;
        }
        self.tooled_step(session, &plan, &step, context, events).await
    }

    async fn direct_reply(
        &self,
        session: &mut Session,
        step: &Step,
        context: &[Message],
        events: &EventSink,
    ) -> ExecOutcome {
        let mut messages = vec![Message::system(DIRECT_PROMPT)];
        messages.extend(context.iter().cloned());
        let options = CompletionOptions::default()
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        let result = match self.llm.complete(&messages, &options).await {
            Ok(resp) => {
                let text = resp.text_or_empty().trim().to_string();
                session.push_message(Message::assistant(text.clone()));
                StepResult::success(step.id, text)
            }
            Err(e) => StepResult::failure(step.id, format!("model error: {}", e)),
        };
        self.finish_step(session, result, events)
    }

    async fn tooled_step(
        &self,
        session: &mut Session,
        plan: &Plan,
        step: &Step,
        context: &[Message],
        events: &EventSink,
    ) -> ExecOutcome {
        let bind_tools = !omit_tools(plan, step);
        let system = self.build_step_prompt(session, plan, step, bind_tools);
        let mut messages = vec![Message::system(system)];
        messages.extend(context.iter().cloned());

        let mut options = CompletionOptions::default()
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        if bind_tools {
            options = options.with_tools(self.tools.specs());
        }

        let response = match self.llm.complete(&messages, &options).await {
            Ok(r) => r,
            Err(e) => {
                let result = StepResult::failure(step.id, format!("model error: {}", e));
                return self.finish_step(session, result, events);
            }
        };
        let text = response.text_or_empty().trim().to_string();

        if response.tool_calls.is_empty() {
            session.push_message(Message::assistant(text.clone()));
            return self.finish_step(session, StepResult::success(step.id, text), events);
        }

        // 危险调用优先：记录第一个，什么都不执行
        if let Some(call) = response
            .tool_calls
            .iter()
            .find(|c| self.tools.is_dangerous(&c.name))
        {
            let pending = PendingToolCall {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                step_id: step.id,
            };
            session.push_message(Message::assistant_with_tool_calls(text, vec![call.clone()]));
            session.pending_tool_call = Some(pending.clone());
            tracing::info!(session_id = %session.id, tool = %pending.tool_name, "dangerous tool call awaiting approval");
            return ExecOutcome::AwaitingApproval(pending);
        }

        session.push_message(Message::assistant_with_tool_calls(
            text,
            response.tool_calls.clone(),
        ));
        let outputs = self.run_tools(&response.tool_calls, events).await;
        let mut parts = Vec::with_capacity(outputs.len());
        for (call, output) in response.tool_calls.iter().zip(outputs) {
            session.push_message(Message::tool_result(call.id.clone(), output.clone()));
            parts.push(format!("[{}] {}", call.name, output));
        }
        let names = response.tool_calls.iter().map(|c| c.name.clone()).collect();
        let result = StepResult::success(step.id, parts.join("\n\n")).with_tools(names);
        self.finish_step(session, result, events)
    }

    /// 并发执行安全工具；失败转为错误文本，不中断其他调用
    pub(crate) async fn run_tools(&self, calls: &[ToolCall], events: &EventSink) -> Vec<String> {
        for call in calls {
            events.emit(AgentEvent::ToolCall {
                tool: call.name.clone(),
                args: call.arguments.clone(),
            });
        }
        let futures = calls.iter().map(|call| async move {
            match self.tools.execute(&call.name, call.arguments.clone()).await {
                Ok(out) => truncate_chars(&out, self.tool_output_chars),
                Err(e) => format!("Error: {}", e),
            }
        });
        let outputs = join_all(futures).await;
        for (call, out) in calls.iter().zip(&outputs) {
            events.emit(AgentEvent::Observation {
                tool: call.name.clone(),
                preview: truncate_chars(out, 200),
            });
        }
        outputs
    }

    /// 处理审批结果：批准则执行该工具，拒绝则记为失败；两种情况都补上 tool_result 消息并清除 pending
    pub async fn resolve_approval(
        &self,
        session: &mut Session,
        verdict: &ApprovalVerdict,
        events: &EventSink,
    ) -> ExecOutcome {
        let Some(pending) = session.pending_tool_call.take() else {
            return ExecOutcome::StepDone { success: false };
        };
        let result = if verdict.approved {
            let call = ToolCall {
                id: pending.tool_call_id.clone(),
                name: pending.tool_name.clone(),
                arguments: pending.arguments.clone(),
            };
            events.emit(AgentEvent::ToolCall {
                tool: call.name.clone(),
                args: call.arguments.clone(),
            });
            match self.tools.execute(&call.name, call.arguments.clone()).await {
                Ok(out) => {
                    let out = truncate_chars(&out, self.tool_output_chars);
                    events.emit(AgentEvent::Observation {
                        tool: call.name.clone(),
                        preview: truncate_chars(&out, 200),
                    });
                    session.push_message(Message::tool_result(call.id.clone(), out.clone()));
                    StepResult::success(pending.step_id, format!("[{}] {}", call.name, out))
                        .with_tools(vec![call.name])
                }
                Err(e) => {
                    let err = format!("Error: {}", e);
                    session.push_message(Message::tool_result(call.id.clone(), err.clone()));
                    StepResult::failure(pending.step_id, format!("tool '{}' failed: {}", call.name, e))
                        .with_tools(vec![call.name])
                }
            }
        } else {
            let reason = verdict.reason.as_deref().unwrap_or("rejected by user");
            session.push_message(Message::tool_result(
                pending.tool_call_id.clone(),
                format!("Tool call rejected: {}", reason),
            ));
            StepResult::failure(
                pending.step_id,
                format!("tool call '{}' rejected: {}", pending.tool_name, reason),
            )
        };
        self.finish_step(session, result, events)
    }

    fn finish_step(&self, session: &mut Session, result: StepResult, events: &EventSink) -> ExecOutcome {
        let success = result.success;
        events.emit(AgentEvent::StepFinished {
            step_id: result.step_id,
            success,
            preview: truncate_chars(result.display_text(), 200),
        });
        if !success {
            tracing::warn!(
                session_id = %session.id,
                step = result.step_id,
                error = %result.error.as_deref().unwrap_or(""),
                "step failed"
            );
        }
        session.record_result(result);
        ExecOutcome::StepDone { success }
    }

    fn build_step_prompt(&self, session: &Session, plan: &Plan, step: &Step, bind_tools: bool) -> String {
        let mut s = String::from(
            "You are taskbee, executing one step of a plan. Do only the current step. \
Use a tool when the step needs one; otherwise answer with the step's result.\n\n",
        );
        s.push_str(&format!("## Goal\n{}\n\n", plan.goal));
        s.push_str(&format!(
            "## Current step ({}/{})\n{}\n\n",
            step.id,
            plan.len(),
            step.description
        ));

        let previous: Vec<String> = plan
            .steps
            .iter()
            .take_while(|s| s.id != step.id)
            .filter_map(|s| {
                session.step_results.get(&s.id).map(|r| {
                    format!(
                        "- Step {} ({}): {}",
                        s.id,
                        if r.success { "ok" } else { "failed" },
                        truncate_chars(r.display_text(), self.step_output_chars)
                    )
                })
            })
            .collect();
        if !previous.is_empty() {
            s.push_str("## Previous results\n");
            s.push_str(&previous.join("\n"));
            s.push_str("\n\n");
        }

        if let Some(prev) = session.step_results.get(&step.id).filter(|r| !r.success) {
            s.push_str(&format!(
                "## Previous attempt of this step failed\n{}\nTry a different approach.\n\n",
                truncate_chars(prev.display_text(), self.step_output_chars)
            ));
        }
        if let Some(hint) = session
            .last_reflection
            .as_ref()
            .and_then(|r| r.modification.as_deref())
        {
            s.push_str(&format!("## Suggested adjustment\n{}\n\n", hint));
        }
        if bind_tools {
            let tools = self.tools.descriptions();
            if !tools.is_empty() {
                s.push_str("## Available tools\n");
                s.push_str(&tools);
                s.push('\n');
            }
        }
        s
    }
}

/// 综合类步骤，或多步计划里没有声明工具的步骤，不绑定工具
fn omit_tools(plan: &Plan, step: &Step) -> bool {
    let desc = step.description.to_lowercase();
    if SYNTHESIS_KEYWORDS.iter().any(|k| desc.contains(k)) {
        return true;
    }
    step.tools_needed.is_empty() && plan.len() > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::{Complexity, QueryKind};
    use crate::agent::SessionMode;
    use crate::llm::{LlmError, LlmResponse, ScriptedLlmClient};
    use crate::tools::{CalculatorTool, ShellTool, ToolRegistry};
    use serde_json::json;

    fn tools() -> Arc<ToolExecutor> {
        let mut reg = ToolRegistry::new();
        reg.register(CalculatorTool);
        reg.register(ShellTool::new(vec!["echo".into()], 5));
        Arc::new(ToolExecutor::new(reg, 5))
    }

    fn complex_plan(steps: &[(&str, &[&str])]) -> Plan {
        Plan {
            goal: "goal".into(),
            query_kind: QueryKind::Complex,
            steps: steps
                .iter()
                .enumerate()
                .map(|(i, (d, t))| Step::new(i + 1, *d, t.iter().map(|s| s.to_string()).collect()))
                .collect(),
            complexity: Complexity::Moderate,
            direct_answer: false,
        }
    }

    fn session_with(plan: Plan) -> Session {
        let mut s = Session::new("t", SessionMode::Agent);
        s.begin_turn(SessionMode::Agent);
        s.plan = Some(plan);
        s
    }

    fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn test_simple_plan_direct_reply_without_tools() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![LlmResponse::text("Hi!")]));
        let ex = StepExecutor::new(llm.clone(), tools());
        let mut s = session_with(Plan::direct_answer("hello"));
        let out = ex.execute(&mut s, &[Message::user("hello")], &EventSink::none()).await;
        assert_eq!(out, ExecOutcome::StepDone { success: true });
        assert!(llm.calls()[0].tool_names.is_empty());
        assert_eq!(s.current_result().unwrap().output, "Hi!");
        assert_eq!(s.last_assistant_reply(), Some("Hi!"));
    }

    #[tokio::test]
    async fn test_dangerous_call_takes_priority() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![LlmResponse::tool_calls(vec![
            call("c1", "calculator", json!({"expression": "1+1"})),
            call("c2", "shell", json!({"command": "echo hi"})),
            call("c3", "shell", json!({"command": "echo again"})),
        ])]));
        let ex = StepExecutor::new(llm, tools());
        let mut s = session_with(complex_plan(&[("run it", &["shell"])]));
        let out = ex.execute(&mut s, &[Message::user("run")], &EventSink::none()).await;
        let ExecOutcome::AwaitingApproval(p) = out else {
            panic!("expected pending approval");
        };
        assert_eq!(p.tool_call_id, "c2");
        assert_eq!(s.pending_tool_call.as_ref(), Some(&p));
        // 什么都没执行
        assert!(s.step_results.is_empty());
        assert!(s.turn_messages.iter().all(|m| m.tool_call_id.is_none()));
    }

    #[tokio::test]
    async fn test_safe_tools_run_and_failures_are_collected() {
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![LlmResponse::tool_calls(vec![
            call("c1", "calculator", json!({"expression": "6*7"})),
            call("c2", "calculator", json!({"expression": "1/0"})),
            call("c3", "ghost", json!({})),
        ])]));
        let ex = StepExecutor::new(llm, tools());
        let mut s = session_with(complex_plan(&[("compute", &["calculator"])]));
        let out = ex.execute(&mut s, &[Message::user("compute")], &EventSink::none()).await;
        assert_eq!(out, ExecOutcome::StepDone { success: true });
        let r = s.current_result().unwrap();
        assert!(r.from_tools);
        assert!(r.output.contains("[calculator] 42"));
        assert!(r.output.contains("Division by zero"));
        assert!(r.output.contains("Unknown tool"));
        let results = s.turn_messages.iter().filter(|m| m.tool_call_id.is_some()).count();
        assert_eq!(results, 3);
    }

    #[tokio::test]
    async fn test_model_error_becomes_failed_result() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Timeout(5))]));
        let ex = StepExecutor::new(llm, tools());
        let mut s = session_with(complex_plan(&[("do", &[])]));
        let out = ex.execute(&mut s, &[Message::user("do")], &EventSink::none()).await;
        assert_eq!(out, ExecOutcome::StepDone { success: false });
        assert!(s.current_result().unwrap().error.as_deref().unwrap().contains("timed out"));
        assert!(s.last_error.is_none());
    }

    #[tokio::test]
    async fn test_retry_ceiling_and_exhausted_plan() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![]));
        let ex = StepExecutor::new(llm.clone(), tools()).with_limits(2, 500, 4000);
        let mut s = session_with(complex_plan(&[("do", &[])]));
        let mut failed = StepResult::failure(1, "x");
        failed.retries = 2;
        s.step_results.insert(1, failed);
        let out = ex.execute(&mut s, &[], &EventSink::none()).await;
        assert_eq!(out, ExecOutcome::RetriesExhausted);
        assert!(s.last_error.is_some());

        s.step_index = 1;
        assert_eq!(ex.execute(&mut s, &[], &EventSink::none()).await, ExecOutcome::Completed);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rejection_is_failed_result() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![]));
        let ex = StepExecutor::new(llm, tools());
        let mut s = session_with(complex_plan(&[("run", &["shell"])]));
        s.pending_tool_call = Some(PendingToolCall {
            tool_call_id: "c9".into(),
            tool_name: "shell".into(),
            arguments: json!({"command": "echo hi"}),
            step_id: 1,
        });
        let out = ex
            .resolve_approval(&mut s, &ApprovalVerdict::reject("rejected by user"), &EventSink::none())
            .await;
        assert_eq!(out, ExecOutcome::StepDone { success: false });
        assert!(s.pending_tool_call.is_none());
        let r = s.current_result().unwrap();
        assert!(r.error.as_deref().unwrap().contains("rejected"));
        assert_eq!(s.turn_messages.last().unwrap().tool_call_id.as_deref(), Some("c9"));
    }

    #[test]
    fn test_omit_tools_heuristic() {
        let plan = complex_plan(&[("list files", &["list_dir"]), ("Summarize findings", &[]), ("write it", &[])]);
        assert!(!omit_tools(&plan, &plan.steps[0]));
        assert!(omit_tools(&plan, &plan.steps[1]));
        assert!(omit_tools(&plan, &plan.steps[2]));
        let single = Plan::single_step("fix the build");
        assert!(!omit_tools(&single, &single.steps[0]));
    }
}
