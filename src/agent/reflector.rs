//! Reflector：根据最新步骤结果决定 continue / retry / finish / error
//!
//! 按顺序检查，命中即返回：
//! 1. 迭代上限 → error；2. 会话带未处理错误 → error；3. 全部步骤成功 → finish；
//! 计划已走完 → finish；4. simple 计划且当前步成功 → finish；5. 当前步还没有结果 → continue；
//! 6. 低温结构化模型调用；输出无法解析（或调用失败）时，步骤成功则 continue，否则 retry。

use std::sync::Arc;

use crate::agent::plan::{parse_reflection, reflection_schema, Decision, Reflection, ReflectionParse};
use crate::agent::Session;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::{truncate_chars, Message};

const REFLECTION_PROMPT: &str = "You review the outcome of one step of a task plan and decide what happens next. \
Decisions: \"continue\" (step is good enough, move on), \"retry\" (step failed or output is wrong, try again), \
\"finish\" (the user's goal is already achieved), \"error\" (the goal cannot be achieved). \
Respond with a JSON object only: {\"assessment\": string, \"success\": bool, \
\"decision\": \"continue\"|\"retry\"|\"finish\"|\"error\", \"reasoning\": string, \"modification\": string|null}.";

pub struct Reflector {
    llm: Arc<dyn LlmClient>,
    max_iterations: u32,
    max_retries: u32,
    temperature: f32,
    output_chars: usize,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmClient>, max_iterations: u32, max_retries: u32) -> Self {
        Self {
            llm,
            max_iterations,
            max_retries,
            temperature: 0.1,
            output_chars: 1500,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub async fn reflect(&self, session: &Session) -> Reflection {
        if session.iterations >= self.max_iterations {
            return Reflection::rule(
                Decision::Error,
                false,
                format!("iteration ceiling reached ({})", self.max_iterations),
            );
        }
        if let Some(err) = &session.last_error {
            return Reflection::rule(Decision::Error, false, format!("unhandled error: {}", err));
        }
        let Some(plan) = session.plan.as_ref() else {
            return Reflection::rule(Decision::Error, false, "no plan for this turn");
        };
        if plan.all_succeeded(&session.step_results) {
            return Reflection::rule(Decision::Finish, true, "all steps succeeded");
        }
        let Some(step) = session.current_step() else {
            // 只有最后一步成功才算完成；越过失败步骤的计划不能静默结束
            let last_ok = plan
                .steps
                .last()
                .and_then(|s| session.step_results.get(&s.id))
                .is_some_and(|r| r.success);
            return if last_ok {
                Reflection::rule(Decision::Finish, true, "plan exhausted")
            } else {
                Reflection::rule(Decision::Error, false, "plan exhausted with a failed step")
            };
        };
        let current = session.step_results.get(&step.id);
        if plan.is_simple() && current.is_some_and(|r| r.success) {
            return Reflection::rule(Decision::Finish, true, "simple request answered");
        }
        let Some(result) = current else {
            return Reflection::rule(Decision::Continue, false, "step not attempted yet");
        };

        let remaining: Vec<String> = plan
            .steps
            .iter()
            .skip(session.step_index + 1)
            .map(|s| format!("- Step {}: {}", s.id, s.description))
            .collect();
        let body = format!(
            "Goal: {}\nStep {}/{}: {}\nOutcome: {}\n{}\nRetries used: {}/{}\nRemaining steps:\n{}",
            plan.goal,
            step.id,
            plan.len(),
            step.description,
            if result.success { "succeeded" } else { "failed" },
            truncate_chars(result.display_text(), self.output_chars),
            result.retries,
            self.max_retries,
            if remaining.is_empty() {
                "(none)".to_string()
            } else {
                remaining.join("\n")
            }
        );
        let messages = vec![Message::system(REFLECTION_PROMPT), Message::user(body)];
        let options = CompletionOptions::default()
            .with_temperature(self.temperature)
            .with_structured("reflection", reflection_schema());

        let fallback = |why: &str| {
            let decision = if result.success {
                Decision::Continue
            } else {
                Decision::Retry
            };
            Reflection::rule(decision, result.success, why.to_string())
        };

        let response = match self.llm.complete(&messages, &options).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "reflection call failed");
                return fallback("reflection unavailable");
            }
        };
        match parse_reflection(response.structured.as_ref(), response.text_or_empty()) {
            ReflectionParse::Parsed(mut r) => {
                if !result.success && r.decision != Decision::Error && r.decision != Decision::Retry {
                    r.reasoning = format!(
                        "{} ({} downgraded to retry: current step failed)",
                        r.reasoning,
                        r.decision.as_str()
                    );
                    r.decision = Decision::Retry;
                }
                r
            }
            ReflectionParse::Degraded { raw } => {
                tracing::warn!(
                    session_id = %session.id,
                    raw = %truncate_chars(&raw, 200),
                    "reflection output not parseable"
                );
                fallback("reflection output not parseable")
            }
        }
    }

    /// 应用决定，返回最终生效的决定（retry 可能被降级为 error）
    pub fn apply(&self, session: &mut Session, reflection: Reflection) -> Decision {
        let mut decision = reflection.decision;
        match decision {
            Decision::Continue => {
                if session.current_result().is_some() {
                    session.step_index += 1;
                }
                session.last_error = None;
            }
            Decision::Retry => match session.current_step().map(|s| s.id) {
                Some(step_id) => {
                    let retries = session.retries_for(step_id);
                    if retries >= self.max_retries {
                        session.last_error =
                            Some(format!("step {} exhausted {} retries", step_id, retries));
                        decision = Decision::Error;
                    } else if let Some(r) = session.step_results.get_mut(&step_id) {
                        r.retries += 1;
                    }
                }
                None => decision = Decision::Error,
            },
            Decision::Finish => {
                if let Some(plan) = session.plan.as_mut() {
                    plan.skip_pending();
                }
            }
            Decision::Error => {
                if session.last_error.is_none() {
                    session.last_error = Some(reflection.reasoning.clone());
                }
            }
        }
        tracing::info!(
            session_id = %session.id,
            decision = decision.as_str(),
            reasoning = %reflection.reasoning,
            "reflection applied"
        );
        session.last_reflection = Some(reflection);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::{Complexity, Plan, QueryKind, Step, StepResult};
    use crate::agent::SessionMode;
    use crate::llm::{LlmError, LlmResponse, ScriptedLlmClient};
    use serde_json::json;

    fn two_step_session() -> Session {
        let mut s = Session::new("t", SessionMode::Agent);
        s.begin_turn(SessionMode::Agent);
        s.plan = Some(Plan {
            goal: "g".into(),
            query_kind: QueryKind::Complex,
            steps: vec![Step::new(1, "a", vec![]), Step::new(2, "b", vec![])],
            complexity: Complexity::Moderate,
            direct_answer: false,
        });
        s.iterations = 1;
        s
    }

    fn reflector(responses: Vec<Result<LlmResponse, LlmError>>) -> (Reflector, Arc<ScriptedLlmClient>) {
        let llm = Arc::new(ScriptedLlmClient::new(responses));
        (Reflector::new(llm.clone(), 10, 3), llm)
    }

    #[tokio::test]
    async fn test_rules_without_model_call() {
        let (r, llm) = reflector(vec![]);
        let mut s = two_step_session();

        assert_eq!(r.reflect(&s).await.decision, Decision::Continue);

        s.iterations = 10;
        assert_eq!(r.reflect(&s).await.decision, Decision::Error);
        s.iterations = 1;

        s.last_error = Some("boom".into());
        assert_eq!(r.reflect(&s).await.decision, Decision::Error);
        s.last_error = None;

        s.record_result(StepResult::success(1, "x"));
        s.record_result(StepResult::success(2, "y"));
        assert_eq!(r.reflect(&s).await.decision, Decision::Finish);

        let mut simple = Session::new("t2", SessionMode::Agent);
        simple.begin_turn(SessionMode::Agent);
        simple.plan = Some(Plan::direct_answer("hi"));
        simple.record_result(StepResult::success(1, "hello"));
        assert_eq!(r.reflect(&simple).await.decision, Decision::Finish);

        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_decision_and_downgrade() {
        let (r, llm) = reflector(vec![
            Ok(LlmResponse::structured(json!({
                "assessment": "fine", "success": true, "decision": "continue", "reasoning": "ok"
            }))),
            Ok(LlmResponse::structured(json!({
                "assessment": "meh", "success": false, "decision": "finish", "reasoning": "give up"
            }))),
        ]);
        let mut s = two_step_session();
        s.record_result(StepResult::success(1, "x"));
        let refl = r.reflect(&s).await;
        assert_eq!(refl.decision, Decision::Continue);
        assert_eq!(llm.calls()[0].structured.as_deref(), Some("reflection"));
        assert!((llm.calls()[0].temperature - 0.1).abs() < f32::EPSILON);

        let mut s = two_step_session();
        s.record_result(StepResult::failure(1, "bad"));
        assert_eq!(r.reflect(&s).await.decision, Decision::Retry);
    }

    #[tokio::test]
    async fn test_continue_on_failed_step_becomes_retry() {
        let (r, _) = reflector(vec![Ok(LlmResponse::structured(json!({
            "assessment": "rejected", "success": false, "decision": "continue", "reasoning": "move on"
        })))]);
        let mut s = two_step_session();
        s.record_result(StepResult::failure(1, "rejected by user"));
        let refl = r.reflect(&s).await;
        assert_eq!(refl.decision, Decision::Retry);
        assert_eq!(r.apply(&mut s, refl), Decision::Retry);
        assert_eq!(s.step_index, 0);
    }

    #[tokio::test]
    async fn test_exhausted_plan_with_failed_last_step_is_error() {
        let (r, llm) = reflector(vec![]);
        let mut s = two_step_session();
        s.record_result(StepResult::success(1, "x"));
        s.record_result(StepResult::failure(2, "bad"));
        s.step_index = 2;
        assert_eq!(r.reflect(&s).await.decision, Decision::Error);

        s.record_result(StepResult::success(2, "fixed"));
        assert_eq!(r.reflect(&s).await.decision, Decision::Finish);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_or_failed_model_output() {
        let (r, _) = reflector(vec![
            Ok(LlmResponse::text("not json")),
            Err(LlmError::Provider("down".into())),
        ]);
        let mut ok = two_step_session();
        ok.record_result(StepResult::success(1, "x"));
        assert_eq!(r.reflect(&ok).await.decision, Decision::Continue);

        let mut failed = two_step_session();
        failed.record_result(StepResult::failure(1, "x"));
        assert_eq!(r.reflect(&failed).await.decision, Decision::Retry);
    }

    #[test]
    fn test_apply_continue_retry_and_downgrade() {
        let (r, _) = reflector(vec![]);
        let mut s = two_step_session();

        // 未尝试的步骤 continue 不前进
        r.apply(&mut s, Reflection::rule(Decision::Continue, false, "x"));
        assert_eq!(s.step_index, 0);

        s.record_result(StepResult::failure(1, "bad"));
        for expected in 1..=3 {
            assert_eq!(r.apply(&mut s, Reflection::rule(Decision::Retry, false, "x")), Decision::Retry);
            assert_eq!(s.retries_for(1), expected);
        }
        assert_eq!(r.apply(&mut s, Reflection::rule(Decision::Retry, false, "x")), Decision::Error);
        assert_eq!(s.retries_for(1), 3);
        assert!(s.last_error.is_some());

        let mut s = two_step_session();
        s.record_result(StepResult::success(1, "ok"));
        s.last_error = Some("stale".into());
        assert_eq!(r.apply(&mut s, Reflection::rule(Decision::Continue, true, "x")), Decision::Continue);
        assert_eq!(s.step_index, 1);
        assert!(s.last_error.is_none());
    }
}
