//! Planner：用户请求 → 结构化 Plan
//!
//! 先用正则识别对话类输入（问候 / 致谢 / 身份 / 确认），命中则直接产出单步直答计划，不调模型；
//! 否则带工具说明调用一次模型要求结构化输出，解析失败降级为「原始请求」单步计划。

use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::agent::plan::{parse_plan, plan_schema, Plan, PlanParse};
use crate::agent::Session;
use crate::core::AgentError;
use crate::llm::{CompletionOptions, LlmClient};
use crate::memory::{last_user_content, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationalKind {
    Greeting,
    Thanks,
    Identity,
    Acknowledgment,
}

const TRAILING: &str = r"[\s!！.。,，~～?？]*$";

fn patterns() -> &'static [(ConversationalKind, Regex)] {
    static PATTERNS: OnceLock<Vec<(ConversationalKind, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                ConversationalKind::Greeting,
                r"^(hi|hello|hey|yo|howdy|greetings|good (morning|afternoon|evening)|你好|您好|嗨|哈喽|早上好|晚上好)( there| all| everyone)?",
            ),
            (
                ConversationalKind::Thanks,
                r"^(thanks|thank you|thx|ty|many thanks|谢谢|多谢|感谢|谢啦)( (so|very) much| a lot)?( 你)?",
            ),
            (
                ConversationalKind::Identity,
                r"^(who are you|what are you|what is your name|what's your name|你是谁|你叫什么(名字)?|你是什么)",
            ),
            (
                ConversationalKind::Acknowledgment,
                r"^(ok|okay|k|sure|got it|cool|great|nice|alright|好的|好|嗯|收到|明白了?|知道了)",
            ),
        ]
        .into_iter()
        .filter_map(|(kind, p)| {
            Regex::new(&format!("(?i){}{}", p, TRAILING))
                .ok()
                .map(|r| (kind, r))
        })
        .collect()
    })
}

/// 对话类输入识别；大小写不敏感，容忍结尾标点
pub fn classify_conversational(text: &str) -> Option<ConversationalKind> {
    let text = text.trim();
    patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
}

const PLANNING_PROMPT: &str = "You are the planning module of a task agent. \
Break the user's latest request into a short ordered list of concrete steps (at most 6). \
Use one step with complexity \"simple\" when the request can be answered directly without tools. \
For each step list the tool names it may need (empty for pure reasoning or writing). \
Respond with a JSON object only: {\"goal\": string, \"complexity\": \"simple\"|\"moderate\"|\"complex\", \
\"steps\": [{\"description\": string, \"tools_needed\": [string]}]}.";

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    temperature: f32,
    max_tokens: Option<u32>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            temperature: 0.2,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// 产出本回合计划；context 为窗口消息 + 本回合用户消息。成功时迭代数 +1
    pub async fn plan(
        &self,
        session: &mut Session,
        context: &[Message],
        tool_descriptions: &str,
    ) -> Result<Plan, AgentError> {
        let request = last_user_content(context)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(AgentError::NoUserInput)?
            .to_string();

        if let Some(kind) = classify_conversational(&request) {
            tracing::info!(session_id = %session.id, kind = ?kind, "conversational input, direct answer plan");
            session.bump_iteration();
            return Ok(Plan::direct_answer(&request));
        }

        let mut system = PLANNING_PROMPT.to_string();
        if !tool_descriptions.is_empty() {
            system.push_str("\n\nAvailable tools:\n");
            system.push_str(tool_descriptions);
        }
        let mut messages = vec![Message::system(system)];
        messages.extend(context.iter().cloned());

        let options = CompletionOptions::default()
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_structured("plan", plan_schema());
        tracing::debug!(session_id = %session.id, "planning request");
        let response = self.llm.complete(&messages, &options).await?;
        session.bump_iteration();

        let plan = match parse_plan(response.structured.as_ref(), response.text_or_empty()) {
            PlanParse::Parsed(plan) => plan,
            PlanParse::Degraded { raw } => {
                tracing::warn!(
                    session_id = %session.id,
                    raw = %crate::memory::truncate_chars(&raw, 200),
                    "plan output not parseable, degrading to single step"
                );
                Plan::single_step(&request)
            }
        };
        tracing::info!(
            session_id = %session.id,
            steps = plan.len(),
            simple = plan.is_simple(),
            "plan created"
        );
        Ok(plan)
    }
}
