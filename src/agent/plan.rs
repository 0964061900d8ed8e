//! Plan / Step / StepResult / Reflection 数据模型与解析
//!
//! 模型输出统一走 extract_json：```json 代码块、裸 JSON 或结构化输出对象都能解析；
//! 解析失败不报错，而是返回 Degraded 变体，由调用方按降级规则处理。

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// 查询分类：simple 走单次直答，complex 走工具增强执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Simple,
    Complex,
}

/// 复杂度估计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 从 1 开始，计划内稳定
    pub id: usize,
    pub description: String,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    pub status: StepStatus,
}

impl Step {
    pub fn new(id: usize, description: impl Into<String>, tools_needed: Vec<String>) -> Self {
        Self {
            id,
            description: description.into(),
            tools_needed,
            status: StepStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub query_kind: QueryKind,
    pub steps: Vec<Step>,
    pub complexity: Complexity,
    /// 对话类直答计划（未调用模型）
    #[serde(default)]
    pub direct_answer: bool,
}

impl Plan {
    /// 对话类输入：单步直答
    pub fn direct_answer(request: &str) -> Self {
        Self {
            goal: request.to_string(),
            query_kind: QueryKind::Simple,
            steps: vec![Step::new(1, format!("Reply directly to: {}", request), Vec::new())],
            complexity: Complexity::Simple,
            direct_answer: true,
        }
    }

    /// 降级计划：唯一一步就是原始请求
    pub fn single_step(request: &str) -> Self {
        Self {
            goal: request.to_string(),
            query_kind: QueryKind::Complex,
            steps: vec![Step::new(1, request, Vec::new())],
            complexity: Complexity::Moderate,
            direct_answer: false,
        }
    }

    pub fn is_simple(&self) -> bool {
        self.query_kind == QueryKind::Simple
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 按 0 基索引取步骤
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn set_status(&mut self, index: usize, status: StepStatus) {
        if let Some(step) = self.steps.get_mut(index) {
            step.status = status;
        }
    }

    /// 把还没开始的步骤标为 skipped（提前 finish 时）
    pub fn skip_pending(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Skipped;
            }
        }
    }

    /// 所有步骤都有成功的结果
    pub fn all_succeeded(&self, results: &StepResults) -> bool {
        !self.steps.is_empty()
            && self
                .steps
                .iter()
                .all(|s| results.get(&s.id).is_some_and(|r| r.success))
    }
}

/// 单步结果；重试时原地更新，retries 只增不减
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: usize,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    /// 输出来自工具结果拼接
    #[serde(default)]
    pub from_tools: bool,
    #[serde(default)]
    pub tool_calls: Vec<String>,
}

impl StepResult {
    pub fn success(step_id: usize, output: impl Into<String>) -> Self {
        Self {
            step_id,
            success: true,
            output: output.into(),
            error: None,
            retries: 0,
            from_tools: false,
            tool_calls: Vec::new(),
        }
    }

    pub fn failure(step_id: usize, error: impl Into<String>) -> Self {
        Self {
            step_id,
            success: false,
            output: String::new(),
            error: Some(error.into()),
            retries: 0,
            from_tools: false,
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tool_calls: Vec<String>) -> Self {
        self.from_tools = !tool_calls.is_empty();
        self.tool_calls = tool_calls;
        self
    }

    /// 给用户/下一步看的文本：成功取输出，失败取错误
    pub fn display_text(&self) -> &str {
        if self.success {
            &self.output
        } else {
            self.error.as_deref().unwrap_or("")
        }
    }
}

pub type StepResults = BTreeMap<usize, StepResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Retry,
    Finish,
    Error,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::Retry => "retry",
            Decision::Finish => "finish",
            Decision::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub assessment: String,
    pub success: bool,
    pub decision: Decision,
    pub reasoning: String,
    #[serde(default)]
    pub modification: Option<String>,
}

impl Reflection {
    /// 无模型调用的规则判定
    pub fn rule(decision: Decision, success: bool, reasoning: impl Into<String>) -> Self {
        let reasoning = reasoning.into();
        Self {
            assessment: reasoning.clone(),
            success,
            decision,
            reasoning,
            modification: None,
        }
    }
}

/// 模型输出的计划草稿（同时用于生成 JSON Schema）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanDraft {
    /// What the user ultimately wants
    pub goal: String,
    /// Ordered steps; one step for simple requests
    pub steps: Vec<StepDraft>,
    pub complexity: Complexity,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepDraft {
    pub description: String,
    /// Tool names this step may need; empty for pure reasoning/writing steps
    #[serde(default)]
    pub tools_needed: Vec<String>,
}

/// 模型输出的反思草稿
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReflectionDraft {
    pub assessment: String,
    pub success: bool,
    pub decision: Decision,
    pub reasoning: String,
    /// How to change the approach on retry, if anything
    #[serde(default)]
    pub modification: Option<String>,
}

impl From<ReflectionDraft> for Reflection {
    fn from(d: ReflectionDraft) -> Self {
        Self {
            assessment: d.assessment,
            success: d.success,
            decision: d.decision,
            reasoning: d.reasoning,
            modification: d.modification.filter(|m| !m.trim().is_empty()),
        }
    }
}

pub enum PlanParse {
    Parsed(Plan),
    Degraded { raw: String },
}

pub enum ReflectionParse {
    Parsed(Reflection),
    Degraded { raw: String },
}

pub fn plan_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(PlanDraft)).unwrap_or_default()
}

pub fn reflection_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(ReflectionDraft)).unwrap_or_default()
}

/// 从模型文本中提取 JSON：优先 ```json 代码块，其次第一个 '{' 到最后一个 '}'
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

fn decode<T: serde::de::DeserializeOwned>(
    structured: Option<&serde_json::Value>,
    text: &str,
) -> Option<T> {
    if let Some(value) = structured {
        if let Ok(v) = serde_json::from_value(value.clone()) {
            return Some(v);
        }
    }
    extract_json(text).and_then(|json| serde_json::from_str(json).ok())
}

/// 解析计划；空步骤或无法解析时降级
pub fn parse_plan(structured: Option<&serde_json::Value>, text: &str) -> PlanParse {
    let Some(draft) = decode::<PlanDraft>(structured, text) else {
        return PlanParse::Degraded { raw: text.to_string() };
    };
    let steps: Vec<Step> = draft
        .steps
        .into_iter()
        .filter(|s| !s.description.trim().is_empty())
        .enumerate()
        .map(|(i, s)| Step::new(i + 1, s.description.trim(), s.tools_needed))
        .collect();
    if steps.is_empty() {
        return PlanParse::Degraded { raw: text.to_string() };
    }
    let query_kind = if draft.complexity == Complexity::Simple && steps.len() == 1 {
        QueryKind::Simple
    } else {
        QueryKind::Complex
    };
    PlanParse::Parsed(Plan {
        goal: draft.goal,
        query_kind,
        steps,
        complexity: draft.complexity,
        direct_answer: false,
    })
}

pub fn parse_reflection(structured: Option<&serde_json::Value>, text: &str) -> ReflectionParse {
    match decode::<ReflectionDraft>(structured, text) {
        Some(draft) => ReflectionParse::Parsed(draft.into()),
        None => ReflectionParse::Degraded { raw: text.to_string() },
    }
}
