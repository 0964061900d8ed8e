//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / danger / execute），
//! 由 ToolRegistry 按名注册与查找；危险分级 = 工具自身静态分级 ∪ 配置中的 dangerous 列表。

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::ToolSpec;

/// 工具危险分级：dangerous 的工具执行前必须经过人工审批
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolDanger {
    Safe,
    Dangerous,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、危险分级、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 静态危险分级，默认 Safe
    fn danger(&self) -> ToolDanger {
        ToolDanger::Safe
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称有序存储（保证 prompt 中工具顺序稳定）
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    /// 配置追加的危险工具名
    dangerous_overrides: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// 将配置中列出的工具名标记为危险（不存在的名字也记录，注册晚于配置时同样生效）
    pub fn mark_dangerous<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dangerous_overrides
            .extend(names.into_iter().map(Into::into));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 是否需要审批；未注册的工具不算危险（执行时会以 Unknown tool 失败）
    pub fn is_dangerous(&self, name: &str) -> bool {
        if self.dangerous_overrides.contains(name) {
            return true;
        }
        self.tools
            .get(name)
            .map(|t| t.danger() == ToolDanger::Dangerous)
            .unwrap_or(false)
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 生成 prompt 中的工具说明段落（危险工具标注 requires approval）
    pub fn descriptions(&self) -> String {
        self.tools
            .iter()
            .map(|(name, tool)| {
                let flag = if self.is_dangerous(name) {
                    " [dangerous: requires human approval]"
                } else {
                    ""
                };
                format!("- {}: {}{}", name, tool.description(), flag)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 绑定给模型的工具列表
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|(name, tool)| ToolSpec {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}
