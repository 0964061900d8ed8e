//! 构建器：按配置组装 LLM、工具、记忆与 TurnDriver，得到可直接使用的 SessionManager
//!
//! CLI 与测试共用同一套组装逻辑；测试通过 with_llm / with_store / with_approval_gate 注入替身。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{ApprovalGate, Planner, Reflector, StaticApprovalGate, StepExecutor, TurnDriver};
use crate::config::AppConfig;
use crate::core::{AgentError, SessionManager};
use crate::llm::{
    create_deepseek_client, deepseek_api_key, LlmClient, MockLlmClient, OpenAiClient,
    TimeoutLlmClient,
};
use crate::memory::{MemoryStore, SlidingWindow, SnapshotStore, SqliteMemoryStore, Summarizer};
use crate::tools::{
    CalculatorTool, ListDirTool, ReadFileTool, ShellTool, ToolExecutor, ToolRegistry, WebFetchTool,
    WriteFileTool,
};

/// 按 provider 与可用 API Key 选择后端；都没有时回退到 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM (configured)");
        return Arc::new(MockLlmClient);
    }

    let client: Arc<dyn LlmClient> = if let Some(key) = deepseek_api_key(&provider) {
        let client = create_deepseek_client(&cfg.llm, &key);
        tracing::info!(model = %client.model(), "Using DeepSeek LLM");
        Arc::new(client)
    } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        tracing::info!(model = %cfg.llm.model, "Using OpenAI LLM");
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            Some(key.as_str()),
        ))
    } else {
        tracing::warn!("No API key set, using Mock LLM");
        return Arc::new(MockLlmClient);
    };
    Arc::new(TimeoutLlmClient::new(client, cfg.llm.timeouts.request))
}

pub struct AgentBuilder {
    config: AppConfig,
    workspace: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn MemoryStore>>,
    approval: Option<Arc<dyn ApprovalGate>>,
    sessions_dir: Option<PathBuf>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            llm: None,
            store: None,
            approval: None,
            sessions_dir: None,
        }
    }

    /// 注入 LLM 客户端（测试用 ScriptedLlmClient）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    /// 覆盖快照目录（默认取 [memory] sessions_dir）
    pub fn with_sessions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sessions_dir = Some(dir.into());
        self
    }

    /// 内置工具；危险分类 = 工具自身分类 ∪ 配置 [tools] dangerous
    pub fn build_tool_registry(&self) -> ToolRegistry {
        let tools_cfg = &self.config.tools;
        let mut tools = ToolRegistry::new();
        tools.register(ReadFileTool::new(&self.workspace));
        tools.register(ListDirTool::new(&self.workspace));
        tools.register(WriteFileTool::new(&self.workspace));
        tools.register(
            ShellTool::new(tools_cfg.shell.allowed_commands.clone(), tools_cfg.tool_timeout_secs)
                .with_working_dir(&self.workspace),
        );
        tools.register(WebFetchTool::new(
            tools_cfg.search.allowed_domains.clone(),
            tools_cfg.search.timeout_secs,
            tools_cfg.search.max_result_chars,
        ));
        tools.register(CalculatorTool);
        tools.mark_dangerous(tools_cfg.dangerous.iter().cloned());
        tools
    }

    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        self.llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config))
    }

    pub fn build_store(&self) -> Result<Arc<dyn MemoryStore>, AgentError> {
        if let Some(store) = &self.store {
            return Ok(Arc::clone(store));
        }
        Ok(Arc::new(SqliteMemoryStore::open(&self.config.memory.db_path)?))
    }

    pub fn build_driver(&self, llm: Arc<dyn LlmClient>, snapshots: SnapshotStore) -> TurnDriver {
        let agent = &self.config.agent;
        let executor = ToolExecutor::new(self.build_tool_registry(), self.config.tools.tool_timeout_secs);
        let planner = Planner::new(llm.clone())
            .with_temperature(agent.planning_temperature)
            .with_max_tokens(self.config.llm.max_tokens);
        let step_executor = StepExecutor::new(llm.clone(), Arc::new(executor))
            .with_limits(agent.max_retries, agent.step_output_chars, agent.tool_output_chars)
            .with_temperature(self.config.llm.temperature)
            .with_max_tokens(self.config.llm.max_tokens);
        let reflector = Reflector::new(llm.clone(), agent.max_iterations, agent.max_retries)
            .with_temperature(agent.reflection_temperature);
        let approval = self.approval.clone().unwrap_or_else(|| {
            tracing::warn!("No approval gate configured, dangerous tools will be rejected");
            Arc::new(StaticApprovalGate::reject_all())
        });

        TurnDriver::new(planner, step_executor, reflector, approval, llm)
            .with_snapshots(snapshots)
            .with_approval_timeout(self.config.approval.timeout_secs.map(Duration::from_secs))
            .with_retry_backoff(Duration::from_millis(agent.retry_backoff_ms))
    }

    /// 组装完整的 SessionManager
    pub fn build(&self) -> Result<SessionManager, AgentError> {
        let memory = &self.config.memory;
        let llm = self.build_llm();
        let store = self.build_store()?;
        let snapshots = SnapshotStore::new(
            self.sessions_dir
                .clone()
                .unwrap_or_else(|| memory.sessions_dir.clone()),
        );
        let driver = self.build_driver(llm.clone(), snapshots.clone());
        let window = SlidingWindow::new(Arc::clone(&store), memory.window_size);
        let summarizer = Summarizer::new(
            Arc::clone(&store),
            llm,
            memory.window_size,
            memory.summary_threshold,
        );
        tracing::info!(
            workspace = %self.workspace.display(),
            window = memory.window_size,
            threshold = memory.summary_threshold,
            max_iterations = self.config.agent.max_iterations,
            "taskbee components ready"
        );
        Ok(SessionManager::new(Arc::new(driver), store, window, snapshots).with_summarizer(summarizer))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

/// 便捷函数：加载配置（失败时用默认值）并准备工作目录
pub fn create_agent_builder(config_path: Option<PathBuf>) -> AgentBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = config.app.workspace_root.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .map(|d| d.join("workspace"))
            .unwrap_or_else(|_| PathBuf::from("workspace"))
    });
    if let Err(e) = std::fs::create_dir_all(&workspace) {
        tracing::warn!(path = %workspace.display(), error = %e, "cannot create workspace");
    }
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    AgentBuilder::new(config, workspace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_registry_dangerous_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.tools.dangerous.push("web_fetch".into());
        let registry = AgentBuilder::new(cfg, dir.path().to_path_buf()).build_tool_registry();
        assert!(registry.is_dangerous("shell"));
        assert!(registry.is_dangerous("write_file"));
        assert!(registry.is_dangerous("web_fetch"));
        assert!(!registry.is_dangerous("calculator"));
        assert!(!registry.is_dangerous("read_file"));
        assert_eq!(registry.len(), 6);
    }

    #[tokio::test]
    async fn test_driver_uses_configured_planning_temperature() {
        use crate::agent::{EventSink, Session, SessionMode};
        use crate::llm::{LlmResponse, ScriptedLlmClient};
        use crate::memory::Message;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.agent.planning_temperature = 0.35;
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![
            LlmResponse::text("not a plan"),
            LlmResponse::text("done"),
        ]));
        let builder = AgentBuilder::new(cfg, dir.path().to_path_buf());
        let driver = builder.build_driver(llm.clone(), SnapshotStore::new(dir.path().join("sessions")));

        let mut session = Session::new("b", SessionMode::Agent);
        session.begin_turn(SessionMode::Agent);
        session.push_message(Message::user("summarize the release notes"));
        driver
            .run(&mut session, &[], &EventSink::none(), &CancellationToken::new())
            .await
            .unwrap();
        assert!((llm.calls()[0].temperature - 0.35).abs() < f32::EPSILON);
    }

    #[test]
    fn test_mock_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".into();
        let llm = create_llm_from_config(&cfg);
        assert_eq!(llm.token_usage(), (0, 0, 0));
    }
}
