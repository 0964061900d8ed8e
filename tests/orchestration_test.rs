//! 编排集成测试：SessionManager + TurnDriver + 内存存储 + 脚本化 LLM

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use taskbee::agent::{
        ApprovalGate, ApprovalVerdict, ChannelApprovalGate, Decision, SessionMode,
        StaticApprovalGate,
    };
    use taskbee::config::AppConfig;
    use taskbee::core::{AgentBuilder, AgentError, SessionManager, TurnPhase};
    use taskbee::llm::{LlmError, LlmResponse, ScriptedLlmClient};
    use taskbee::memory::{
        InMemoryMemoryStore, MemoryStore, MessageQuery, Role, SnapshotStore, ToolCall,
    };
    use tempfile::TempDir;

    struct Harness {
        manager: SessionManager,
        store: Arc<InMemoryMemoryStore>,
        llm: Arc<ScriptedLlmClient>,
        dir: TempDir,
    }

    fn build(
        dir: &TempDir,
        store: Arc<InMemoryMemoryStore>,
        llm: Arc<ScriptedLlmClient>,
        gate: Arc<dyn ApprovalGate>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> SessionManager {
        let mut cfg = AppConfig::default();
        cfg.memory.sessions_dir = dir.path().join("sessions");
        tweak(&mut cfg);
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        AgentBuilder::new(cfg, workspace)
            .with_llm(llm)
            .with_store(store as Arc<dyn MemoryStore>)
            .with_approval_gate(gate)
            .build()
            .unwrap()
    }

    fn harness(
        script: Vec<Result<LlmResponse, LlmError>>,
        gate: Arc<dyn ApprovalGate>,
        tweak: impl FnOnce(&mut AppConfig),
    ) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryMemoryStore::new());
        let llm = Arc::new(ScriptedLlmClient::new(script));
        let manager = build(&dir, store.clone(), llm.clone(), gate, tweak);
        Harness {
            manager,
            store,
            llm,
            dir,
        }
    }

    fn shell_plan() -> LlmResponse {
        LlmResponse::structured(json!({
            "goal": "print hello from the shell",
            "complexity": "moderate",
            "steps": [{"description": "run echo hello in the shell", "tools_needed": ["shell"]}]
        }))
    }

    fn shell_call(id: &str) -> LlmResponse {
        LlmResponse::tool_calls(vec![ToolCall {
            id: id.into(),
            name: "shell".into(),
            arguments: json!({"command": "echo hello"}),
        }])
    }

    /// 每个带工具调用的 assistant 消息之后都有对应的 tool_result
    async fn assert_tool_protocol(store: &InMemoryMemoryStore, session_id: &str) {
        let messages = store
            .get_messages(session_id, &MessageQuery::default())
            .await
            .unwrap();
        for m in messages.iter().filter(|m| m.has_tool_calls()) {
            for call in &m.tool_calls {
                assert!(
                    messages
                        .iter()
                        .any(|r| r.role == Role::ToolResult && r.tool_call_id.as_deref() == Some(call.id.as_str())),
                    "tool call {} has no result",
                    call.id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_greeting_gets_direct_reply() {
        let h = harness(
            vec![Ok(LlmResponse::text("Hi! How can I help?"))],
            Arc::new(StaticApprovalGate::approve_all()),
            |_| {},
        );
        let resp = h.manager.chat("s1", SessionMode::Agent, "hello").await.unwrap();

        assert_eq!(resp.decision, Decision::Finish);
        assert_eq!(resp.response, "Hi! How can I help?");
        assert_eq!(resp.iterations, 1);
        assert!(resp.plan.as_ref().unwrap().is_simple());
        assert!(resp.error.is_none());
        // 只有直答一次调用，且不绑定工具
        assert_eq!(h.llm.call_count(), 1);
        assert!(h.llm.calls()[0].tool_names.is_empty());
        assert_eq!(h.store.get_message_count("s1", false).await.unwrap(), 2);

        let snapshot = h.manager.session_snapshot("s1").await.unwrap().unwrap();
        assert_eq!(snapshot.message_count, 2);
        assert_eq!(snapshot.phase, TurnPhase::Terminal);
        assert!(snapshot.turn_messages.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_dangerous_call_never_finishes() {
        let h = harness(
            vec![
                Ok(shell_plan()),
                Ok(shell_call("call_1")),
                Ok(LlmResponse::text("no json here")),
                Ok(shell_call("call_2")),
                Ok(LlmResponse::text("no json here")),
                Ok(shell_call("call_3")),
                Ok(LlmResponse::text("no json here")),
            ],
            Arc::new(StaticApprovalGate::reject_all()),
            |_| {},
        );
        let resp = h
            .manager
            .chat("s2", SessionMode::Agent, "run `echo hello` in the shell")
            .await
            .unwrap();

        assert_eq!(resp.decision, Decision::Error);
        assert!(resp.error.is_some());
        let results = resp.step_results.unwrap();
        let r = results.get(&1).unwrap();
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("rejected"));
        assert_eq!(r.retries, 3);
        assert_eq!(h.llm.remaining(), 0);

        let snapshot = h.manager.session_snapshot("s2").await.unwrap().unwrap();
        assert!(snapshot.pending_tool_call.is_none());
        assert_tool_protocol(&h.store, "s2").await;
    }

    #[tokio::test]
    async fn test_pending_approval_survives_restart() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(InMemoryMemoryStore::new());

        // 审批前端不可用：回合挂起，待审批调用留在快照里
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![shell_plan(), shell_call("call_1")]));
        let (gate, rx) = ChannelApprovalGate::new(1);
        drop(rx);
        let first = build(&dir, store.clone(), llm, Arc::new(gate), |_| {});
        let err = first
            .chat("s3", SessionMode::Agent, "run `echo hello` in the shell")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ApprovalUnavailable(_)));
        let err = first
            .chat("s3", SessionMode::Agent, "something else")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::PendingApproval(_)));
        assert_eq!(store.get_message_count("s3", false).await.unwrap(), 0);

        let saved = SnapshotStore::new(dir.path().join("sessions"))
            .load("s3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.phase, TurnPhase::AwaitingApproval);
        assert_eq!(saved.pending_tool_call.as_ref().unwrap().tool_call_id, "call_1");
        let listed = first.list_sessions().await.unwrap();
        assert!(listed.iter().any(|i| i.id == "s3" && i.pending_approval));
        drop(first);

        // 重启后 resume：重新出示审批并完成回合
        let llm = Arc::new(ScriptedLlmClient::from_responses(vec![LlmResponse::text(
            "The shell printed hello.",
        )]));
        let second = build(
            &dir,
            store.clone(),
            llm,
            Arc::new(StaticApprovalGate::approve_all()),
            |_| {},
        );
        let resp = second.resume("s3").await.unwrap().unwrap();
        assert_eq!(resp.decision, Decision::Finish);
        assert_eq!(resp.response, "The shell printed hello.");
        let r = resp.step_results.unwrap().remove(&1).unwrap();
        assert!(r.success);
        assert!(r.output.contains("hello"));

        // user、带调用的 assistant、tool_result、最终回复
        assert_eq!(store.get_message_count("s3", false).await.unwrap(), 4);
        assert_tool_protocol(&store, "s3").await;
        assert!(second.resume("s3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_message_while_busy_is_rejected() {
        let (gate, mut rx) = ChannelApprovalGate::new(1);
        let h = harness(
            vec![Ok(shell_plan()), Ok(shell_call("call_1"))],
            Arc::new(gate),
            |_| {},
        );
        let manager = Arc::new(h.manager);

        let running = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .chat("busy", SessionMode::Agent, "run `echo hello` in the shell")
                    .await
            })
        };
        let request = rx.recv().await.unwrap();
        assert_eq!(request.pending.tool_name, "shell");

        let err = manager.chat("busy", SessionMode::Agent, "hello").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionBusy(_)));
        let err = manager.delete_session("busy").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionBusy(_)));

        // 其他会话不受影响
        let other = manager.chat("other", SessionMode::Agent, "hello").await.unwrap();
        assert_eq!(other.decision, Decision::Finish);

        request
            .respond
            .send(ApprovalVerdict::reject("not now"))
            .unwrap();
        let resp = running.await.unwrap().unwrap();
        // 拒绝后重试一次，脚本耗尽后模型直接给出文本，步骤成功
        assert_eq!(resp.decision, Decision::Finish);
        let r = resp.step_results.unwrap().remove(&1).unwrap();
        assert!(r.success);
        assert_eq!(r.retries, 1);
    }

    #[tokio::test]
    async fn test_background_summary_keeps_window_bounded() {
        let h = harness(vec![], Arc::new(StaticApprovalGate::approve_all()), |cfg| {
            cfg.memory.window_size = 4;
            cfg.memory.summary_threshold = 6;
        });
        for _ in 0..4 {
            h.manager.chat("s4", SessionMode::Agent, "hello").await.unwrap();
        }
        let mut summary = None;
        for _ in 0..200 {
            summary = h.store.get_summary("s4").await.unwrap();
            if summary.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let summary = summary.expect("summary written in background");
        assert_eq!(summary.covered_count, 4);
        assert_eq!(h.store.get_message_count("s4", false).await.unwrap(), 8);
        assert_eq!(h.store.get_message_count("s4", true).await.unwrap(), 4);

        // 下一回合的上下文带上摘要
        h.manager.chat("s4", SessionMode::Agent, "thanks").await.unwrap();
        let last = h.llm.calls().pop().unwrap();
        assert!(last
            .messages
            .iter()
            .any(|m| m.role == Role::System && m.content.starts_with("Summary of the earlier conversation")));
        let history: Vec<_> = last.messages.iter().filter(|m| m.role != Role::System).collect();
        assert_eq!(history.len(), 5);
    }

    #[tokio::test]
    async fn test_chat_mode_uses_tools_without_plan() {
        let h = harness(
            vec![
                Ok(LlmResponse::tool_calls(vec![ToolCall {
                    id: "c1".into(),
                    name: "calculator".into(),
                    arguments: json!({"expression": "2 + 3"}),
                }])),
                Ok(LlmResponse::text("2 + 3 = 5")),
            ],
            Arc::new(StaticApprovalGate::approve_all()),
            |_| {},
        );
        let resp = h.manager.chat("s5", SessionMode::Chat, "what is 2 + 3?").await.unwrap();
        assert_eq!(resp.response, "2 + 3 = 5");
        assert_eq!(resp.iterations, 2);
        assert!(resp.plan.is_none());
        assert!(resp.step_results.is_none());
        assert_eq!(h.store.get_message_count("s5", false).await.unwrap(), 4);
        assert_tool_protocol(&h.store, "s5").await;
    }

    #[tokio::test]
    async fn test_failed_planning_leaves_state_untouched() {
        let h = harness(
            vec![Err(LlmError::Provider("unreachable".into()))],
            Arc::new(StaticApprovalGate::approve_all()),
            |_| {},
        );
        let err = h
            .manager
            .chat("s6", SessionMode::Agent, "plan my week")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Llm(_)));
        assert_eq!(h.store.get_message_count("s6", false).await.unwrap(), 0);
        let snapshot = h.manager.session_snapshot("s6").await.unwrap().unwrap();
        assert_eq!(snapshot.message_count, 0);
        assert_eq!(snapshot.total_iterations, 0);
        assert!(snapshot.plan.is_none());

        let err = h.manager.chat("s6", SessionMode::Agent, "   ").await.unwrap_err();
        assert!(matches!(err, AgentError::NoUserInput));

        // 之后的回合照常
        let resp = h.manager.chat("s6", SessionMode::Agent, "hello").await.unwrap();
        assert_eq!(resp.decision, Decision::Finish);
    }

    #[tokio::test]
    async fn test_delete_session_removes_everything() {
        let h = harness(vec![], Arc::new(StaticApprovalGate::approve_all()), |_| {});
        h.manager.chat("gone", SessionMode::Agent, "hello").await.unwrap();
        assert_eq!(h.manager.list_sessions().await.unwrap().len(), 1);

        assert!(h.manager.delete_session("gone").await.unwrap());
        assert!(h.manager.list_sessions().await.unwrap().is_empty());
        assert_eq!(h.store.get_message_count("gone", false).await.unwrap(), 0);
        assert!(h.manager.session_snapshot("gone").await.unwrap().is_none());
        assert!(!h.manager.delete_session("gone").await.unwrap());
        assert!(h.dir.path().join("sessions").exists());
    }

    #[tokio::test]
    async fn test_invalid_session_id() {
        let h = harness(vec![], Arc::new(StaticApprovalGate::approve_all()), |_| {});
        let err = h
            .manager
            .chat("../etc/passwd", SessionMode::Agent, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Storage(_)));
    }
}
