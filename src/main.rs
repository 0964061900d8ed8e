//! taskbee CLI
//!
//! 入口：初始化日志、按配置组装 SessionManager，运行行式 REPL。
//! REPL 与审批提示共用一个 stdin 行读取器；Ctrl+C 取消当前回合。

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use taskbee::agent::{shared_stdin, AgentEvent, EventSink, StdinApprovalGate};
use taskbee::core::create_agent_builder;
use taskbee::{observability, ChatResponse, SessionManager, SessionMode};
use tokio::sync::mpsc;

const HELP: &str = "Commands:
  /mode chat|agent   switch turn mode
  /session <id>      switch to (or create) a session
  /sessions          list saved sessions
  /delete <id>       delete a session and its history
  /resume            continue a turn waiting for approval
  /quit              exit";

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::PlanCreated { goal, steps, simple } => {
            if !simple {
                println!("  plan: {}", goal);
                for (i, s) in steps.iter().enumerate() {
                    println!("    {}. {}", i + 1, s);
                }
            }
        }
        AgentEvent::StepStarted { step_id, description } => {
            println!("  ▶ step {}: {}", step_id, description)
        }
        AgentEvent::ToolCall { tool, args } => println!("  ⚙ {} {}", tool, args),
        AgentEvent::Observation { tool, preview } => println!("  ← {}: {}", tool, preview),
        AgentEvent::StepFinished { step_id, success, .. } => {
            println!("  {} step {}", if *success { "✓" } else { "✗" }, step_id)
        }
        AgentEvent::Reflected { decision, reasoning } => {
            println!("  ↺ {} ({})", decision, reasoning)
        }
        AgentEvent::Error { text } => println!("  ! {}", text),
        _ => {}
    }
}

fn print_response(resp: &ChatResponse) {
    println!("\n{}\n", resp.response);
    match &resp.error {
        Some(e) => println!("[{} · {} iterations · error: {}]", resp.decision.as_str(), resp.iterations, e),
        None => println!("[{} · {} iterations]", resp.decision.as_str(), resp.iterations),
    }
}

async fn run_turn(
    manager: &SessionManager,
    session_id: &str,
    mode: SessionMode,
    input: Option<&str>,
    events: &EventSink,
) {
    let turn = async {
        match input {
            Some(text) => manager
                .chat_with_events(session_id, mode, text, events)
                .await
                .map(Some),
            None => manager.resume_with_events(session_id, events).await,
        }
    };
    tokio::pin!(turn);
    let result = tokio::select! {
        r = &mut turn => r,
        _ = tokio::signal::ctrl_c() => {
            manager.cancel_all();
            turn.await
        }
    };
    match result {
        Ok(Some(resp)) => print_response(&resp),
        Ok(None) => println!("Nothing to resume."),
        Err(e) => println!("Error: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let lines = shared_stdin();
    let gate = Arc::new(StdinApprovalGate::new(Arc::clone(&lines)));
    let manager = create_agent_builder(None)
        .with_approval_gate(gate)
        .build()
        .context("Failed to build taskbee")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });
    let events = EventSink::new(tx);

    let mut session_id = format!("cli-{}", uuid::Uuid::new_v4().simple());
    let mut mode = SessionMode::Agent;
    println!("taskbee · session {} · mode {} · /help for commands", session_id, mode);

    loop {
        print!("{}> ", mode);
        std::io::stdout().flush().ok();
        // 读完立刻释放锁，审批提示要用同一个读取器
        let line = { lines.lock().await.next_line().await? };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).unwrap_or_default();
        match command {
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/mode" => match arg.parse::<SessionMode>() {
                Ok(m) => {
                    mode = m;
                    println!("mode: {}", mode);
                }
                Err(e) => println!("{}", e),
            },
            "/session" if !arg.is_empty() => {
                session_id = arg.to_string();
                match manager.session_snapshot(&session_id).await {
                    Ok(Some(s)) => println!(
                        "session {} ({} messages{})",
                        s.id,
                        s.message_count,
                        if s.has_pending_approval() { ", pending approval: /resume" } else { "" }
                    ),
                    Ok(None) => println!("new session {}", session_id),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "/sessions" => match manager.list_sessions().await {
                Ok(list) if list.is_empty() => println!("no saved sessions"),
                Ok(list) => {
                    for info in list {
                        println!(
                            "{}  {}  {} messages  {} iterations{}  {}",
                            if info.id == session_id { "*" } else { " " },
                            info.id,
                            info.message_count,
                            info.total_iterations,
                            if info.pending_approval { "  [pending approval]" } else { "" },
                            info.updated_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                Err(e) => println!("Error: {}", e),
            },
            "/delete" if !arg.is_empty() => match manager.delete_session(arg).await {
                Ok(true) => println!("deleted {}", arg),
                Ok(false) => println!("no such session {}", arg),
                Err(e) => println!("Error: {}", e),
            },
            "/resume" => run_turn(&manager, &session_id, mode, None, &events).await,
            c if c.starts_with('/') => println!("unknown command\n{}", HELP),
            _ => run_turn(&manager, &session_id, mode, Some(line), &events).await,
        }
    }
    Ok(())
}
