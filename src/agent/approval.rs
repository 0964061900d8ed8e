//! 审批闸门：危险工具调用执行前挂起回合，等待人工给出批准 / 拒绝
//!
//! - PromptApprovalGate：从共享的行读取器读答复（CLI 用 stdin），无法识别的答复重新询问
//! - ChannelApprovalGate：请求通过 mpsc 发给前端，前端用 oneshot 回复
//! - StaticApprovalGate：固定批准或拒绝（脚本 / 测试）

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::agent::PendingToolCall;
use crate::core::AgentError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalVerdict {
    pub approved: bool,
    pub reason: Option<String>,
}

impl ApprovalVerdict {
    pub fn approve() -> Self {
        Self {
            approved: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// 阻塞直到得到裁决；前端不可用时返回 ApprovalUnavailable
    async fn request(&self, pending: &PendingToolCall) -> Result<ApprovalVerdict, AgentError>;
}

/// 归一化自由文本答复；无法识别返回 None
pub fn parse_verdict(input: &str) -> Option<bool> {
    let normalized = input
        .trim()
        .trim_start_matches('/')
        .trim_end_matches(['.', '!', '！', '。'])
        .to_lowercase();
    match normalized.as_str() {
        "yes" | "y" | "approve" | "approved" | "ok" | "allow" | "是" | "同意" | "好" => {
            Some(true)
        }
        "no" | "n" | "reject" | "deny" | "denied" | "cancel" | "否" | "拒绝" | "不" => {
            Some(false)
        }
        _ => None,
    }
}

/// 审批提示文本
pub fn describe_pending(pending: &PendingToolCall) -> String {
    let args = serde_json::to_string_pretty(&pending.arguments)
        .unwrap_or_else(|_| pending.arguments.to_string());
    format!(
        "Step {} wants to run dangerous tool '{}' with arguments:\n{}",
        pending.step_id, pending.tool_name, args
    )
}

pub type SharedLines<R> = Arc<Mutex<Lines<R>>>;

/// 共享 stdin 行读取器（REPL 与审批提示共用，避免两个读者抢输入）
pub fn shared_stdin() -> SharedLines<BufReader<Stdin>> {
    Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()))
}

pub struct PromptApprovalGate<R> {
    lines: SharedLines<R>,
}

pub type StdinApprovalGate = PromptApprovalGate<BufReader<Stdin>>;

impl<R> PromptApprovalGate<R> {
    pub fn new(lines: SharedLines<R>) -> Self {
        Self { lines }
    }
}

#[async_trait]
impl<R> ApprovalGate for PromptApprovalGate<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn request(&self, pending: &PendingToolCall) -> Result<ApprovalVerdict, AgentError> {
        println!("\n⚠ {}", describe_pending(pending));
        let mut lines = self.lines.lock().await;
        loop {
            println!("Approve? [yes/no]");
            let line = lines
                .next_line()
                .await?
                .ok_or_else(|| AgentError::ApprovalUnavailable("input closed".into()))?;
            match parse_verdict(&line) {
                Some(true) => return Ok(ApprovalVerdict::approve()),
                Some(false) => return Ok(ApprovalVerdict::reject("rejected by user")),
                None => println!("Please answer yes or no."),
            }
        }
    }
}

/// 发给前端的审批请求
pub struct ApprovalRequest {
    pub pending: PendingToolCall,
    pub respond: oneshot::Sender<ApprovalVerdict>,
}

#[derive(Clone)]
pub struct ChannelApprovalGate {
    tx: mpsc::Sender<ApprovalRequest>,
}

impl ChannelApprovalGate {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn request(&self, pending: &PendingToolCall) -> Result<ApprovalVerdict, AgentError> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(ApprovalRequest {
                pending: pending.clone(),
                respond,
            })
            .await
            .map_err(|_| AgentError::ApprovalUnavailable("approval receiver dropped".into()))?;
        rx.await
            .map_err(|_| AgentError::ApprovalUnavailable("approval request dropped unanswered".into()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StaticApprovalGate {
    approve: bool,
}

impl StaticApprovalGate {
    pub fn approve_all() -> Self {
        Self { approve: true }
    }

    pub fn reject_all() -> Self {
        Self { approve: false }
    }
}

#[async_trait]
impl ApprovalGate for StaticApprovalGate {
    async fn request(&self, _pending: &PendingToolCall) -> Result<ApprovalVerdict, AgentError> {
        Ok(if self.approve {
            ApprovalVerdict::approve()
        } else {
            ApprovalVerdict::reject("rejected by policy")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending() -> PendingToolCall {
        PendingToolCall {
            tool_call_id: "c1".into(),
            tool_name: "shell".into(),
            arguments: json!({"command": "ls"}),
            step_id: 1,
        }
    }

    #[test]
    fn test_parse_verdict() {
        for yes in ["yes", " Y ", "approve", "/approve", "OK!", "同意", "是"] {
            assert_eq!(parse_verdict(yes), Some(true), "{yes}");
        }
        for no in ["no", "N", "deny", "拒绝", "cancel."] {
            assert_eq!(parse_verdict(no), Some(false), "{no}");
        }
        assert_eq!(parse_verdict("maybe"), None);
        assert_eq!(parse_verdict(""), None);
    }

    #[tokio::test]
    async fn test_prompt_gate_reprompts_until_valid() {
        let reader = BufReader::new(&b"maybe\n\nno\n"[..]);
        let gate = PromptApprovalGate::new(Arc::new(Mutex::new(reader.lines())));
        let verdict = gate.request(&pending()).await.unwrap();
        assert!(!verdict.approved);
    }

    #[tokio::test]
    async fn test_prompt_gate_eof_is_unavailable() {
        let reader = BufReader::new(&b"hmm\n"[..]);
        let gate = PromptApprovalGate::new(Arc::new(Mutex::new(reader.lines())));
        let err = gate.request(&pending()).await.unwrap_err();
        assert!(matches!(err, AgentError::ApprovalUnavailable(_)));
    }

    #[tokio::test]
    async fn test_channel_gate_round_trip() {
        let (gate, mut rx) = ChannelApprovalGate::new(1);
        let frontend = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.pending.tool_name, "shell");
            req.respond.send(ApprovalVerdict::approve()).unwrap();
        });
        let verdict = gate.request(&pending()).await.unwrap();
        assert!(verdict.approved);
        frontend.await.unwrap();
    }
}
