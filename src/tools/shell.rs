//! shell 工具：白名单命令 + 禁止子串，执行前必须经过人工审批
//!
//! 白名单只检查首词（命令名）；管道、重定向等由禁止子串兜底。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::{Tool, ToolDanger};

const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "| sh",
    "| bash",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/",
    "sudo ",
    ":(){",
];

pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
    working_dir: Option<PathBuf>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            allowed_commands: allowed_commands
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
            timeout_secs: timeout_secs.max(1),
            working_dir: None,
        }
    }

    /// 在工作区根目录下执行命令
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.to_lowercase();
        if let Some(pattern) = FORBIDDEN_SUBSTR.iter().find(|p| lower.contains(*p)) {
            return Err(format!("Forbidden pattern: {}", pattern));
        }
        let name = lower.split_whitespace().next().unwrap_or("");
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if !self.allowed_commands.contains(name) {
            return Err(format!("Command '{}' not in allowlist", name));
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run an allowlisted shell command in the workspace. Args: {\"command\": \"ls -la\"}."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Command line; the first word must be an allowlisted command"
                }
            },
            "required": ["command"]
        })
    }

    fn danger(&self) -> ToolDanger {
        ToolDanger::Dangerous
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.check(command)?;
        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout_secs))?
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(format!(
                "Exit code {}\nstderr: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }
        if stderr.trim().is_empty() {
            Ok(stdout.into_owned())
        } else {
            Ok(format!("{}\nstderr: {}", stdout.trim(), stderr.trim()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool() -> ShellTool {
        ShellTool::new(vec!["echo".into(), "ls".into(), "rm".into()], 5)
    }

    #[test]
    fn test_allowlist_and_forbidden() {
        let t = tool();
        assert!(t.check("echo hi").is_ok());
        assert!(t.check("cat /etc/passwd").unwrap_err().contains("not in allowlist"));
        assert!(t.check("rm -rf /").unwrap_err().contains("Forbidden"));
        assert!(t.check("   ").is_err());
    }

    #[test]
    fn test_shell_is_dangerous() {
        assert_eq!(tool().danger(), ToolDanger::Dangerous);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_runs() {
        let out = tool()
            .execute(serde_json::json!({"command": "echo taskbee"}))
            .await
            .unwrap();
        assert_eq!(out.trim(), "taskbee");
    }
}
