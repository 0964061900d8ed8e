//! 会话快照：每个会话一个 JSON 文件（sessions_dir/<id>.json）
//!
//! 写入先落到临时文件再 rename，崩溃时不会留下半截快照。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;

use crate::agent::{Session, SessionMode};
use crate::core::AgentError;

/// 列表展示用的会话概要
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub mode: SessionMode,
    pub message_count: usize,
    pub total_iterations: u64,
    pub pending_approval: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            mode: s.mode,
            message_count: s.message_count,
            total_iterations: s.total_iterations,
            pending_approval: s.has_pending_approval(),
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

/// 会话 id 只允许字母数字、'-'、'_'，防止拼出目录外的路径
pub fn validate_session_id(id: &str) -> Result<(), AgentError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AgentError::Storage(format!("invalid session id: {:?}", id)))
    }
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, AgentError> {
        validate_session_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    pub async fn save(&self, session: &Session) -> Result<(), AgentError> {
        let path = self.path_for(&session.id)?;
        fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(session)?;
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, id: &str) -> Result<Option<Session>, AgentError> {
        let path = self.path_for(id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 按更新时间倒序；损坏的快照跳过并告警
    pub async fn list(&self) -> Result<Vec<SessionInfo>, AgentError> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<Session>(&data) {
                Ok(session) => out.push(SessionInfo::from(&session)),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable snapshot")
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    /// 删除快照；不存在时返回 false
    pub async fn delete(&self, id: &str) -> Result<bool, AgentError> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
