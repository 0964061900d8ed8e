//! SQLite Memory Store
//!
//! rusqlite 是同步的：连接放在 Mutex 后面，每次查询都丢到 spawn_blocking，
//! 不阻塞 tokio 工作线程。两张表：messages（只追加）、summaries（每会话一行）。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::AgentError;
use crate::memory::store::{ConversationSummary, MemoryStore, MessageQuery, SortOrder};
use crate::memory::{Message, Role, ToolCall};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT,
    tool_call_id TEXT,
    created_at TEXT NOT NULL,
    summarized INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
CREATE TABLE IF NOT EXISTS summaries (
    session_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    covered_count INTEGER NOT NULL,
    last_message_id INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    /// 打开（或创建）数据库文件，父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AgentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AgentError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AgentError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AgentError::Storage("sqlite connection poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| AgentError::Storage(format!("blocking task failed: {}", e)))?
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get(1)?;
    let tool_calls: Option<String> = row.get(3)?;
    let tool_calls: Vec<ToolCall> = tool_calls
        .as_deref()
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default();
    Ok(Message {
        id: Some(row.get(0)?),
        role: Role::parse(&role),
        content: row.get(2)?,
        tool_calls,
        tool_call_id: row.get(4)?,
        created_at: row.get::<_, DateTime<Utc>>(5)?,
        summarized: row.get::<_, i64>(6)? != 0,
    })
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<i64, AgentError> {
        let session_id = session_id.to_string();
        let message = message.clone();
        self.run(move |conn| {
            let tool_calls = if message.tool_calls.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&message.tool_calls)?)
            };
            conn.execute(
                "INSERT INTO messages (session_id, role, content, tool_calls, tool_call_id, created_at, summarized)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    session_id,
                    message.role.as_str(),
                    message.content,
                    tool_calls,
                    message.tool_call_id,
                    message.created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        query: &MessageQuery,
    ) -> Result<Vec<Message>, AgentError> {
        let session_id = session_id.to_string();
        let query = query.clone();
        self.run(move |conn| {
            let filter = if query.exclude_summarized {
                " AND summarized = 0"
            } else {
                ""
            };
            let order = match query.order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            let limit = query.limit.map(|n| n as i64).unwrap_or(-1);
            let sql = format!(
                "SELECT id, role, content, tool_calls, tool_call_id, created_at, summarized
                 FROM messages WHERE session_id = ?1{} ORDER BY id {} LIMIT ?2 OFFSET ?3",
                filter, order
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![session_id, limit, query.offset as i64],
                row_to_message,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    async fn get_summary(&self, session_id: &str) -> Result<Option<ConversationSummary>, AgentError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let summary = conn
                .query_row(
                    "SELECT session_id, content, covered_count, last_message_id, updated_at
                     FROM summaries WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok(ConversationSummary {
                            session_id: row.get(0)?,
                            content: row.get(1)?,
                            covered_count: row.get::<_, i64>(2)? as usize,
                            last_message_id: row.get(3)?,
                            updated_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(summary)
        })
        .await
    }

    async fn save_summary(
        &self,
        session_id: &str,
        content: &str,
        covered_count: usize,
        last_message_id: i64,
    ) -> Result<(), AgentError> {
        let session_id = session_id.to_string();
        let content = content.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO summaries (session_id, content, covered_count, last_message_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(session_id) DO UPDATE SET
                 content = excluded.content,
                 covered_count = excluded.covered_count,
                 last_message_id = excluded.last_message_id,
                 updated_at = excluded.updated_at",
                params![session_id, content, covered_count as i64, last_message_id, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn mark_summarized(&self, ids: &[i64]) -> Result<(), AgentError> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare("UPDATE messages SET summarized = 1 WHERE id = ?1")?;
                for id in &ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_message_count(
        &self,
        session_id: &str,
        exclude_summarized: bool,
    ) -> Result<usize, AgentError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let sql = if exclude_summarized {
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND summarized = 0"
            } else {
                "SELECT COUNT(*) FROM messages WHERE session_id = ?1"
            };
            let n: i64 = conn.query_row(sql, params![session_id], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        let session_id = session_id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM messages WHERE session_id = ?1", params![session_id])?;
            tx.execute("DELETE FROM summaries WHERE session_id = ?1", params![session_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
