//! 记忆层：消息模型、Memory Store（SQLite / 内存）、滑动窗口、后台摘要、会话快照

pub mod conversation;
pub mod snapshot;
pub mod sqlite;
pub mod store;
pub mod summarizer;
pub mod window;

pub use conversation::{last_user_content, truncate_chars, Message, Role, ToolCall};
pub use snapshot::{validate_session_id, SessionInfo, SnapshotStore};
pub use sqlite::SqliteMemoryStore;
pub use store::{
    ConversationSummary, InMemoryMemoryStore, MemoryStore, MessageQuery, SortOrder,
};
pub use summarizer::{Summarizer, SummaryOutcome};
pub use window::{ContextWindow, SlidingWindow};
