//! 会话日志与持久化
//!
//! - types: Session / Message / Part 数据模型
//! - adapter: 持久化接口与内存实现
//! - sqlite: SQLite 持久化
//! - store: 只追加日志、流式缓冲与中断处理

pub mod adapter;
pub mod sqlite;
pub mod store;
pub mod types;

pub use adapter::{MemoryAdapter, PersistenceAdapter, PersistenceError};
pub use sqlite::SqliteAdapter;
pub use store::{InterruptOutcome, SessionStore, StoreError, INTERRUPTED_RESPONSE, INTERRUPT_MARKER};
pub use types::{
    MessageInfo, MessageWithParts, NewMessage, NewSession, Part, PartPayload, Role, Session,
    SessionId, SessionSummary,
};
