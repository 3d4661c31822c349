//! 持久化适配层
//!
//! SessionStore 只依赖 PersistenceAdapter；提供纯内存（无持久性）与 SQLite（见 sqlite.rs）两种实现。

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use super::types::{MessageWithParts, Session};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Join(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// 会话 → 消息 → Part 的存储接口；消息按时间戳（同时间戳按写入顺序）返回
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    async fn save_session(&self, session: &Session) -> Result<(), PersistenceError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, PersistenceError>;

    /// 删除会话及其全部消息
    async fn delete_session(&self, session_id: &str) -> Result<(), PersistenceError>;

    async fn list_sessions(&self) -> Result<Vec<Session>, PersistenceError>;

    /// 新增或整体覆盖一条消息（含 Part）
    async fn save_message(&self, message: &MessageWithParts) -> Result<(), PersistenceError>;

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageWithParts>, PersistenceError>;

    async fn get_messages(&self, session_id: &str)
        -> Result<Vec<MessageWithParts>, PersistenceError>;

    async fn delete_message(&self, session_id: &str, message_id: &str)
        -> Result<(), PersistenceError>;

    async fn delete_messages(&self, session_id: &str) -> Result<(), PersistenceError>;

    async fn clear(&self) -> Result<(), PersistenceError>;

    async fn flush(&self) -> Result<(), PersistenceError>;
}

/// 纯内存适配器：进程退出即丢失
#[derive(Default)]
pub struct MemoryAdapter {
    sessions: RwLock<HashMap<String, Session>>,
    /// session_id -> 按写入顺序的消息
    messages: RwLock<HashMap<String, Vec<MessageWithParts>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceAdapter for MemoryAdapter {
    async fn save_session(&self, session: &Session) -> Result<(), PersistenceError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), PersistenceError> {
        self.sessions.write().await.remove(session_id);
        self.messages.write().await.remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, PersistenceError> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn save_message(&self, message: &MessageWithParts) -> Result<(), PersistenceError> {
        let mut messages = self.messages.write().await;
        let log = messages.entry(message.info.session_id.clone()).or_default();
        match log.iter_mut().find(|m| m.info.id == message.info.id) {
            Some(existing) => *existing = message.clone(),
            None => log.push(message.clone()),
        }
        Ok(())
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageWithParts>, PersistenceError> {
        Ok(self
            .messages
            .read()
            .await
            .get(session_id)
            .and_then(|log| log.iter().find(|m| m.info.id == message_id).cloned()))
    }

    async fn get_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageWithParts>, PersistenceError> {
        let mut log = self
            .messages
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        // 稳定排序，同时间戳保持写入顺序
        log.sort_by_key(|m| m.info.created_at);
        Ok(log)
    }

    async fn delete_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<(), PersistenceError> {
        if let Some(log) = self.messages.write().await.get_mut(session_id) {
            log.retain(|m| m.info.id != message_id);
        }
        Ok(())
    }

    async fn delete_messages(&self, session_id: &str) -> Result<(), PersistenceError> {
        self.messages.write().await.remove(session_id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        self.sessions.write().await.clear();
        self.messages.write().await.clear();
        Ok(())
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
