//! 会话存储：每个会话一份只追加的消息日志
//!
//! 写入顺序固定为「先持久化，再提交内存」，持久化失败时内存日志保持不变。
//! 同一会话的追加由会话级锁串行化，不同会话互不争用。
//! 流式响应的 reasoning/text 片段先进入临时缓冲区；正常完成 (`complete_stream`)
//! 与中断 (`interrupt`) 都原子地取走缓冲区，因此一轮对话只会有其中一条路径写入终态消息。

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::adapter::{PersistenceAdapter, PersistenceError};
use super::types::{
    new_id, now_ms, MessageInfo, MessageWithParts, NewMessage, NewSession, Part, PartPayload,
    Session,
};

/// 中断时输出块的占位文本
pub const INTERRUPTED_RESPONSE: &str = "[Response interrupted]";
/// 中断后追加的用户侧标记消息
pub const INTERRUPT_MARKER: &str = "[Request interrupted by user]";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Message {message_id} not found in session {session_id}")]
    MessageNotFound {
        session_id: String,
        message_id: String,
    },

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

struct SessionLog {
    info: Session,
    messages: Vec<MessageWithParts>,
}

#[derive(Debug, Default, Clone)]
struct StreamBuffer {
    reasoning: String,
    text: String,
}

impl StreamBuffer {
    fn is_empty(&self) -> bool {
        self.reasoning.is_empty() && self.text.is_empty()
    }
}

/// 中断结果：可能写入的部分回复 + 必定写入的中断标记
#[derive(Debug, Clone)]
pub struct InterruptOutcome {
    pub partial: Option<MessageWithParts>,
    pub marker: MessageWithParts,
}

pub struct SessionStore {
    adapter: Arc<dyn PersistenceAdapter>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionLog>>>>,
    streams: parking_lot::Mutex<HashMap<String, StreamBuffer>>,
}

impl SessionStore {
    pub fn new(adapter: Arc<dyn PersistenceAdapter>) -> Self {
        Self {
            adapter,
            sessions: RwLock::new(HashMap::new()),
            streams: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_session(&self, new: NewSession) -> Result<Session, StoreError> {
        let now = now_ms();
        let directory = new.directory.unwrap_or_else(|| {
            std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| ".".to_string())
        });
        let session = Session {
            id: new_id("ses"),
            title: new.title,
            parent_id: new.parent_id,
            directory,
            summary: Default::default(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            metadata: new.metadata,
        };

        self.adapter.save_session(&session).await?;
        self.sessions.write().await.insert(
            session.id.clone(),
            Arc::new(Mutex::new(SessionLog {
                info: session.clone(),
                messages: Vec::new(),
            })),
        );
        tracing::debug!(session_id = %session.id, parent = ?session.parent_id, "session created");
        Ok(session)
    }

    /// 内存未命中时从适配器加载会话及其消息
    async fn log(&self, session_id: &str) -> Result<Arc<Mutex<SessionLog>>, StoreError> {
        if let Some(log) = self.sessions.read().await.get(session_id) {
            return Ok(Arc::clone(log));
        }

        let info = self
            .adapter
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let messages = self.adapter.get_messages(session_id).await?;

        let mut sessions = self.sessions.write().await;
        let log = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionLog { info, messages })));
        Ok(Arc::clone(log))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        match self.log(session_id).await {
            Ok(log) => Ok(Some(log.lock().await.info.clone())),
            Err(StoreError::SessionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 所有会话（按创建时间）；内存中的版本优先
    pub async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut by_id: HashMap<String, Session> = self
            .adapter
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let cached: Vec<Arc<Mutex<SessionLog>>> =
            self.sessions.read().await.values().cloned().collect();
        for log in cached {
            let info = log.lock().await.info.clone();
            by_id.insert(info.id.clone(), info);
        }

        let mut sessions: Vec<Session> = by_id.into_values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub async fn list_children(&self, parent_id: &str) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.adapter.delete_session(session_id).await?;
        self.sessions.write().await.remove(session_id);
        self.streams.lock().remove(session_id);
        tracing::debug!(session_id, "session deleted");
        Ok(())
    }

    pub async fn messages(&self, session_id: &str) -> Result<Vec<MessageWithParts>, StoreError> {
        let log = self.log(session_id).await?;
        let messages = log.lock().await.messages.clone();
        Ok(messages)
    }

    pub async fn message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<MessageWithParts, StoreError> {
        let log = self.log(session_id).await?;
        let guard = log.lock().await;
        guard
            .messages
            .iter()
            .find(|m| m.info.id == message_id)
            .cloned()
            .ok_or_else(|| StoreError::MessageNotFound {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            })
    }

    /// 追加一条消息；时间戳不早于该会话上一条消息
    pub async fn add_message(
        &self,
        session_id: &str,
        new: NewMessage,
        payloads: Vec<PartPayload>,
    ) -> Result<MessageWithParts, StoreError> {
        let log = self.log(session_id).await?;
        let mut guard = log.lock().await;

        let last = guard.messages.last().map_or(i64::MIN, |m| m.info.created_at);
        let created_at = now_ms().max(last);
        let message_id = new_id("msg");
        let message = MessageWithParts {
            info: MessageInfo {
                id: message_id.clone(),
                session_id: session_id.to_string(),
                parent_id: new.parent_id,
                role: new.role,
                agent: new.agent,
                model: new.model,
                created_at,
                metadata: new.metadata,
            },
            parts: payloads
                .into_iter()
                .map(|payload| Part {
                    id: new_id("prt"),
                    message_id: message_id.clone(),
                    session_id: session_id.to_string(),
                    payload,
                    created_at,
                    updated_at: created_at,
                })
                .collect(),
        };

        let mut info = guard.info.clone();
        info.message_count += 1;
        info.updated_at = info.updated_at.max(created_at);

        self.adapter.save_message(&message).await?;
        if let Err(e) = self.adapter.save_session(&info).await {
            if let Err(rollback) = self.adapter.delete_message(session_id, &message_id).await {
                tracing::warn!(session_id, error = %rollback, "failed to roll back message");
            }
            return Err(e.into());
        }

        guard.info = info;
        guard.messages.push(message.clone());
        Ok(message)
    }

    pub async fn add_user_message(
        &self,
        session_id: &str,
        text: impl Into<String>,
    ) -> Result<MessageWithParts, StoreError> {
        self.add_message(session_id, NewMessage::user(), vec![PartPayload::text(text)])
            .await
    }

    pub async fn add_assistant_message(
        &self,
        session_id: &str,
        text: impl Into<String>,
    ) -> Result<MessageWithParts, StoreError> {
        self.add_message(
            session_id,
            NewMessage::assistant(),
            vec![PartPayload::text(text)],
        )
        .await
    }

    /// 向已有消息追加一个 Part（流式构建 tool_call / tool_result 等）
    pub async fn append_part(
        &self,
        session_id: &str,
        message_id: &str,
        payload: PartPayload,
    ) -> Result<Part, StoreError> {
        let log = self.log(session_id).await?;
        let mut guard = log.lock().await;
        let idx = guard
            .messages
            .iter()
            .position(|m| m.info.id == message_id)
            .ok_or_else(|| StoreError::MessageNotFound {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            })?;

        let now = now_ms();
        let part = Part {
            id: new_id("prt"),
            message_id: message_id.to_string(),
            session_id: session_id.to_string(),
            payload,
            created_at: now,
            updated_at: now,
        };
        let mut updated = guard.messages[idx].clone();
        updated.parts.push(part.clone());

        self.adapter.save_message(&updated).await?;
        guard.messages[idx] = updated;
        Ok(part)
    }

    /// 打开（或重置）该会话的流式缓冲区
    pub fn begin_stream(&self, session_id: &str) {
        self.streams
            .lock()
            .insert(session_id.to_string(), StreamBuffer::default());
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.streams.lock().contains_key(session_id)
    }

    /// 仅在缓冲区已打开时追加；返回是否写入
    pub fn push_reasoning(&self, session_id: &str, fragment: &str) -> bool {
        match self.streams.lock().get_mut(session_id) {
            Some(buf) => {
                buf.reasoning.push_str(fragment);
                true
            }
            None => false,
        }
    }

    pub fn push_text(&self, session_id: &str, fragment: &str) -> bool {
        match self.streams.lock().get_mut(session_id) {
            Some(buf) => {
                buf.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    fn take_stream(&self, session_id: &str) -> Option<StreamBuffer> {
        self.streams.lock().remove(session_id)
    }

    /// 持久化失败时放回缓冲区，除非期间已开启了新的流；会话不存在时直接丢弃
    fn restore_stream(&self, session_id: &str, buffer: StreamBuffer, cause: &StoreError) {
        if matches!(cause, StoreError::SessionNotFound(_)) {
            return;
        }
        self.streams
            .lock()
            .entry(session_id.to_string())
            .or_insert(buffer);
    }

    /// 正常完成：取走缓冲区并写入 assistant 消息。
    /// 缓冲区不存在（已被中断取走）或为空时不写入。
    pub async fn complete_stream(
        &self,
        session_id: &str,
        new: NewMessage,
    ) -> Result<Option<MessageWithParts>, StoreError> {
        let Some(buffer) = self.take_stream(session_id) else {
            return Ok(None);
        };
        if buffer.is_empty() {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(2);
        if !buffer.reasoning.is_empty() {
            parts.push(PartPayload::reasoning(buffer.reasoning.clone()));
        }
        if !buffer.text.is_empty() {
            parts.push(PartPayload::text(buffer.text.clone()));
        }

        match self.add_message(session_id, new, parts).await {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                self.restore_stream(session_id, buffer, &e);
                Err(e)
            }
        }
    }

    /// 中断：保存已产生的部分输出，并追加中断标记
    pub async fn interrupt(&self, session_id: &str) -> Result<InterruptOutcome, StoreError> {
        let buffer = self.take_stream(session_id).unwrap_or_default();
        let interrupted = serde_json::json!({ "interrupted": true });

        let partial_parts = if !buffer.reasoning.is_empty() {
            let output = if buffer.text.is_empty() {
                INTERRUPTED_RESPONSE.to_string()
            } else {
                buffer.text.clone()
            };
            Some(vec![
                PartPayload::reasoning(buffer.reasoning.clone()),
                PartPayload::text(output),
            ])
        } else if !buffer.text.is_empty() {
            Some(vec![PartPayload::text(buffer.text.clone())])
        } else {
            None
        };

        let partial = match partial_parts {
            Some(parts) => {
                let new = NewMessage::assistant().with_metadata(interrupted.clone());
                match self.add_message(session_id, new, parts).await {
                    Ok(message) => Some(message),
                    Err(e) => {
                        self.restore_stream(session_id, buffer, &e);
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let marker = self
            .add_message(
                session_id,
                NewMessage::user().with_metadata(interrupted),
                vec![PartPayload::text(INTERRUPT_MARKER)],
            )
            .await?;

        tracing::info!(
            session_id,
            saved_partial = partial.is_some(),
            "session interrupted"
        );
        Ok(InterruptOutcome { partial, marker })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.adapter.flush().await?;
        Ok(())
    }
}
