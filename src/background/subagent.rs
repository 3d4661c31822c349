//! 子智能体会话
//!
//! SubAgentManager 负责创建、执行、删除隔离的子会话；StoreSubAgentManager 基于
//! SessionStore 与 SessionAbortManager 实现，具体的 LLM 循环由 AgentRunner 提供。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::SessionAbortManager;
use crate::session::{NewMessage, NewSession, PartPayload, Session, SessionStore, StoreError};

pub type RunnerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SubAgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Sub-agent timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Sub-agent session {0} was aborted")]
    Aborted(String),

    #[error("Sub-agent failed: {0}")]
    Runner(String),
}

#[derive(Debug, Clone)]
pub struct SubSessionRequest {
    pub parent_session_id: String,
    pub title: String,
    pub subagent_type: String,
    pub description: String,
    /// 子智能体可用的工具；None 表示继承全部
    pub allowed_tools: Option<Vec<String>>,
}

#[async_trait]
pub trait SubAgentManager: Send + Sync {
    async fn create_sub_session(&self, request: SubSessionRequest)
        -> Result<Session, SubAgentError>;

    /// 在子会话中执行 prompt，返回最终输出
    async fn execute_sub_session(
        &self,
        session: &Session,
        prompt: &str,
        timeout: Option<Duration>,
    ) -> Result<String, SubAgentError>;

    async fn delete_sub_session(&self, session_id: &str) -> Result<(), SubAgentError>;
}

/// 智能体主循环（调用 LLM 与工具）；应在挂起点检查 cancel
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        session: &Session,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, RunnerError>;
}

pub struct StoreSubAgentManager {
    store: Arc<SessionStore>,
    aborts: Arc<SessionAbortManager>,
    runner: Arc<dyn AgentRunner>,
}

impl StoreSubAgentManager {
    pub fn new(
        store: Arc<SessionStore>,
        aborts: Arc<SessionAbortManager>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        Self {
            store,
            aborts,
            runner,
        }
    }
}

#[async_trait]
impl SubAgentManager for StoreSubAgentManager {
    async fn create_sub_session(
        &self,
        request: SubSessionRequest,
    ) -> Result<Session, SubAgentError> {
        let mut metadata = serde_json::json!({
            "subagent_type": request.subagent_type,
            "description": request.description,
        });
        if let Some(tools) = request.allowed_tools {
            metadata["allowed_tools"] = serde_json::json!(tools);
        }

        let session = self
            .store
            .create_session(
                NewSession::titled(request.title)
                    .with_parent(request.parent_session_id)
                    .with_metadata(metadata),
            )
            .await?;
        Ok(session)
    }

    async fn execute_sub_session(
        &self,
        session: &Session,
        prompt: &str,
        timeout: Option<Duration>,
    ) -> Result<String, SubAgentError> {
        self.store.add_user_message(&session.id, prompt).await?;
        let cancel = self.aborts.create(&session.id);

        let run = async {
            tokio::select! {
                result = self.runner.run(session, prompt, cancel.clone()) => {
                    result.map_err(|e| SubAgentError::Runner(e.to_string()))
                }
                _ = cancel.cancelled() => Err(SubAgentError::Aborted(session.id.clone())),
            }
        };

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    Err(SubAgentError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => run.await,
        };
        self.aborts.remove(&session.id);

        let output = outcome?;
        let agent = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("subagent_type"))
            .and_then(|v| v.as_str())
            .unwrap_or("general")
            .to_string();
        self.store
            .add_message(
                &session.id,
                NewMessage::assistant().with_agent(agent),
                vec![PartPayload::text(output.clone())],
            )
            .await?;
        Ok(output)
    }

    async fn delete_sub_session(&self, session_id: &str) -> Result<(), SubAgentError> {
        self.aborts.remove(session_id);
        self.store.delete_session(session_id).await?;
        Ok(())
    }
}
