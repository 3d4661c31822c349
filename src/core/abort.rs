//! 会话取消登记：每个会话至多一个取消令牌
//!
//! 取消是协作式的：令牌传给工具与子智能体，由它们在挂起点自行检查；已授予的并发槽位不会被强制回收。

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionAbortManager {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl SessionAbortManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为会话签发新令牌；已有的旧令牌被替换但不会被触发
    pub fn create(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .tokens
            .lock()
            .insert(session_id.to_string(), token.clone());
        if previous.is_some() {
            tracing::warn!(session_id, "replacing live abort controller without signalling it");
        }
        token
    }

    /// 触发取消并移除；会话没有令牌时返回 false
    pub fn abort(&self, session_id: &str) -> bool {
        let token = self.tokens.lock().remove(session_id);
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(session_id, "session aborted");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<CancellationToken> {
        self.tokens.lock().get(session_id).cloned()
    }

    pub fn has(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    /// 移除但不触发
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
    }

    /// 关闭时取消所有会话，返回数量
    pub fn abort_all(&self) -> usize {
        let tokens: Vec<_> = self.tokens.lock().drain().collect();
        for (_, token) in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}
