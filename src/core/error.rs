//! 执行治理层错误类型
//!
//! ConcurrencyError 只描述排队失败；GovernorError 是 ToolExecutor 对调用方暴露的统一错误。
//! 工具自身的失败（参数校验、瞬时网络错误）不走这里，而是以 `ToolResult::Failure` 返回。

use thiserror::Error;

/// 并发槽位获取失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// 排队超过 max_wait_ms，已从队列移除
    #[error("Concurrency wait exceeded for '{category}' after {waited_ms}ms")]
    Timeout { category: String, waited_ms: u64 },

    /// ConcurrencyManager::clear() 拒绝了所有排队者
    #[error("Concurrency queue cleared")]
    Cleared,
}

/// 工具调用过程中由治理层产生的错误
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 超时竞速失败；消息含 "timed out"，会被 RetryManager 判定为可重试
    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// 会话取消信号已触发
    #[error("Session {0} aborted")]
    Aborted(String),
}

impl GovernorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, GovernorError::Timeout { .. })
    }
}
