//! 工具执行器（执行治理）
//!
//! 每次调用：按工具名获取并发槽位 → 与截止时间竞速执行 → 失败时按 RetryManager 退避重试瞬时错误，
//! 重试耗尽后按 RecoveryDispatcher 的策略换用替代工具、跳过或原样返回失败。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::core::{
    ConcurrencyManager, GovernorError, RecoveryDispatcher, RecoveryStrategy, RetryManager,
    TimeoutManager,
};
use crate::tools::{Tool, ToolContext, ToolRegistry, ToolResult};

/// 单次工具调用请求
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
    /// 单次超时覆盖
    pub timeout: Option<Duration>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct ToolExecutor {
    registry: ToolRegistry,
    concurrency: Arc<ConcurrencyManager>,
    timeouts: Arc<TimeoutManager>,
    retry: Arc<RetryManager>,
    recovery: Arc<RecoveryDispatcher>,
}

impl ToolExecutor {
    pub fn new(
        registry: ToolRegistry,
        concurrency: Arc<ConcurrencyManager>,
        timeouts: Arc<TimeoutManager>,
        retry: Arc<RetryManager>,
        recovery: Arc<RecoveryDispatcher>,
    ) -> Self {
        Self {
            registry,
            concurrency,
            timeouts,
            retry,
            recovery,
        }
    }

    /// 执行一次受治理的工具调用
    ///
    /// 工具层面的失败以 `Ok(ToolResult::Failure)` 返回；未知工具、排队超时、会话取消以 `Err` 返回。
    pub async fn execute(
        &self,
        call: ToolCall,
        ctx: &ToolContext,
    ) -> Result<ToolResult, GovernorError> {
        let start = Instant::now();
        let args_preview = args_preview(&call.args);
        let result = self.execute_governed(&call, ctx).await;

        let (ok, outcome, attempts): (bool, &str, u32) = match &result {
            Ok((r, n)) if r.is_success() => (true, "ok", *n),
            Ok((_, n)) => (false, "error", *n),
            Err(GovernorError::Concurrency(_)) => (false, "queue_timeout", 0),
            Err(GovernorError::Aborted(_)) => (false, "aborted", 0),
            Err(_) => (false, "rejected", 0),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "session_id": ctx.session_id,
            "tool": call.name,
            "ok": ok,
            "outcome": outcome,
            "attempts": attempts,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result.map(|(r, _)| r)
    }

    /// 并发执行多次调用；各调用分别受各自类别的槽位约束
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        ctx: &ToolContext,
    ) -> Vec<Result<ToolResult, GovernorError>> {
        futures_util::future::join_all(calls.into_iter().map(|call| self.execute(call, ctx))).await
    }

    async fn execute_governed(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<(ToolResult, u32), GovernorError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| GovernorError::UnknownTool(call.name.clone()))?;
        if !ctx.permits(&call.name) {
            return Ok((
                ToolResult::failure(format!(
                    "Tool '{}' is not permitted in this session",
                    call.name
                )),
                0,
            ));
        }

        let strategy = self.recovery.strategy_for(&call.name);
        let max_retries = match &strategy {
            RecoveryStrategy::Retry { max_retries } => *max_retries,
            _ => 0,
        };

        let (result, attempts) = self.run_with_retries(&tool, call, ctx, max_retries).await?;
        if result.is_success() {
            return Ok((result, attempts));
        }
        let error = result.error().unwrap_or_default().to_string();

        match strategy {
            RecoveryStrategy::Fallback { tool: fallback } if fallback != call.name => {
                tracing::warn!(tool = %call.name, fallback = %fallback, error = %error, "falling back");
                let fallback_tool = self
                    .registry
                    .get(&fallback)
                    .ok_or_else(|| GovernorError::UnknownTool(fallback.clone()))?;
                let fallback_call = ToolCall {
                    name: fallback,
                    args: call.args.clone(),
                    timeout: call.timeout,
                };
                let (r, n) = self
                    .run_with_retries(&fallback_tool, &fallback_call, ctx, 0)
                    .await?;
                Ok((r.with_metadata("fallback_from", call.name.clone()), attempts + n))
            }
            RecoveryStrategy::Skip => {
                tracing::warn!(tool = %call.name, error = %error, "skipping failed tool");
                let skipped = ToolResult::success(String::new())
                    .with_metadata("skipped", true)
                    .with_metadata("error", error);
                Ok((skipped, attempts))
            }
            _ => Ok((result.with_metadata("attempts", attempts), attempts)),
        }
    }

    /// 重试循环；每次尝试单独占用一个槽位，退避期间不占槽位
    async fn run_with_retries(
        &self,
        tool: &Arc<dyn Tool>,
        call: &ToolCall,
        ctx: &ToolContext,
        max_retries: u32,
    ) -> Result<(ToolResult, u32), GovernorError> {
        let mut attempt = 0u32;
        loop {
            if ctx.is_cancelled() {
                return Err(GovernorError::Aborted(ctx.session_id.clone()));
            }

            let result = {
                let _slot = self.concurrency.acquire_guard(&call.name).await?;
                self.timeouts
                    .run(&call.name, call.timeout, tool.execute(call.args.clone(), ctx))
                    .await
                    .unwrap_or_else(|e| ToolResult::failure(e.to_string()))
            };
            attempt += 1;

            if result.is_success() {
                return Ok((result, attempt));
            }
            if ctx.is_cancelled() {
                return Err(GovernorError::Aborted(ctx.session_id.clone()));
            }
            let error = result.error().unwrap_or_default();
            if !self.retry.should_retry(attempt - 1, max_retries, error) {
                return Ok((result, attempt));
            }

            let delay = self.retry.delay_for(attempt - 1);
            tracing::debug!(tool = %call.name, attempt, delay_ms = delay.as_millis() as u64, error, "retrying tool");
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    return Err(GovernorError::Aborted(ctx.session_id.clone()));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
