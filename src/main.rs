//! bee-exec 演示入口
//!
//! 初始化日志与配置、构建 Runtime，执行一次受治理的 echo 调用和一次后台子智能体委派，
//! 并打印任务记录。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bee_exec::background::{AgentRunner, CreateTask, RunnerError};
use bee_exec::config::load_config;
use bee_exec::session::{NewSession, Session};
use bee_exec::tools::{EchoTool, ToolCall, ToolRegistry};
use bee_exec::{observability, RuntimeBuilder};
use tokio_util::sync::CancellationToken;

/// 回显 prompt 的子智能体
struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(
        &self,
        session: &Session,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<String, RunnerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".into()),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                Ok(format!("[{}] {}", session.title, prompt))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config = load_config(None).context("Failed to load config")?;

    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);

    let runtime = RuntimeBuilder::new(config)
        .with_tools(tools)
        .with_runner(Arc::new(EchoRunner))
        .build()
        .await
        .context("Failed to build runtime")?;

    let session = runtime
        .store
        .create_session(NewSession::titled("demo"))
        .await?;
    let ctx = runtime.tool_context(&session.id).await?;

    let result = runtime
        .executor
        .execute(
            ToolCall::new("echo", serde_json::json!({"text": "hello from bee-exec"})),
            &ctx,
        )
        .await?;
    println!("echo -> {}", serde_json::to_string(&result)?);

    let mut events = runtime.subscribe_events();
    let handle = runtime
        .tasks
        .create_task(CreateTask::new(
            &session.id,
            "summarize",
            "summarize the demo session",
            "general",
        ))
        .await?;

    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .context("Background task did not finish in time")?
        .context("Event channel closed")?;
    println!("event -> {}", serde_json::to_string_pretty(&event)?);

    if let Some(task) = runtime.tasks.get_task(&handle.task_id).await {
        println!("task -> {}", serde_json::to_string_pretty(&task)?);
    }

    runtime.shutdown().await?;
    Ok(())
}
