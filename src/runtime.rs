//! 运行时上下文：一次性构建所有管理器，并以 Arc 句柄共享给调用方
//!
//! 不使用全局单例；需要并发、会话或后台任务能力的地方都从 Runtime 拿句柄。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::background::{
    AgentRunner, BackgroundTaskManager, BroadcastPublisher, Event, RunnerError,
    StoreSubAgentManager, BACKGROUND_CATEGORY,
};
use crate::config::AppConfig;
use crate::core::{
    ConcurrencyManager, RecoveryDispatcher, RetryManager, SessionAbortManager, TimeoutManager,
};
use crate::session::{
    InterruptOutcome, MemoryAdapter, MessageWithParts, NewMessage, PersistenceAdapter,
    PersistenceError, Session, SessionStore, SqliteAdapter, StoreError,
};
use crate::tools::{ToolContext, ToolExecutor, ToolRegistry};

/// 未配置 AgentRunner 时使用：所有子智能体执行都失败
struct NoRunner;

#[async_trait]
impl AgentRunner for NoRunner {
    async fn run(
        &self,
        _session: &Session,
        _prompt: &str,
        _cancel: CancellationToken,
    ) -> Result<String, RunnerError> {
        Err("no agent runner configured".into())
    }
}

pub struct RuntimeBuilder {
    config: AppConfig,
    registry: ToolRegistry,
    adapter: Option<Arc<dyn PersistenceAdapter>>,
    runner: Option<Arc<dyn AgentRunner>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: ToolRegistry::new(),
            adapter: None,
            runner: None,
        }
    }

    pub fn with_tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// 显式指定持久化适配器；否则按 session.db_path 选择 SQLite 或内存
    pub fn with_adapter(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn AgentRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub async fn build(self) -> Result<Runtime, PersistenceError> {
        let cfg = self.config;

        let mut concurrency = ConcurrencyManager::from_config(&cfg.concurrency);
        if !cfg.concurrency.limits.contains_key(BACKGROUND_CATEGORY) {
            concurrency =
                concurrency.with_category_default(BACKGROUND_CATEGORY, cfg.background.max_concurrent);
        }
        let concurrency = Arc::new(concurrency);
        let timeouts = Arc::new(TimeoutManager::new(&cfg.timeouts));
        let retry = Arc::new(RetryManager::new(cfg.retry.clone()));
        let recovery = Arc::new(RecoveryDispatcher::from_config(
            &cfg.recovery,
            cfg.retry.max_retries,
        ));
        let aborts = Arc::new(SessionAbortManager::new());

        let adapter: Arc<dyn PersistenceAdapter> = match (self.adapter, &cfg.session.db_path) {
            (Some(adapter), _) => adapter,
            (None, Some(path)) => Arc::new(SqliteAdapter::open(path).await?),
            (None, None) => {
                tracing::info!("no session.db_path configured, sessions are memory-only");
                Arc::new(MemoryAdapter::new())
            }
        };
        let store = Arc::new(SessionStore::new(adapter));

        let executor = Arc::new(ToolExecutor::new(
            self.registry,
            Arc::clone(&concurrency),
            Arc::clone(&timeouts),
            Arc::clone(&retry),
            Arc::clone(&recovery),
        ));

        let runner = self.runner.unwrap_or_else(|| Arc::new(NoRunner));
        let subagents = Arc::new(StoreSubAgentManager::new(
            Arc::clone(&store),
            Arc::clone(&aborts),
            runner,
        ));
        let events = Arc::new(BroadcastPublisher::new(cfg.background.event_capacity));
        let tasks = BackgroundTaskManager::new(subagents, Arc::clone(&concurrency), events.clone())
            .with_default_timeout(cfg.background.default_timeout());

        Ok(Runtime {
            config: cfg,
            concurrency,
            timeouts,
            retry,
            recovery,
            aborts,
            store,
            executor,
            tasks,
            events,
        })
    }
}

pub struct Runtime {
    pub config: AppConfig,
    pub concurrency: Arc<ConcurrencyManager>,
    pub timeouts: Arc<TimeoutManager>,
    pub retry: Arc<RetryManager>,
    pub recovery: Arc<RecoveryDispatcher>,
    pub aborts: Arc<SessionAbortManager>,
    pub store: Arc<SessionStore>,
    pub executor: Arc<ToolExecutor>,
    pub tasks: BackgroundTaskManager,
    pub events: Arc<BroadcastPublisher>,
}

impl Runtime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// 开始一轮回复：签发取消令牌并打开流式缓冲区
    pub fn begin_turn(&self, session_id: &str) -> CancellationToken {
        let token = self.aborts.create(session_id);
        self.store.begin_stream(session_id);
        token
    }

    /// 正常结束一轮：写入缓冲的回复并回收令牌
    pub async fn finish_turn(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<Option<MessageWithParts>, StoreError> {
        let written = self.store.complete_stream(session_id, message).await;
        self.aborts.remove(session_id);
        written
    }

    /// 取消会话：触发令牌并保存已产生的部分输出
    pub async fn cancel_session(&self, session_id: &str) -> Result<InterruptOutcome, StoreError> {
        self.aborts.abort(session_id);
        self.store.interrupt(session_id).await
    }

    /// 为会话构造工具上下文；子会话带上受限工具集
    pub async fn tool_context(&self, session_id: &str) -> Result<ToolContext, StoreError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let cancel = self
            .aborts
            .get(session_id)
            .unwrap_or_else(|| self.aborts.create(session_id));
        let ctx = ToolContext::new(session_id, cancel);
        Ok(match session.allowed_tools() {
            Some(tools) => ctx.with_allowed_tools(tools),
            None => ctx,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// 关闭：取消所有会话、拒绝所有排队者并落盘
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let aborted = self.aborts.abort_all();
        self.concurrency.clear();
        self.store.flush().await?;
        tracing::info!(aborted, "runtime shut down");
        Ok(())
    }
}
