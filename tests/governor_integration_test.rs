//! 执行内核集成测试：并发治理、后台任务生命周期、会话中断

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bee_exec::background::{
        AgentRunner, CleanupMode, CreateTask, Event, EventType, RunnerError, TaskStatus,
    };
    use bee_exec::config::AppConfig;
    use bee_exec::session::{NewMessage, NewSession, Role, Session, INTERRUPT_MARKER};
    use bee_exec::tools::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResult};
    use bee_exec::{Runtime, RuntimeBuilder};
    use serde_json::Value;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    /// prompt 为 "x" 时失败，否则回显
    struct ScriptedRunner;

    #[async_trait]
    impl AgentRunner for ScriptedRunner {
        async fn run(
            &self,
            _session: &Session,
            prompt: &str,
            _cancel: CancellationToken,
        ) -> Result<String, RunnerError> {
            if prompt == "x" {
                Err("sub-session execution rejected".into())
            } else {
                Ok(format!("answer to {prompt}"))
            }
        }
    }

    /// 记录同时执行的峰值
    #[derive(Default)]
    struct Gauge {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    struct SlowBash(Arc<Gauge>);

    #[async_trait]
    impl Tool for SlowBash {
        fn name(&self) -> &str {
            "bash"
        }
        fn description(&self) -> &str {
            "sleeps briefly"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
            let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.running.fetch_sub(1, Ordering::SeqCst);
            ToolResult::success("ok")
        }
    }

    /// 前两次返回连接重置
    struct FlakyFetch(AtomicU32);

    #[async_trait]
    impl Tool for FlakyFetch {
        fn name(&self) -> &str {
            "web_fetch"
        }
        fn description(&self) -> &str {
            "fails twice then succeeds"
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
            if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                ToolResult::failure("read ECONNRESET")
            } else {
                ToolResult::success("<html>")
            }
        }
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.concurrency.limits.insert("bash".into(), 1);
        cfg.retry.base_delay_ms = 1;
        cfg.retry.jitter = 0.0;
        cfg
    }

    async fn runtime(tools: ToolRegistry) -> Runtime {
        RuntimeBuilder::new(config())
            .with_tools(tools)
            .with_runner(Arc::new(ScriptedRunner))
            .build()
            .await
            .unwrap()
    }

    async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_bash_limit_one_queues_second_acquire() {
        let rt = runtime(ToolRegistry::new()).await;
        let concurrency = Arc::clone(&rt.concurrency);
        assert_eq!(concurrency.get_limit("bash"), 1);

        let first = concurrency.acquire("bash").await.unwrap();
        assert_eq!(first.wait_time_ms, 0);
        assert!(first.acquired);

        let waiter = {
            let concurrency = Arc::clone(&concurrency);
            tokio::spawn(async move { concurrency.acquire("bash").await })
        };
        while concurrency.queue_length("bash") == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(concurrency.active_count("bash"), 1);

        concurrency.release("bash", first.slot_id);
        let second = waiter.await.unwrap().unwrap();
        assert!(second.acquired);
        assert_eq!(concurrency.active_count("bash"), 1);
        assert_eq!(concurrency.queue_length("bash"), 0);

        concurrency.release("bash", second.slot_id);
        assert_eq!(concurrency.active_count("bash"), 0);
    }

    #[tokio::test]
    async fn test_governed_calls_respect_category_limit() {
        let gauge = Arc::new(Gauge::default());
        let mut tools = ToolRegistry::new();
        tools.register(SlowBash(Arc::clone(&gauge)));
        let rt = runtime(tools).await;

        let session = rt.store.create_session(NewSession::titled("s")).await.unwrap();
        let ctx = rt.tool_context(&session.id).await.unwrap();
        let calls = (0..4)
            .map(|_| ToolCall::new("bash", serde_json::json!({"command": "true"})))
            .collect();

        let results = rt.executor.execute_batch(calls, &ctx).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap().is_success()));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(rt.concurrency.active_count("bash"), 0);
    }

    #[tokio::test]
    async fn test_transient_network_failure_is_retried() {
        let mut tools = ToolRegistry::new();
        tools.register(FlakyFetch(AtomicU32::new(0)));
        let rt = runtime(tools).await;

        let session = rt.store.create_session(NewSession::titled("s")).await.unwrap();
        let ctx = rt.tool_context(&session.id).await.unwrap();
        let result = rt
            .executor
            .execute(ToolCall::new("web_fetch", serde_json::json!({"url": "http://x"})), &ctx)
            .await
            .unwrap();
        assert_eq!(result.output(), "<html>");
    }

    #[tokio::test]
    async fn test_failing_task_is_recorded_and_listed() {
        let rt = runtime(ToolRegistry::new()).await;
        let mut events = rt.subscribe_events();

        let handle = rt
            .tasks
            .create_task(
                CreateTask::new("p1", "t", "x", "general").with_cleanup(CleanupMode::Keep),
            )
            .await
            .unwrap();

        let event = next_event(&mut events).await;
        assert_eq!(event.event_type, EventType::TaskFailed);
        assert_eq!(event.payload.task_id, handle.task_id);

        let task = rt.tasks.get_task(&handle.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        let listed = rt.tasks.list_tasks(Some("p1")).await;
        assert!(listed.iter().any(|t| t.id == handle.task_id));
    }

    #[tokio::test]
    async fn test_keep_and_delete_cleanup() {
        let rt = runtime(ToolRegistry::new()).await;
        let mut events = rt.subscribe_events();

        let kept = rt
            .tasks
            .create_task(CreateTask::new("p1", "keep me", "hello", "general"))
            .await
            .unwrap();
        assert_eq!(next_event(&mut events).await.event_type, EventType::TaskCompleted);

        let deleted = rt
            .tasks
            .create_task(
                CreateTask::new("p1", "drop me", "bye", "general")
                    .with_cleanup(CleanupMode::Delete),
            )
            .await
            .unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.payload.task_id, deleted.task_id);

        let tasks = rt.tasks.list_tasks(None).await;
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.id, kept.task_id);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("answer to hello"));
        assert!(task.started_at.is_some() && task.completed_at.is_some());

        let kept_messages = rt.store.messages(&kept.sub_session_id).await.unwrap();
        assert_eq!(kept_messages.len(), 2);
        assert!(rt
            .store
            .get_session(&deleted.sub_session_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_abort_fires_signal() {
        let rt = runtime(ToolRegistry::new()).await;
        let token = rt.aborts.create("ses_a");
        assert!(rt.aborts.abort("ses_a"));
        assert!(token.is_cancelled());
        assert!(!rt.aborts.has("ses_a"));
    }

    #[tokio::test]
    async fn test_interrupt_paths() {
        let rt = runtime(ToolRegistry::new()).await;
        let session = rt.store.create_session(NewSession::titled("s")).await.unwrap();
        let assistants = |messages: &[bee_exec::session::MessageWithParts]| {
            messages.iter().filter(|m| m.info.role == Role::Assistant).count()
        };

        rt.begin_turn(&session.id);
        rt.cancel_session(&session.id).await.unwrap();
        let messages = rt.store.messages(&session.id).await.unwrap();
        assert_eq!(assistants(&messages), 0);
        assert_eq!(messages.last().unwrap().text(), INTERRUPT_MARKER);

        rt.begin_turn(&session.id);
        rt.store.push_text(&session.id, "partial");
        rt.cancel_session(&session.id).await.unwrap();
        let messages = rt.store.messages(&session.id).await.unwrap();
        assert_eq!(assistants(&messages), 1);

        rt.begin_turn(&session.id);
        rt.store.push_reasoning(&session.id, "hmm");
        rt.store.push_text(&session.id, "out");
        rt.cancel_session(&session.id).await.unwrap();
        let messages = rt.store.messages(&session.id).await.unwrap();
        assert_eq!(assistants(&messages), 2);
        let combined = &messages[messages.len() - 2];
        assert_eq!(combined.reasoning(), Some("hmm"));
        assert_eq!(combined.text(), "out");

        rt.begin_turn(&session.id);
        rt.store.push_text(&session.id, "complete");
        rt.finish_turn(&session.id, NewMessage::assistant()).await.unwrap();
        let outcome = rt.cancel_session(&session.id).await.unwrap();
        assert!(outcome.partial.is_none());
        let messages = rt.store.messages(&session.id).await.unwrap();
        assert_eq!(assistants(&messages), 3);
    }

    #[tokio::test]
    async fn test_sqlite_sessions_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.session.db_path = Some(dir.path().join("bee.db"));

        let session_id = {
            let rt = RuntimeBuilder::new(cfg.clone()).build().await.unwrap();
            let session = rt.store.create_session(NewSession::titled("durable")).await.unwrap();
            rt.store.add_user_message(&session.id, "persist me").await.unwrap();
            rt.shutdown().await.unwrap();
            session.id
        };

        let rt = RuntimeBuilder::new(cfg).build().await.unwrap();
        let session = rt.store.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.title, "durable");
        assert_eq!(session.message_count, 1);
        let messages = rt.store.messages(&session_id).await.unwrap();
        assert_eq!(messages[0].text(), "persist me");
    }
}
