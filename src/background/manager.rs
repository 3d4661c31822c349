//! 后台任务管理
//!
//! create_task 同步创建子会话并登记 pending 记录后立即返回；执行放在独立的 tokio 任务中，
//! 占用 `background_task` 类别的并发槽位。执行结果只通过任务记录与事件可见，从不返回给调用方。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::RwLock;

use super::events::{Event, EventPublisher, TaskEventPayload, TaskOutcome};
use super::subagent::{SubAgentError, SubAgentManager, SubSessionRequest};
use super::task::{BackgroundTask, CleanupMode, TaskId};
use crate::core::ConcurrencyManager;
use crate::session::types::now_ms;
use crate::session::Session;

/// 后台任务使用的并发类别
pub const BACKGROUND_CATEGORY: &str = "background_task";

#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("Failed to create sub-session: {0}")]
    SubSession(#[source] SubAgentError),
}

/// 创建后台任务的参数
#[derive(Debug, Clone)]
pub struct CreateTask {
    pub parent_session_id: String,
    pub description: String,
    pub prompt: String,
    pub subagent_type: String,
    pub timeout: Option<Duration>,
    pub cleanup: CleanupMode,
    pub allowed_tools: Option<Vec<String>>,
}

impl CreateTask {
    pub fn new(
        parent_session_id: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
        subagent_type: impl Into<String>,
    ) -> Self {
        Self {
            parent_session_id: parent_session_id.into(),
            description: description.into(),
            prompt: prompt.into(),
            subagent_type: subagent_type.into(),
            timeout: None,
            cleanup: CleanupMode::Keep,
            allowed_tools: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupMode) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub sub_session_id: String,
}

#[derive(Clone)]
pub struct BackgroundTaskManager {
    tasks: Arc<RwLock<HashMap<TaskId, BackgroundTask>>>,
    subagents: Arc<dyn SubAgentManager>,
    concurrency: Arc<ConcurrencyManager>,
    events: Arc<dyn EventPublisher>,
    default_timeout: Option<Duration>,
}

impl BackgroundTaskManager {
    pub fn new(
        subagents: Arc<dyn SubAgentManager>,
        concurrency: Arc<ConcurrencyManager>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            subagents,
            concurrency,
            events,
            default_timeout: None,
        }
    }

    /// 未显式指定 timeout 的任务使用该值
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub async fn create_task(&self, req: CreateTask) -> Result<TaskHandle, BackgroundError> {
        let session = self
            .subagents
            .create_sub_session(SubSessionRequest {
                parent_session_id: req.parent_session_id.clone(),
                title: req.description.clone(),
                subagent_type: req.subagent_type.clone(),
                description: req.description.clone(),
                allowed_tools: req.allowed_tools.clone(),
            })
            .await
            .map_err(BackgroundError::SubSession)?;

        let task = BackgroundTask::new(
            &session.id,
            &req.parent_session_id,
            &req.description,
            &req.subagent_type,
            req.cleanup,
        );
        let handle = TaskHandle {
            task_id: task.id.clone(),
            sub_session_id: session.id.clone(),
        };
        self.tasks.write().await.insert(task.id.clone(), task);

        tracing::info!(
            task_id = %handle.task_id,
            parent = %req.parent_session_id,
            subagent_type = %req.subagent_type,
            "background task created"
        );

        let timeout = req.timeout.or(self.default_timeout);
        let manager = self.clone();
        let task_id = handle.task_id.clone();
        tokio::spawn(async move {
            manager.run_task(task_id, session, req.prompt, timeout).await;
        });

        Ok(handle)
    }

    async fn run_task(
        self,
        task_id: TaskId,
        session: Session,
        prompt: String,
        timeout: Option<Duration>,
    ) {
        // 后台任务不设排队上限，保持 pending 直到槽位释放
        let outcome = match self
            .concurrency
            .acquire_guard_within(BACKGROUND_CATEGORY, None)
            .await
        {
            Ok(_slot) => {
                self.mark_running(&task_id).await;
                let exec = AssertUnwindSafe(
                    self.subagents
                        .execute_sub_session(&session, &prompt, timeout),
                )
                .catch_unwind()
                .await;
                match exec {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(panic) => Err(panic_message(panic.as_ref())),
                }
            }
            Err(e) => Err(e.to_string()),
        };

        let Some(finished) = self.commit(&task_id, outcome).await else {
            tracing::warn!(task_id = %task_id, "task record vanished before completion");
            return;
        };

        if finished.cleanup == CleanupMode::Delete {
            if let Err(e) = self.subagents.delete_sub_session(&finished.sub_session_id).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to delete sub-session");
            }
            self.tasks.write().await.remove(&task_id);
        }

        let outcome = match (&finished.result, &finished.error) {
            (_, Some(error)) => TaskOutcome::Failed {
                error: error.clone(),
            },
            (result, None) => TaskOutcome::Completed {
                result: result.clone().unwrap_or_default(),
            },
        };
        self.events.publish(Event::task_finished(
            finished.parent_session_id.clone(),
            TaskEventPayload {
                task_id: finished.id.clone(),
                sub_session_id: finished.sub_session_id.clone(),
                description: finished.description.clone(),
                subagent_type: finished.subagent_type.clone(),
                duration_ms: finished.elapsed_ms(),
                outcome,
            },
        ));
    }

    async fn mark_running(&self, task_id: &str) {
        if let Some(task) = self.tasks.write().await.get_mut(task_id) {
            if task.mark_running() {
                tracing::info!(task_id, "background task running");
            }
        }
    }

    /// 写入终态并返回快照；终态只写一次
    async fn commit(
        &self,
        task_id: &str,
        outcome: Result<String, String>,
    ) -> Option<BackgroundTask> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(task_id)?;
        match outcome {
            Ok(result) => {
                if task.complete(result) {
                    tracing::info!(task_id, elapsed_ms = task.elapsed_ms(), "background task completed");
                }
            }
            Err(error) => {
                if task.fail(error) {
                    tracing::warn!(
                        task_id,
                        error = task.error.as_deref().unwrap_or_default(),
                        "background task failed"
                    );
                }
            }
        }
        Some(task.clone())
    }

    pub async fn get_task(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 按创建时间排序；可按父会话过滤
    pub async fn list_tasks(&self, parent_session_id: Option<&str>) -> Vec<BackgroundTask> {
        let mut tasks: Vec<BackgroundTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| parent_session_id.map_or(true, |p| t.parent_session_id == p))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// 清理完成时间早于 max_age 的已结束任务，返回清理数量
    pub async fn prune_finished(&self, max_age: Duration) -> usize {
        let cutoff = now_ms() - max_age.as_millis() as i64;
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, t| !(t.is_finished() && t.completed_at.map_or(false, |c| c <= cutoff)));
        before - tasks.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("sub-agent panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("sub-agent panicked: {s}")
    } else {
        "sub-agent panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::events::{BroadcastPublisher, EventType};
    use crate::background::task::TaskStatus;
    use crate::session::SessionSummary;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    /// 按 prompt 决定行为的子智能体
    #[derive(Default)]
    struct FakeSubAgents {
        deleted: parking_lot::Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SubAgentManager for FakeSubAgents {
        async fn create_sub_session(
            &self,
            request: SubSessionRequest,
        ) -> Result<Session, SubAgentError> {
            if request.description == "unavailable" {
                return Err(SubAgentError::Runner("store offline".into()));
            }
            Ok(Session {
                id: format!("ses_{}", uuid::Uuid::new_v4().simple()),
                title: request.title,
                parent_id: Some(request.parent_session_id),
                directory: ".".into(),
                summary: SessionSummary::default(),
                created_at: now_ms(),
                updated_at: now_ms(),
                message_count: 0,
                metadata: None,
            })
        }

        async fn execute_sub_session(
            &self,
            _session: &Session,
            prompt: &str,
            _timeout: Option<Duration>,
        ) -> Result<String, SubAgentError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let result = match prompt {
                "x" => Err(SubAgentError::Runner("sub-session rejected".into())),
                "panic" => panic!("runner exploded"),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok("slow done".to_string())
                }
                other => Ok(format!("echo: {other}")),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn delete_sub_session(&self, session_id: &str) -> Result<(), SubAgentError> {
            self.deleted.lock().push(session_id.to_string());
            Ok(())
        }
    }

    fn manager(
        background_limit: usize,
    ) -> (BackgroundTaskManager, Arc<FakeSubAgents>, broadcast::Receiver<Event>) {
        manager_with_wait(background_limit, Duration::from_secs(5))
    }

    fn manager_with_wait(
        background_limit: usize,
        max_wait: Duration,
    ) -> (BackgroundTaskManager, Arc<FakeSubAgents>, broadcast::Receiver<Event>) {
        let subagents = Arc::new(FakeSubAgents::default());
        let concurrency = Arc::new(
            ConcurrencyManager::new(5, max_wait)
                .with_category_default(BACKGROUND_CATEGORY, background_limit),
        );
        let publisher = Arc::new(BroadcastPublisher::new(16));
        let rx = publisher.subscribe();
        (
            BackgroundTaskManager::new(subagents.clone(), concurrency, publisher),
            subagents,
            rx,
        )
    }

    async fn next_event(rx: &mut broadcast::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_failed_task_is_kept() {
        let (manager, _, mut rx) = manager(3);
        let handle = manager
            .create_task(CreateTask::new("p1", "t", "x", "general"))
            .await
            .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.event_type, EventType::TaskFailed);
        assert_eq!(event.metadata.trigger_session_id, "p1");

        let task = manager.get_task(&handle.task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("sub-session rejected"));
        assert!(task.started_at.is_some() && task.completed_at.is_some());
        assert_eq!(manager.list_tasks(Some("p1")).await.len(), 1);
        assert!(manager.list_tasks(Some("p2")).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_cleanup_evicts_before_event() {
        let (manager, subagents, mut rx) = manager(3);
        let handle = manager
            .create_task(
                CreateTask::new("p1", "t", "hello", "general").with_cleanup(CleanupMode::Delete),
            )
            .await
            .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(
            event.payload.outcome,
            TaskOutcome::Completed {
                result: "echo: hello".into()
            }
        );
        assert_eq!(event.payload.sub_session_id, handle.sub_session_id);
        assert!(manager.list_tasks(None).await.is_empty());
        assert_eq!(*subagents.deleted.lock(), vec![handle.sub_session_id]);
    }

    #[tokio::test]
    async fn test_sub_session_creation_failure_records_nothing() {
        let (manager, _, _) = manager(3);
        let err = manager
            .create_task(CreateTask::new("p1", "unavailable", "x", "general"))
            .await;
        assert!(matches!(err, Err(BackgroundError::SubSession(_))));
        assert!(manager.list_tasks(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let (manager, _, mut rx) = manager(3);
        let handle = manager
            .create_task(CreateTask::new("p1", "t", "panic", "general"))
            .await
            .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.event_type, EventType::TaskFailed);
        let task = manager.get_task(&handle.task_id).await.unwrap();
        assert!(task.error.unwrap().contains("runner exploded"));
    }

    #[tokio::test]
    async fn test_background_slots_bound_parallelism() {
        let (manager, subagents, mut rx) = manager(1);
        for _ in 0..3 {
            manager
                .create_task(CreateTask::new("p1", "t", "slow", "general"))
                .await
                .unwrap();
        }
        for _ in 0..3 {
            assert_eq!(next_event(&mut rx).await.event_type, EventType::TaskCompleted);
        }
        assert_eq!(subagents.peak.load(Ordering::SeqCst), 1);
        assert!(manager
            .list_tasks(Some("p1"))
            .await
            .iter()
            .all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_queued_task_outlives_tool_wait_deadline() {
        // 单个任务耗时远超 max_wait，排队任务仍应执行完成
        let (manager, subagents, mut rx) = manager_with_wait(1, Duration::from_millis(5));
        let first = manager
            .create_task(CreateTask::new("p1", "t", "slow", "general"))
            .await
            .unwrap();
        let second = manager
            .create_task(CreateTask::new("p1", "t", "slow", "general"))
            .await
            .unwrap();

        for _ in 0..2 {
            assert_eq!(next_event(&mut rx).await.event_type, EventType::TaskCompleted);
        }
        for id in [&first.task_id, &second.task_id] {
            let task = manager.get_task(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result.as_deref(), Some("slow done"));
        }
        assert_eq!(subagents.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_prune_finished() {
        let (manager, _, mut rx) = manager(3);
        manager
            .create_task(CreateTask::new("p1", "t", "hello", "general"))
            .await
            .unwrap();
        next_event(&mut rx).await;

        assert_eq!(manager.prune_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(manager.prune_finished(Duration::ZERO).await, 1);
        assert!(manager.list_tasks(None).await.is_empty());
    }
}
