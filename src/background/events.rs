//! 后台任务事件
//!
//! 事件以父会话为投递对象（metadata.trigger_session_id），传输层订阅后自行转发。

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::session::types::{new_id, now_ms};

pub const EVENT_SOURCE: &str = "background_task_manager";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "background_task.completed")]
    TaskCompleted,
    #[serde(rename = "background_task.failed")]
    TaskFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskCompleted => "background_task.completed",
            EventType::TaskFailed => "background_task.failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub trigger_session_id: String,
    pub source: String,
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEventPayload {
    pub task_id: String,
    pub sub_session_id: String,
    pub description: String,
    pub subagent_type: String,
    pub duration_ms: u64,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: i64,
    pub metadata: EventMetadata,
    pub payload: TaskEventPayload,
}

impl Event {
    pub fn task_finished(parent_session_id: impl Into<String>, payload: TaskEventPayload) -> Self {
        let event_type = match payload.outcome {
            TaskOutcome::Completed { .. } => EventType::TaskCompleted,
            TaskOutcome::Failed { .. } => EventType::TaskFailed,
        };
        Self {
            id: new_id("evt"),
            event_type,
            timestamp: now_ms(),
            metadata: EventMetadata {
                trigger_session_id: parent_session_id.into(),
                source: EVENT_SOURCE.to_string(),
                task_id: payload.task_id.clone(),
            },
            payload,
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// 基于 broadcast channel 的发布者；无订阅者时事件被丢弃
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: Event) {
        let event_type = event.event_type.as_str();
        if self.tx.send(event).is_err() {
            tracing::debug!(event_type, "no event subscribers");
        }
    }
}
