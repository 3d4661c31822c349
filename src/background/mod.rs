//! 后台任务：把子智能体执行包装成可追踪的异步任务

pub mod events;
pub mod manager;
pub mod subagent;
pub mod task;

pub use events::{
    BroadcastPublisher, Event, EventMetadata, EventPublisher, EventType, TaskEventPayload,
    TaskOutcome,
};
pub use manager::{BackgroundError, BackgroundTaskManager, CreateTask, TaskHandle, BACKGROUND_CATEGORY};
pub use subagent::{
    AgentRunner, RunnerError, StoreSubAgentManager, SubAgentError, SubAgentManager,
    SubSessionRequest,
};
pub use task::{BackgroundTask, CleanupMode, TaskId, TaskStatus};
