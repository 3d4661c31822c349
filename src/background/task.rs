//! 后台任务记录

use serde::{Deserialize, Serialize};

use crate::session::types::now_ms;

pub type TaskId = String;

/// 任务状态：pending → running → completed | failed，只前进不回退
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 任务结束后子会话的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupMode {
    #[default]
    Keep,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: TaskId,
    pub sub_session_id: String,
    pub parent_session_id: String,
    pub description: String,
    pub subagent_type: String,
    pub status: TaskStatus,
    /// 毫秒时间戳
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub cleanup: CleanupMode,
}

impl BackgroundTask {
    pub fn new(
        sub_session_id: impl Into<String>,
        parent_session_id: impl Into<String>,
        description: impl Into<String>,
        subagent_type: impl Into<String>,
        cleanup: CleanupMode,
    ) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            sub_session_id: sub_session_id.into(),
            parent_session_id: parent_session_id.into(),
            description: description.into(),
            subagent_type: subagent_type.into(),
            status: TaskStatus::Pending,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            cleanup,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// 从 started_at（未启动则 created_at）到 completed_at（未结束则当前）的毫秒数
    pub fn elapsed_ms(&self) -> u64 {
        let start = self.started_at.unwrap_or(self.created_at);
        let end = self.completed_at.unwrap_or_else(now_ms);
        end.saturating_sub(start).max(0) as u64
    }

    pub fn mark_running(&mut self) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(now_ms());
        true
    }

    pub fn complete(&mut self, result: String) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now_ms());
        true
    }

    pub fn fail(&mut self, error: String) -> bool {
        if self.is_finished() {
            return false;
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now_ms());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> BackgroundTask {
        BackgroundTask::new("ses_sub", "ses_p", "scan repo", "explore", CleanupMode::Keep)
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut t = task();
        assert!(t.id.starts_with("task_"));
        assert_eq!(t.status, TaskStatus::Pending);

        assert!(t.mark_running());
        assert!(!t.mark_running());
        assert!(t.started_at.is_some());

        assert!(t.complete("ok".into()));
        assert!(!t.fail("late".into()));
        assert!(!t.mark_running());
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.error, None);
        assert!(t.completed_at >= t.started_at);
    }

    #[test]
    fn test_fail_from_pending() {
        let mut t = task();
        assert!(t.fail("no slot".into()));
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.started_at.is_none());
        assert_eq!(t.error.as_deref(), Some("no slot"));
    }

    #[test]
    fn test_serialized_shape() {
        let v = serde_json::to_value(task()).unwrap();
        assert_eq!(v["status"], "pending");
        assert_eq!(v["cleanup"], "keep");
    }
}
