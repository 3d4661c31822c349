//! 超时管理：单次覆盖 > 工具级覆盖 > 类别默认 > 全局默认

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::RwLock;

use crate::config::TimeoutsSection;
use crate::core::{GovernorError, ToolCategory};

pub struct TimeoutManager {
    default: Duration,
    network: Duration,
    shell: Duration,
    file: Duration,
    tool_overrides: RwLock<HashMap<String, Duration>>,
}

impl TimeoutManager {
    pub fn new(cfg: &TimeoutsSection) -> Self {
        Self {
            default: Duration::from_millis(cfg.default_ms),
            network: Duration::from_millis(cfg.network_ms),
            shell: Duration::from_millis(cfg.shell_ms),
            file: Duration::from_millis(cfg.file_ms),
            tool_overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn category_default(&self, category: ToolCategory) -> Duration {
        match category {
            ToolCategory::Network => self.network,
            ToolCategory::Shell => self.shell,
            ToolCategory::File => self.file,
            ToolCategory::Other => self.default,
        }
    }

    pub fn set_tool_timeout(&self, tool_name: impl Into<String>, timeout: Duration) {
        self.tool_overrides.write().insert(tool_name.into(), timeout);
    }

    pub fn clear_tool_timeout(&self, tool_name: &str) {
        self.tool_overrides.write().remove(tool_name);
    }

    pub fn resolve(&self, tool_name: &str, per_call: Option<Duration>) -> Duration {
        if let Some(t) = per_call {
            return t;
        }
        if let Some(t) = self.tool_overrides.read().get(tool_name) {
            return *t;
        }
        self.category_default(ToolCategory::classify(tool_name))
    }

    /// 让 fut 与截止时间竞速；超时后 fut 被 drop，返回 `GovernorError::Timeout`
    pub async fn run<F, T>(
        &self,
        tool_name: &str,
        per_call: Option<Duration>,
        fut: F,
    ) -> Result<T, GovernorError>
    where
        F: Future<Output = T>,
    {
        let limit = self.resolve(tool_name, per_call);
        tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| GovernorError::Timeout {
                tool: tool_name.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(&TimeoutsSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_order() {
        let mgr = TimeoutManager::default();
        assert_eq!(mgr.resolve("echo", None), Duration::from_millis(30_000));
        assert_eq!(mgr.resolve("network_scan", None), Duration::from_millis(60_000));
        assert_eq!(mgr.resolve("bash", None), Duration::from_millis(120_000));

        mgr.set_tool_timeout("bash", Duration::from_secs(5));
        assert_eq!(mgr.resolve("bash", None), Duration::from_secs(5));
        assert_eq!(
            mgr.resolve("bash", Some(Duration::from_millis(10))),
            Duration::from_millis(10)
        );

        mgr.clear_tool_timeout("bash");
        assert_eq!(mgr.resolve("bash", None), Duration::from_millis(120_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let mgr = TimeoutManager::default();
        let err = mgr
            .run("echo", Some(Duration::from_millis(20)), tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));

        let ok = mgr.run("echo", None, async { 7 }).await.unwrap();
        assert_eq!(ok, 7);
    }
}
