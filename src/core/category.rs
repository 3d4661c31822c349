//! 工具类别：按工具名子串归类，TimeoutManager 与 RecoveryDispatcher 共用

use serde::{Deserialize, Serialize};

const NETWORK_HINTS: &[&str] = &["network", "fetch", "http", "web", "search", "download"];
const SHELL_HINTS: &[&str] = &["bash", "shell", "exec", "command", "terminal"];
const FILE_HINTS: &[&str] = &["file", "read", "write", "edit", "glob", "grep", "ls"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Network,
    Shell,
    File,
    Other,
}

impl ToolCategory {
    /// 大小写不敏感的子串匹配；网络优先于 shell，shell 优先于文件（如 `web_fetch_file` 归为网络）
    pub fn classify(tool_name: &str) -> Self {
        let name = tool_name.to_ascii_lowercase();
        let hit = |hints: &[&str]| hints.iter().any(|h| name.contains(h));
        if hit(NETWORK_HINTS) {
            ToolCategory::Network
        } else if hit(SHELL_HINTS) {
            ToolCategory::Shell
        } else if hit(FILE_HINTS) {
            ToolCategory::File
        } else {
            ToolCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCategory::Network => "network",
            ToolCategory::Shell => "shell",
            ToolCategory::File => "file",
            ToolCategory::Other => "other",
        }
    }
}
