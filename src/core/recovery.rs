//! 失败恢复分派
//!
//! 根据工具类别给出恢复策略，供 ToolExecutor 决定是重试、换用替代工具、跳过还是直接报错。

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::RecoverySection;
use crate::core::ToolCategory;

/// 工具失败后的处理方式
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 按类别覆盖的重试次数
    Retry { max_retries: u32 },
    /// 改为调用替代工具
    Fallback { tool: String },
    /// 视为非致命的空操作
    Skip,
    /// 原样上抛
    Error,
}

/// 类别默认：网络类按策略重试，文件/Shell 类重试一次，其余直接报错；可按工具名覆盖
#[derive(Debug)]
pub struct RecoveryDispatcher {
    network_retries: u32,
    overrides: RwLock<HashMap<String, RecoveryStrategy>>,
}

impl RecoveryDispatcher {
    pub fn new(network_retries: u32) -> Self {
        Self {
            network_retries,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &RecoverySection, network_retries: u32) -> Self {
        let dispatcher = Self::new(network_retries);
        for tool in &cfg.skip {
            dispatcher.set_strategy(tool.clone(), RecoveryStrategy::Skip);
        }
        for (tool, fallback) in &cfg.fallbacks {
            dispatcher.set_strategy(
                tool.clone(),
                RecoveryStrategy::Fallback {
                    tool: fallback.clone(),
                },
            );
        }
        dispatcher
    }

    pub fn set_strategy(&self, tool_name: impl Into<String>, strategy: RecoveryStrategy) {
        self.overrides.write().insert(tool_name.into(), strategy);
    }

    pub fn category_default(&self, category: ToolCategory) -> RecoveryStrategy {
        match category {
            ToolCategory::Network => RecoveryStrategy::Retry {
                max_retries: self.network_retries,
            },
            ToolCategory::File | ToolCategory::Shell => RecoveryStrategy::Retry { max_retries: 1 },
            ToolCategory::Other => RecoveryStrategy::Error,
        }
    }

    pub fn strategy_for(&self, tool_name: &str) -> RecoveryStrategy {
        if let Some(strategy) = self.overrides.read().get(tool_name) {
            return strategy.clone();
        }
        self.category_default(ToolCategory::classify(tool_name))
    }
}

impl Default for RecoveryDispatcher {
    fn default() -> Self {
        Self::new(3)
    }
}
