//! bee-exec - 智能体运行时的执行内核
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 并发槽位、超时、重试、恢复策略、会话取消
//! - **tools**: 工具契约与受治理的执行器
//! - **session**: 会话消息日志、持久化与中断处理
//! - **background**: 子智能体后台任务与事件
//! - **runtime**: 统一构建并共享以上管理器
//! - **observability**: 日志初始化

pub mod background;
pub mod config;
pub mod core;
pub mod observability;
pub mod runtime;
pub mod session;
pub mod tools;

pub use runtime::{Runtime, RuntimeBuilder};
