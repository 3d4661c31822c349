//! 执行治理层：错误、并发槽位、超时、重试、恢复分派、会话取消

pub mod abort;
pub mod category;
pub mod concurrency;
pub mod error;
pub mod recovery;
pub mod retry;
pub mod timeout;

pub use abort::SessionAbortManager;
pub use category::ToolCategory;
pub use concurrency::{CategoryStats, ConcurrencyManager, SlotGrant, SlotGuard, SlotId};
pub use error::{ConcurrencyError, GovernorError};
pub use recovery::{RecoveryDispatcher, RecoveryStrategy};
pub use retry::{RetryManager, RetryPolicy};
pub use timeout::TimeoutManager;
