pub mod echo;
pub mod executor;
pub mod registry;

pub use echo::EchoTool;
pub use executor::{ToolCall, ToolExecutor};
pub use registry::{Tool, ToolContext, ToolRegistry, ToolResult};
