//! Echo 工具（演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext, ToolResult};

/// Echo 工具：回显 args.text；缺少 text 时返回参数错误
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolResult {
        match args.get("text").and_then(|v| v.as_str()) {
            Some(text) => ToolResult::success(text).with_metadata("session_id", ctx.session_id.clone()),
            None => ToolResult::failure("invalid arguments: missing string field `text`"),
        }
    }
}
