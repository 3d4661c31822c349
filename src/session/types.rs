//! 会话数据模型：Session / MessageInfo / Part
//!
//! 时间戳统一为毫秒级 Unix 时间（与 BackgroundTask 一致）。

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type SessionId = String;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// 会话改动摘要
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub additions: u64,
    pub deletions: u64,
    pub files: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    /// 子智能体会话指向发起它的父会话
    pub parent_id: Option<SessionId>,
    pub directory: String,
    pub summary: SessionSummary,
    pub created_at: i64,
    pub updated_at: i64,
    pub message_count: u64,
    pub metadata: Option<Value>,
}

impl Session {
    pub fn is_sub_session(&self) -> bool {
        self.parent_id.is_some()
    }

    /// metadata.allowed_tools（子智能体的受限工具集）
    pub fn allowed_tools(&self) -> Option<Vec<String>> {
        let tools = self.metadata.as_ref()?.get("allowed_tools")?.as_array()?;
        Some(
            tools
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
        )
    }
}

/// 创建会话的参数
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub title: String,
    pub parent_id: Option<SessionId>,
    pub directory: Option<String>,
    pub metadata: Option<Value>,
}

impl NewSession {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    pub session_id: SessionId,
    pub parent_id: Option<String>,
    pub role: Role,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub created_at: i64,
    pub metadata: Option<Value>,
}

/// Part 的类型化载荷
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartPayload {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool: String,
        args: Value,
    },
    ToolResult {
        call_id: String,
        tool: String,
        output: String,
        is_error: bool,
    },
}

impl PartPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PartPayload::Text { .. } => "text",
            PartPayload::Reasoning { .. } => "reasoning",
            PartPayload::ToolCall { .. } => "tool_call",
            PartPayload::ToolResult { .. } => "tool_result",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    pub message_id: String,
    pub session_id: SessionId,
    pub payload: PartPayload,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 一条消息及其有序的 Part 列表
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    pub parts: Vec<Part>,
}

impl MessageWithParts {
    /// 拼接所有 text part
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match &p.payload {
                PartPayload::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match &p.payload {
            PartPayload::Reasoning { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// 追加消息时的元信息（id、时间戳由 store 生成）
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub role: Role,
    pub parent_id: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub metadata: Option<Value>,
}

impl NewMessage {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            parent_id: None,
            agent: None,
            model: None,
            metadata: None,
        }
    }

    pub fn user() -> Self {
        Self::new(Role::User)
    }

    pub fn assistant() -> Self {
        Self::new(Role::Assistant)
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
