//! Messages streamed by the external agent process.
//!
//! The agent owns these shapes; we parse only what the session runtime needs
//! (type discrimination, the session id, tool-use ids, and terminal result
//! fields) and carry everything else verbatim as JSON. Unknown message types
//! must never fail deserialization — they land in [`StreamMessage::Other`]
//! and the consumer drops them.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One parsed line of agent stream output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamMessage {
    Known(AgentMessage),
    Other(Value),
}

impl From<AgentMessage> for StreamMessage {
    fn from(msg: AgentMessage) -> Self {
        StreamMessage::Known(msg)
    }
}

/// The message types the session runtime reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Assistant(AssistantMessage),
    ToolUseSummary(ToolUseSummaryMessage),
    ToolProgress(ToolProgressMessage),
    AuthStatus(AuthStatusMessage),
    System(SystemMessage),
    Result(Box<ResultMessage>),
}

impl AgentMessage {
    /// The tool-use id this message carries, if any, used to track the
    /// session's `lastToolUseId`.
    pub fn tool_use_id(&self) -> Option<&str> {
        match self {
            AgentMessage::Assistant(m) => m.parent_tool_use_id.as_deref(),
            AgentMessage::ToolUseSummary(m) => m.tool_use_id.as_deref(),
            AgentMessage::ToolProgress(m) => Some(&m.tool_use_id),
            _ => None,
        }
    }
}

/// A full assistant turn; the message body is opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseSummaryMessage {
    pub summary: String,
    #[serde(
        default,
        alias = "toolUseID",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_use_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolProgressMessage {
    pub tool_use_id: String,
    pub tool_name: String,
    pub elapsed_time_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthStatusMessage {
    #[serde(alias = "isAuthenticating")]
    pub is_authenticating: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `system` messages carry a `subtype` discriminator of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SystemMessage {
    Init(InitMessage),
    Status(StatusMessage),
    TaskNotification(TaskNotificationMessage),
}

/// The first handshake of a run: the agent announces the session id it is
/// serving and the tools it has loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitMessage {
    pub session_id: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNotificationMessage {
    pub task_id: String,
    pub status: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
}

/// Terminal message of a run. `subtype == "success"` carries the result
/// text; any other subtype is an error whose `errors` list is joined into
/// the result text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_api_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(
        default,
        alias = "modelUsage",
        skip_serializing_if = "Option::is_none"
    )]
    pub model_usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_denials: Option<Vec<Value>>,
}
