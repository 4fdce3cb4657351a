//! Caller-facing protocol types for the switchboard session server.
//!
//! Everything in this module crosses the wire toward polling callers, so the
//! field casing here is part of the public contract: camelCase keys, with the
//! historical spellings `toolUseID`/`agentID` preserved verbatim.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

/// Lifecycle state of a session.
///
/// `Cancelled` and `Error` (with a stored terminal result) are terminal; the
/// only way out is a successful acquire for a fresh reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Running,
    WaitingPermission,
    Idle,
    Cancelled,
    Error,
}

impl SessionStatus {
    /// Statuses from which a reply may acquire the session.
    pub fn is_acquirable(self) -> bool {
        matches!(self, SessionStatus::Idle | SessionStatus::Error)
    }
}

/// Discriminator for buffered session events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionEventType {
    Output,
    Progress,
    PermissionRequest,
    PermissionResult,
    Result,
    Error,
}

impl SessionEventType {
    /// Terminal events mark the end of a run.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionEventType::Result | SessionEventType::Error)
    }

    /// Event types that are pinned against soft eviction by default.
    pub fn is_pinned_by_default(self) -> bool {
        matches!(
            self,
            SessionEventType::PermissionRequest
                | SessionEventType::PermissionResult
                | SessionEventType::Result
                | SessionEventType::Error
        )
    }
}

/// One element of a session's append-only event buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: SessionEventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub pinned: bool,
}

impl SessionEvent {
    /// The permission request id carried by `permission_request` /
    /// `permission_result` events, used by the eviction policy.
    pub fn request_id(&self) -> Option<&str> {
        self.data.get("requestId").and_then(Value::as_str)
    }
}

/// Terminal payload of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub session_id: String,
    pub result: String,
    pub is_error: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_api_ms: Option<u64>,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_total_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_denials: Option<Vec<Value>>,
}

/// A pending tool-use permission request as surfaced to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub input: Value,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_reason: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_path: Option<String>,
    #[serde(rename = "toolUseID")]
    pub tool_use_id: String,
    #[serde(rename = "agentID", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<Value>>,
    pub created_at: DateTime<Utc>,
}

/// Resolution of a permission request, handed back to the blocked agent call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "snake_case")]
pub enum PermissionDecision {
    #[serde(rename_all = "camelCase")]
    Allow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_permissions: Option<Value>,
    },
    Deny {
        message: String,
        #[serde(default)]
        interrupt: bool,
    },
}

impl PermissionDecision {
    pub fn allow() -> Self {
        PermissionDecision::Allow {
            updated_input: None,
            updated_permissions: None,
        }
    }

    pub fn deny(message: impl Into<String>, interrupt: bool) -> Self {
        PermissionDecision::Deny {
            message: message.into(),
            interrupt,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionDecision::Allow { .. })
    }

    /// The `behavior` tag as it appears on the wire.
    pub fn behavior(&self) -> &'static str {
        match self {
            PermissionDecision::Allow { .. } => "allow",
            PermissionDecision::Deny { .. } => "deny",
        }
    }
}

/// How a pending permission request came to be finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinishSource {
    Respond,
    Timeout,
    Cancel,
    Cleanup,
    Destroy,
    Signal,
}

/// Stable error codes; the wire form is `Error [<CODE>]: <message>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    SessionNotFound,
    SessionBusy,
    PermissionRequestNotFound,
    PermissionDenied,
    Timeout,
    Cancelled,
    Internal,
}
