//! Boundary to the external agent process.
//!
//! The agent itself (process management, wire framing, model traffic) is a
//! collaborator outside this crate; the session runtime only needs a way to
//! launch a run, iterate its message stream, signal close/interrupt, and
//! receive tool-permission callbacks. Tests script these traits directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use switchboard_protocol::PermissionDecision;
use switchboard_protocol::SessionConfig;
use switchboard_protocol::StreamMessage;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure of an agent stream (launch or mid-iteration).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentStreamError {
    /// The stream was torn down by an abort (ours or the library's).
    #[error("agent stream aborted")]
    Aborted,

    /// Any other failure; the message is matched against transient markers.
    #[error("{0}")]
    Stream(String),
}

/// One launch request for the agent.
#[derive(Clone)]
pub struct AgentInvocation {
    pub prompt: String,
    pub config: SessionConfig,
    /// Session id to resume from, when continuing or retrying a session.
    pub resume: Option<String>,
    /// Ask the agent to branch instead of continuing in place.
    pub fork_session: bool,
    /// Callback the agent blocks on for per-tool-use permission decisions.
    pub permission_handler: Arc<dyn ToolPermissionHandler>,
}

/// A tool-use permission question posed by the agent.
#[derive(Debug, Clone, Default)]
pub struct ToolPermissionQuery {
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: String,
    pub agent_id: Option<String>,
    /// Short human-readable summary supplied by the agent, when it has one.
    pub summary: Option<String>,
    pub description: Option<String>,
    pub decision_reason: Option<Value>,
    pub blocked_path: Option<String>,
    pub suggestions: Option<Vec<Value>>,
    /// Per-call abort signal supplied by the agent library. May already be
    /// tripped when the call arrives.
    pub signal: Option<CancellationToken>,
}

#[async_trait]
pub trait ToolPermissionHandler: Send + Sync {
    async fn can_use_tool(&self, query: ToolPermissionQuery) -> PermissionDecision;
}

/// The message stream of one launched run.
#[async_trait]
pub trait AgentStream: Send {
    /// Next message, an error, or `None` at end of stream.
    async fn next(&mut self) -> Option<Result<StreamMessage, AgentStreamError>>;
}

/// Out-of-band control over a launched run.
pub trait AgentController: Send + Sync {
    fn close(&self);
    fn interrupt(&self);
}

pub struct AgentRun {
    pub stream: Box<dyn AgentStream>,
    pub controller: Arc<dyn AgentController>,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, invocation: AgentInvocation) -> Result<AgentRun, AgentStreamError>;
}
