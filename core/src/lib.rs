//! Session runtime for the switchboard server.
//!
//! Multiplexes many concurrent coding-agent sessions: each session owns an
//! event buffer with stable cursors, a pending-permission map, and a status
//! machine driven by one consumer task per run of the external agent stream.

mod agent;
mod config;
mod consumer;
mod error;
mod event_buffer;
mod permissions;
mod resume_token;
mod session;
mod session_manager;
mod tool_catalog;
mod util;

pub use agent::AgentController;
pub use agent::AgentInvocation;
pub use agent::AgentLauncher;
pub use agent::AgentRun;
pub use agent::AgentStream;
pub use agent::AgentStreamError;
pub use agent::ToolPermissionHandler;
pub use agent::ToolPermissionQuery;
pub use config::RuntimeConfig;
pub use consumer::InitCallback;
pub use consumer::QueryHandle;
pub use consumer::QueryMode;
pub use consumer::QuerySpec;
pub use consumer::consume_query;
pub use error::CoreError;
pub use error::Result;
pub use event_buffer::EventBuffer;
pub use event_buffer::ReadResult;
pub use resume_token::compute_resume_token;
pub use resume_token::verify_resume_token;
pub use session::SessionRecord;
pub use session_manager::PollView;
pub use session_manager::SessionManager;
pub use session_manager::ToolPolicy;
pub use tool_catalog::DiscoveredTool;
pub use tool_catalog::ToolInfo;
pub use tool_catalog::describe as describe_tool;
pub use tool_catalog::discover_tools_from_init;

pub use config::ALLOW_BYPASS_ENV;
pub use config::ALLOW_SENSITIVE_ENV;
pub use config::DISK_RESUME_ENV;
pub use config::RESUME_SECRET_ENV;
pub use config::RUNNING_MAX_ENV;
pub use config::SESSION_TTL_ENV;
pub use config::SWEEP_INTERVAL_ENV;
