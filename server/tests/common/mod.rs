//! Scripted in-process agent backend for end-to-end scenario tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use switchboard_core::AgentController;
use switchboard_core::AgentInvocation;
use switchboard_core::AgentLauncher;
use switchboard_core::AgentRun;
use switchboard_core::AgentStream;
use switchboard_core::AgentStreamError;
use switchboard_core::ToolPermissionHandler;
use switchboard_core::ToolPermissionQuery;
use switchboard_protocol::AgentMessage;
use switchboard_protocol::AssistantMessage;
use switchboard_protocol::InitMessage;
use switchboard_protocol::PermissionDecision;
use switchboard_protocol::ResultMessage;
use switchboard_protocol::StatusMessage;
use switchboard_protocol::StreamMessage;
use switchboard_protocol::SystemMessage;

pub enum Step {
    Yield(StreamMessage),
    Fail(AgentStreamError),
    AskPermission(ToolPermissionQuery),
    /// Park until the run is cancelled.
    Block,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRecord {
    pub resume: Option<String>,
    pub fork: bool,
}

#[derive(Default)]
pub struct ScriptedLauncher {
    runs: Mutex<VecDeque<Vec<Step>>>,
    pub invocations: Mutex<Vec<LaunchRecord>>,
    pub decisions: Arc<Mutex<Vec<PermissionDecision>>>,
}

impl ScriptedLauncher {
    pub fn with_runs(runs: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            runs: Mutex::new(runs.into()),
            ..Default::default()
        })
    }

    pub fn launch_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn launch(&self, invocation: AgentInvocation) -> Result<AgentRun, AgentStreamError> {
        self.invocations.lock().unwrap().push(LaunchRecord {
            resume: invocation.resume.clone(),
            fork: invocation.fork_session,
        });
        let steps = self.runs.lock().unwrap().pop_front().unwrap_or_default();
        Ok(AgentRun {
            stream: Box::new(ScriptedStream {
                steps: steps.into(),
                handler: invocation.permission_handler.clone(),
                decisions: self.decisions.clone(),
            }),
            controller: Arc::new(NoopController),
        })
    }
}

struct ScriptedStream {
    steps: VecDeque<Step>,
    handler: Arc<dyn ToolPermissionHandler>,
    decisions: Arc<Mutex<Vec<PermissionDecision>>>,
}

#[async_trait]
impl AgentStream for ScriptedStream {
    async fn next(&mut self) -> Option<Result<StreamMessage, AgentStreamError>> {
        loop {
            match self.steps.pop_front() {
                None => return None,
                Some(Step::Yield(message)) => return Some(Ok(message)),
                Some(Step::Fail(err)) => return Some(Err(err)),
                Some(Step::Block) => {
                    futures_pending().await;
                }
                Some(Step::AskPermission(query)) => {
                    let decision = self.handler.can_use_tool(query).await;
                    self.decisions.lock().unwrap().push(decision);
                }
            }
        }
    }
}

async fn futures_pending() {
    std::future::pending::<()>().await
}

struct NoopController;

impl AgentController for NoopController {
    fn close(&self) {}
    fn interrupt(&self) {}
}

pub fn init_msg(session_id: &str, tools: &[&str]) -> StreamMessage {
    AgentMessage::System(SystemMessage::Init(InitMessage {
        session_id: session_id.into(),
        tools: tools.iter().map(|s| s.to_string()).collect(),
        model: None,
        cwd: None,
        permission_mode: None,
    }))
    .into()
}

pub fn status_msg(status: &str) -> StreamMessage {
    AgentMessage::System(SystemMessage::Status(StatusMessage {
        status: status.into(),
        permission_mode: None,
    }))
    .into()
}

pub fn assistant_msg(text: &str) -> StreamMessage {
    AgentMessage::Assistant(AssistantMessage {
        message: json!({"role": "assistant", "content": [{"type": "text", "text": text}]}),
        parent_tool_use_id: None,
        error: None,
    })
    .into()
}

pub fn success_result(text: &str, num_turns: u32, cost: f64) -> StreamMessage {
    AgentMessage::Result(Box::new(ResultMessage {
        subtype: "success".into(),
        result: Some(text.into()),
        num_turns,
        total_cost_usd: cost,
        duration_ms: 10,
        ..Default::default()
    }))
    .into()
}

pub fn permission_query(tool: &str, tool_use_id: &str) -> ToolPermissionQuery {
    ToolPermissionQuery {
        tool_name: tool.into(),
        input: json!({"command": "echo hi"}),
        tool_use_id: tool_use_id.into(),
        ..Default::default()
    }
}
