//! Default agent backend: one child process per run.
//!
//! The child receives the launch request as one JSON line on stdin, then
//! streams messages as JSON lines on stdout. Tool-permission questions
//! arrive interleaved as `control_request` lines and are answered with
//! `control_response` lines on stdin; everything else is handed to the
//! session runtime untouched.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use switchboard_core::AgentController;
use switchboard_core::AgentInvocation;
use switchboard_core::AgentLauncher;
use switchboard_core::AgentRun;
use switchboard_core::AgentStream;
use switchboard_core::AgentStreamError;
use switchboard_core::ToolPermissionHandler;
use switchboard_core::ToolPermissionQuery;
use switchboard_protocol::StreamMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::process::Child;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::error;
use tracing::warn;

const DEFAULT_AGENT_EXECUTABLE: &str = "claude";

pub struct AgentProcessLauncher {
    executable: Option<String>,
}

impl AgentProcessLauncher {
    pub fn new(executable: Option<String>) -> Self {
        Self { executable }
    }
}

impl Default for AgentProcessLauncher {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl AgentLauncher for AgentProcessLauncher {
    async fn launch(&self, invocation: AgentInvocation) -> Result<AgentRun, AgentStreamError> {
        let executable = invocation
            .config
            .path_to_executable
            .clone()
            .or_else(|| self.executable.clone())
            .unwrap_or_else(|| DEFAULT_AGENT_EXECUTABLE.to_string());

        let mut command = Command::new(&executable);
        command
            .current_dir(&invocation.config.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(env) = &invocation.config.env {
            command.env_clear().envs(env);
        }

        let mut child = command
            .spawn()
            .map_err(|err| AgentStreamError::Stream(format!("failed to spawn {executable}: {err}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentStreamError::Stream("child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentStreamError::Stream("child stdout not captured".to_string()))?;

        let header = json!({
            "prompt": invocation.prompt,
            "resume": invocation.resume,
            "forkSession": invocation.fork_session,
            "options": invocation.config,
        });
        let mut line = header.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AgentStreamError::Stream(format!("failed to send launch request: {err}")))?;

        // All writes to the child (permission answers, interrupts) funnel
        // through one task so they cannot interleave mid-line.
        let (control_tx, mut control_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(message) = control_rx.recv().await {
                let mut message = message;
                message.push('\n');
                if stdin.write_all(message.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let child = Arc::new(Mutex::new(child));
        Ok(AgentRun {
            stream: Box::new(ProcessStream {
                lines: BufReader::new(stdout).lines(),
                handler: invocation.permission_handler.clone(),
                control_tx: control_tx.clone(),
            }),
            controller: Arc::new(ProcessController { child, control_tx }),
        })
    }
}

struct ProcessStream {
    lines: Lines<BufReader<ChildStdout>>,
    handler: Arc<dyn ToolPermissionHandler>,
    control_tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl AgentStream for ProcessStream {
    async fn next(&mut self) -> Option<Result<StreamMessage, AgentStreamError>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => return Some(Err(AgentStreamError::Stream(err.to_string()))),
            };
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(err) => {
                    warn!("dropping unparseable agent output line: {err}");
                    continue;
                }
            };
            if let Some((request_id, query)) = parse_can_use_tool(&value) {
                let handler = self.handler.clone();
                let control_tx = self.control_tx.clone();
                tokio::spawn(async move {
                    let decision = handler.can_use_tool(query).await;
                    let response = json!({
                        "type": "control_response",
                        "request_id": request_id,
                        "response": decision,
                    });
                    if control_tx.send(response.to_string()).is_err() {
                        error!("agent exited before permission response could be sent");
                    }
                });
                continue;
            }
            // Unknown message types survive as `Other` and are dropped by
            // the consumer, so this parse cannot fail.
            match serde_json::from_value::<StreamMessage>(value.clone()) {
                Ok(message) => return Some(Ok(message)),
                Err(_) => return Some(Ok(StreamMessage::Other(value))),
            }
        }
    }
}

struct ProcessController {
    child: Arc<Mutex<Child>>,
    control_tx: mpsc::UnboundedSender<String>,
}

impl AgentController for ProcessController {
    // Poisoned mutex should fail the program
    #[allow(clippy::unwrap_used)]
    fn close(&self) {
        if let Err(err) = self.child.lock().unwrap().start_kill() {
            warn!("failed to kill agent process: {err}");
        }
    }

    fn interrupt(&self) {
        let message = json!({"type": "control_request", "subtype": "interrupt"});
        let _ = self.control_tx.send(message.to_string());
    }
}

/// A `control_request`/`can_use_tool` line from the child, if that is what
/// this is.
fn parse_can_use_tool(value: &Value) -> Option<(String, ToolPermissionQuery)> {
    if value.get("type").and_then(Value::as_str) != Some("control_request")
        || value.get("subtype").and_then(Value::as_str) != Some("can_use_tool")
    {
        return None;
    }
    let request_id = value.get("request_id").and_then(Value::as_str)?.to_string();
    let params = value.get("params").unwrap_or(&Value::Null);
    let string_field =
        |key: &str| params.get(key).and_then(Value::as_str).map(str::to_string);
    let query = ToolPermissionQuery {
        tool_name: string_field("tool_name")?,
        input: params.get("input").cloned().unwrap_or(Value::Null),
        tool_use_id: string_field("tool_use_id").unwrap_or_default(),
        agent_id: string_field("agent_id"),
        summary: string_field("summary"),
        description: string_field("description"),
        decision_reason: params.get("decision_reason").cloned(),
        blocked_path: string_field("blocked_path"),
        suggestions: params
            .get("suggestions")
            .and_then(Value::as_array)
            .cloned(),
        signal: None,
    };
    Some((request_id, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_can_use_tool_control_request() {
        let value = json!({
            "type": "control_request",
            "subtype": "can_use_tool",
            "request_id": "cr-1",
            "params": {
                "tool_name": "Bash",
                "input": {"command": "echo hi"},
                "tool_use_id": "tu1",
                "blocked_path": "/etc/passwd"
            }
        });
        let (request_id, query) = parse_can_use_tool(&value).unwrap();
        assert_eq!(request_id, "cr-1");
        assert_eq!(query.tool_name, "Bash");
        assert_eq!(query.tool_use_id, "tu1");
        assert_eq!(query.blocked_path.as_deref(), Some("/etc/passwd"));
    }

    #[test]
    fn ignores_non_permission_lines() {
        assert!(parse_can_use_tool(&json!({"type": "assistant"})).is_none());
        assert!(
            parse_can_use_tool(&json!({"type": "control_request", "subtype": "interrupt"}))
                .is_none()
        );
    }
}
