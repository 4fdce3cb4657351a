// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Drives one run of the external agent stream.
//!
//! A run starts in one of three modes (start, resume, disk-resume), gates on
//! the first `system/init` message when asked to, translates stream messages
//! into session events, bridges tool-permission callbacks to the broker, and
//! finishes with exactly one terminal event — retrying with `resume` up to
//! three times when the stream fails transiently.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use switchboard_protocol::AgentMessage;
use switchboard_protocol::AgentResult;
use switchboard_protocol::FinishSource;
use switchboard_protocol::InitMessage;
use switchboard_protocol::PermissionDecision;
use switchboard_protocol::PermissionRequest;
use switchboard_protocol::SessionConfig;
use switchboard_protocol::SessionEventType;
use switchboard_protocol::SessionStatus;
use switchboard_protocol::StreamMessage;
use switchboard_protocol::SystemMessage;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::agent::AgentController;
use crate::agent::AgentInvocation;
use crate::agent::AgentLauncher;
use crate::agent::AgentStream;
use crate::agent::AgentStreamError;
use crate::agent::ToolPermissionHandler;
use crate::agent::ToolPermissionQuery;
use crate::error::CoreError;
use crate::session_manager::SessionManager;
use crate::util::backoff;
use crate::util::random_hex_suffix;

const MAX_RETRIES: u32 = 3;

/// Substrings marking a stream failure as transient and therefore retryable.
const TRANSIENT_MARKERS: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ENOTFOUND",
    "EAI_AGAIN",
    "EPIPE",
    "stream ended unexpectedly",
    "socket hang up",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Start,
    Resume,
    DiskResume,
}

/// One consume-query invocation.
pub struct QuerySpec {
    pub mode: QueryMode,
    pub prompt: String,
    pub config: SessionConfig,
    /// Known session id for resume/disk-resume; `None` for start.
    pub session_id: Option<String>,
    pub fork_session: bool,
    /// Gate on the first init message (start, and fork replies).
    pub wait_for_init: bool,
    pub cancel: CancellationToken,
    pub permission_timeout: Duration,
    pub init_timeout: Duration,
    /// Orchestrator side effect on (each) init message; must be idempotent.
    pub on_init: Option<InitCallback>,
}

pub type InitCallback = Arc<dyn Fn(&InitMessage) + Send + Sync>;

/// Handle to a launched run.
pub struct QueryHandle {
    session_id_rx: oneshot::Receiver<Result<String, CoreError>>,
    pub done: JoinHandle<()>,
    cancel: CancellationToken,
    controller: Arc<Mutex<Option<Arc<dyn AgentController>>>>,
}

impl QueryHandle {
    /// Resolves with the session id announced by the first init message (or
    /// the known id when init is not awaited). Errors mirror the init-gating
    /// rules: TIMEOUT, CANCELLED, or INTERNAL.
    pub async fn session_id(&mut self) -> Result<String, CoreError> {
        match (&mut self.session_id_rx).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Internal(
                "query ended before a session id was available".to_string(),
            )),
        }
    }

    /// Signal the stream's close path, then fire the run's cancel handle.
    pub fn close(&self) {
        if let Some(controller) = self.controller.lock().unwrap().as_ref() {
            controller.close();
        }
        self.cancel.cancel();
    }

    /// Signal only the stream's interrupt path; the run keeps going.
    pub fn interrupt(&self) {
        if let Some(controller) = self.controller.lock().unwrap().as_ref() {
            controller.interrupt();
        }
    }
}

pub fn consume_query(
    manager: SessionManager,
    launcher: Arc<dyn AgentLauncher>,
    spec: QuerySpec,
) -> QueryHandle {
    let (sid_tx, sid_rx) = oneshot::channel();
    let cancel = spec.cancel.clone();
    let controller: Arc<Mutex<Option<Arc<dyn AgentController>>>> = Arc::new(Mutex::new(None));

    let session_cell: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
    if !spec.wait_for_init
        && let Some(session_id) = &spec.session_id
    {
        let _ = session_cell.set(session_id.clone());
    }

    let bridge = Arc::new(PermissionBridge {
        manager: manager.clone(),
        session_id: session_cell.clone(),
        timeout: spec.permission_timeout,
    });

    let done = tokio::spawn(run_query(
        manager,
        launcher,
        spec,
        bridge,
        session_cell,
        controller.clone(),
        sid_tx,
    ));

    QueryHandle {
        session_id_rx: sid_rx,
        done,
        cancel,
        controller,
    }
}

/// Outcome of handling one message or stream failure.
enum Flow {
    Continue,
    Retry,
    Finished,
}

struct RunContext {
    manager: SessionManager,
    spec: QuerySpec,
    session_cell: Arc<OnceLock<String>>,
    sid_tx: Option<oneshot::Sender<Result<String, CoreError>>>,
    /// Resume target for rebuilt streams; updated once init announces an id.
    resume: Option<String>,
    fork_flag: bool,
    init_seen: bool,
    pre_init: Vec<AgentMessage>,
    result_seen: bool,
    retry_count: u32,
}

impl RunContext {
    fn init_resolved(&self) -> bool {
        self.init_seen || !self.spec.wait_for_init
    }

    fn session_id(&self) -> Option<&str> {
        self.session_cell.get().map(String::as_str)
    }

    fn resolve_sid(&mut self, result: Result<String, CoreError>) {
        if let Some(tx) = self.sid_tx.take() {
            let _ = tx.send(result);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_query(
    manager: SessionManager,
    launcher: Arc<dyn AgentLauncher>,
    spec: QuerySpec,
    bridge: Arc<PermissionBridge>,
    session_cell: Arc<OnceLock<String>>,
    controller_slot: Arc<Mutex<Option<Arc<dyn AgentController>>>>,
    sid_tx: oneshot::Sender<Result<String, CoreError>>,
) {
    let mut ctx = RunContext {
        resume: spec.session_id.clone(),
        fork_flag: spec.fork_session,
        manager,
        spec,
        session_cell,
        sid_tx: Some(sid_tx),
        init_seen: false,
        pre_init: Vec::new(),
        result_seen: false,
        retry_count: 0,
    };
    debug!(mode = ?ctx.spec.mode, fork = ctx.spec.fork_session, "consume query starting");

    // Without init gating the session id is known up front.
    if !ctx.spec.wait_for_init {
        let known = ctx.spec.session_id.clone();
        match known {
            Some(session_id) => ctx.resolve_sid(Ok(session_id)),
            None => {
                ctx.resolve_sid(Err(CoreError::Internal(
                    "resume requested without a session id".to_string(),
                )));
                return;
            }
        }
    }

    let init_deadline = tokio::time::Instant::now() + ctx.spec.init_timeout;

    'attempts: loop {
        let invocation = AgentInvocation {
            prompt: ctx.spec.prompt.clone(),
            config: ctx.spec.config.clone(),
            resume: ctx.resume.clone(),
            fork_session: ctx.fork_flag,
            permission_handler: bridge.clone(),
        };

        let run = match launcher.launch(invocation).await {
            Ok(run) => run,
            Err(err) => match handle_stream_failure(&mut ctx, err).await {
                Flow::Retry => continue 'attempts,
                _ => return,
            },
        };
        let controller = run.controller.clone();
        *controller_slot.lock().unwrap() = Some(run.controller);
        let mut stream = run.stream;

        loop {
            let item = tokio::select! {
                biased;
                _ = ctx.spec.cancel.cancelled() => {
                    finalize_abort(&mut ctx);
                    return;
                }
                _ = tokio::time::sleep_until(init_deadline),
                    if ctx.spec.wait_for_init && !ctx.init_seen =>
                {
                    controller.close();
                    ctx.spec.cancel.cancel();
                    ctx.resolve_sid(Err(CoreError::Timeout(
                        "Timed out waiting for session init".to_string(),
                    )));
                    return;
                }
                item = stream.next() => item,
            };

            match item {
                Some(Ok(message)) => match handle_message(&mut ctx, message) {
                    Flow::Continue => {}
                    Flow::Finished => return,
                    Flow::Retry => continue 'attempts,
                },
                None => {
                    handle_stream_end(&mut ctx);
                    return;
                }
                Some(Err(err)) => match handle_stream_failure(&mut ctx, err).await {
                    Flow::Retry => continue 'attempts,
                    _ => return,
                },
            }
        }
    }
}

fn handle_message(ctx: &mut RunContext, message: StreamMessage) -> Flow {
    let message = match message {
        StreamMessage::Known(message) => message,
        StreamMessage::Other(value) => {
            trace!(?value, "dropping unrecognized agent message");
            return Flow::Continue;
        }
    };

    if let AgentMessage::System(SystemMessage::Init(init)) = &message {
        return handle_init(ctx, init.clone());
    }

    // Pre-init messages are buffered and replayed once init arrives.
    if ctx.spec.wait_for_init && !ctx.init_seen {
        ctx.pre_init.push(message);
        return Flow::Continue;
    }

    translate_message(ctx, message)
}

fn handle_init(ctx: &mut RunContext, init: InitMessage) -> Flow {
    ctx.init_seen = true;
    if let Some(on_init) = &ctx.spec.on_init {
        on_init(&init);
    }
    // First init wins; retries may re-announce the same session.
    let _ = ctx.session_cell.set(init.session_id.clone());
    ctx.manager
        .set_init_tools(&init.session_id, init.tools.clone());
    // Retries of this run continue the announced session in place.
    ctx.resume = Some(init.session_id.clone());
    ctx.fork_flag = false;
    ctx.resolve_sid(Ok(init.session_id.clone()));
    debug!(session_id = %init.session_id, "session init received");

    for buffered in std::mem::take(&mut ctx.pre_init) {
        match translate_message(ctx, buffered) {
            Flow::Continue => {}
            other => return other,
        }
    }
    Flow::Continue
}

/// Translate one post-init message into at most one buffered event.
fn translate_message(ctx: &mut RunContext, message: AgentMessage) -> Flow {
    let Some(session_id) = ctx.session_id().map(str::to_string) else {
        trace!("dropping agent message with no session to route to");
        return Flow::Continue;
    };

    if let Some(tool_use_id) = message.tool_use_id() {
        ctx.manager.note_tool_use(&session_id, tool_use_id);
    }

    match message {
        AgentMessage::Result(result) => {
            if ctx.result_seen {
                return Flow::Continue;
            }
            ctx.result_seen = true;
            let agent_result = build_agent_result(&session_id, *result);
            ctx.manager
                .record_terminal(&session_id, agent_result, ctx.spec.fork_session);
            Flow::Finished
        }
        AgentMessage::Assistant(m) => {
            let mut data = json!({"type": "assistant", "message": m.message});
            if let Some(parent) = m.parent_tool_use_id {
                data["parent_tool_use_id"] = json!(parent);
            }
            if let Some(error) = m.error {
                data["error"] = error;
            }
            ctx.manager
                .push_event(&session_id, SessionEventType::Output, data, None);
            Flow::Continue
        }
        AgentMessage::ToolUseSummary(m) => {
            ctx.manager.push_event(
                &session_id,
                SessionEventType::Progress,
                json!({"type": "tool_use_summary", "summary": m.summary}),
                None,
            );
            Flow::Continue
        }
        AgentMessage::ToolProgress(m) => {
            ctx.manager.push_event(
                &session_id,
                SessionEventType::Progress,
                json!({
                    "type": "tool_progress",
                    "tool_use_id": m.tool_use_id,
                    "tool_name": m.tool_name,
                    "elapsed_time_seconds": m.elapsed_time_seconds,
                }),
                None,
            );
            Flow::Continue
        }
        AgentMessage::AuthStatus(m) => {
            let mut data = json!({"type": "auth_status", "isAuthenticating": m.is_authenticating});
            if let Some(output) = m.output {
                data["output"] = json!(output);
            }
            if let Some(error) = m.error {
                data["error"] = json!(error);
            }
            ctx.manager
                .push_event(&session_id, SessionEventType::Progress, data, None);
            Flow::Continue
        }
        AgentMessage::System(SystemMessage::Status(m)) => {
            let mut data = json!({"type": "status", "status": m.status});
            if let Some(mode) = m.permission_mode {
                data["permissionMode"] = json!(mode);
            }
            ctx.manager
                .push_event(&session_id, SessionEventType::Progress, data, None);
            Flow::Continue
        }
        AgentMessage::System(SystemMessage::TaskNotification(m)) => {
            let mut data = json!({
                "type": "task_notification",
                "task_id": m.task_id,
                "status": m.status,
                "summary": m.summary,
            });
            if let Some(output_file) = m.output_file {
                data["output_file"] = json!(output_file);
            }
            ctx.manager
                .push_event(&session_id, SessionEventType::Progress, data, None);
            Flow::Continue
        }
        AgentMessage::System(SystemMessage::Init(_)) => Flow::Continue,
    }
}

fn build_agent_result(session_id: &str, result: switchboard_protocol::ResultMessage) -> AgentResult {
    let is_success = result.subtype == "success";
    let result_text = if is_success {
        result.result.unwrap_or_default()
    } else if result.errors.is_empty() {
        result.result.unwrap_or_else(|| result.subtype.clone())
    } else {
        result.errors.join("\n")
    };
    AgentResult {
        session_id: session_id.to_string(),
        result: result_text,
        is_error: !is_success,
        duration_ms: result.duration_ms,
        duration_api_ms: result.duration_api_ms,
        num_turns: result.num_turns,
        total_cost_usd: result.total_cost_usd,
        session_total_turns: None,
        session_total_cost_usd: None,
        structured_output: if is_success {
            result.structured_output
        } else {
            None
        },
        stop_reason: result.stop_reason,
        error_subtype: (!is_success).then_some(result.subtype),
        usage: result.usage,
        model_usage: result.model_usage,
        permission_denials: result.permission_denials,
    }
}

fn error_agent_result(session_id: &str, text: impl Into<String>) -> AgentResult {
    AgentResult {
        session_id: session_id.to_string(),
        result: text.into(),
        is_error: true,
        duration_ms: 0,
        num_turns: 0,
        total_cost_usd: 0.0,
        ..Default::default()
    }
}

fn handle_stream_end(ctx: &mut RunContext) {
    if ctx.spec.wait_for_init && !ctx.init_seen {
        ctx.resolve_sid(Err(CoreError::Internal(
            "query stream ended before receiving session init".to_string(),
        )));
        return;
    }
    let Some(session_id) = ctx.session_id().map(str::to_string) else {
        return;
    };
    if ctx.manager.status(&session_id) == Some(SessionStatus::Cancelled) {
        return;
    }
    warn!(%session_id, "agent stream ended without a result message");
    ctx.manager.finish_all(
        &session_id,
        PermissionDecision::deny("Session ended before permission was resolved.", false),
        FinishSource::Cleanup,
    );
    let result = error_agent_result(
        &session_id,
        "Error [INTERNAL]: No result message received from agent.",
    );
    ctx.manager.record_failure(&session_id, result);
}

fn finalize_abort(ctx: &mut RunContext) {
    if !ctx.init_resolved() {
        ctx.resolve_sid(Err(CoreError::Cancelled("Session cancelled".to_string())));
        return;
    }
    let Some(session_id) = ctx.session_id().map(str::to_string) else {
        return;
    };
    ctx.manager.finish_all(
        &session_id,
        PermissionDecision::deny("Session failed before permission was resolved.", false),
        FinishSource::Cleanup,
    );
    let result = error_agent_result(&session_id, "Error [CANCELLED]: Session was cancelled.");
    ctx.manager.record_failure(&session_id, result);
}

fn finalize_fatal(ctx: &mut RunContext, message: String) {
    if !ctx.init_resolved() {
        ctx.resolve_sid(Err(CoreError::Internal(message)));
        return;
    }
    let Some(session_id) = ctx.session_id().map(str::to_string) else {
        return;
    };
    ctx.manager.finish_all(
        &session_id,
        PermissionDecision::deny("Session failed before permission was resolved.", false),
        FinishSource::Cleanup,
    );
    let result = error_agent_result(&session_id, format!("Error [INTERNAL]: {message}"));
    ctx.manager.record_failure(&session_id, result);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    Abort,
    Transient,
    Fatal,
}

fn classify_stream_error(err: &AgentStreamError, cancel: &CancellationToken) -> ErrorClass {
    if cancel.is_cancelled() {
        return ErrorClass::Abort;
    }
    match err {
        AgentStreamError::Aborted => ErrorClass::Abort,
        AgentStreamError::Stream(message) => {
            if TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal
            }
        }
    }
}

async fn handle_stream_failure(ctx: &mut RunContext, err: AgentStreamError) -> Flow {
    match classify_stream_error(&err, &ctx.spec.cancel) {
        ErrorClass::Abort => {
            finalize_abort(ctx);
            Flow::Finished
        }
        ErrorClass::Transient if ctx.init_resolved() && ctx.retry_count < MAX_RETRIES => {
            ctx.retry_count += 1;
            let delay = backoff(ctx.retry_count);
            let session_id = ctx.session_id().map(str::to_string);
            if let Some(session_id) = &session_id {
                warn!(
                    %session_id,
                    attempt = ctx.retry_count,
                    ?delay,
                    "transient stream error, retrying: {err}"
                );
                ctx.manager.push_event(
                    session_id,
                    SessionEventType::Progress,
                    json!({
                        "type": "retry",
                        "attempt": ctx.retry_count,
                        "maxRetries": MAX_RETRIES,
                        "delayMs": delay.as_millis() as u64,
                        "error": err.to_string(),
                    }),
                    None,
                );
            }
            // The backoff sleep races the cancel handle; an abort mid-delay
            // returns without recording an additional error.
            tokio::select! {
                _ = ctx.spec.cancel.cancelled() => return Flow::Finished,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(session_id) = &session_id {
                ctx.manager.finish_all(
                    session_id,
                    PermissionDecision::deny("Retrying after transient error.", false),
                    FinishSource::Cleanup,
                );
                ctx.resume = Some(session_id.clone());
            }
            ctx.fork_flag = false;
            Flow::Retry
        }
        ErrorClass::Transient | ErrorClass::Fatal => {
            finalize_fatal(ctx, err.to_string());
            Flow::Finished
        }
    }
}

/// The `canUseTool` callback handed to the agent stream.
struct PermissionBridge {
    manager: SessionManager,
    session_id: Arc<OnceLock<String>>,
    timeout: Duration,
}

#[async_trait]
impl ToolPermissionHandler for PermissionBridge {
    async fn can_use_tool(&self, query: ToolPermissionQuery) -> PermissionDecision {
        // An already-aborted call resolves synchronously; the outer timeout
        // never enters the picture.
        if query.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
            return PermissionDecision::deny("Session cancelled", true);
        }
        let Some(session_id) = self.session_id.get().cloned() else {
            return PermissionDecision::deny("Session no longer exists.", true);
        };
        let Some(policy) = self.manager.tool_policy(&session_id) else {
            return PermissionDecision::deny("Session no longer exists.", true);
        };

        // Policy fast paths: no pending entry is created for either.
        if policy.disallowed_tools.iter().any(|t| t == &query.tool_name) {
            return PermissionDecision::deny(
                format!("Tool '{}' is disallowed by session policy", query.tool_name),
                false,
            );
        }
        if query.blocked_path.is_none()
            && policy.allowed_tools.iter().any(|t| t == &query.tool_name)
        {
            return PermissionDecision::allow();
        }

        // Tool-use ids are occasionally absent on the call itself; fall back
        // to the last one seen on the stream.
        let tool_use_id = if query.tool_use_id.is_empty() {
            self.manager
                .last_tool_use_id(&session_id)
                .unwrap_or_default()
        } else {
            query.tool_use_id.clone()
        };
        let request_id = format!(
            "{}:{}:{}:{}",
            tool_use_id,
            query.tool_name,
            Utc::now().timestamp_millis(),
            random_hex_suffix(),
        );
        let record = PermissionRequest {
            request_id: request_id.clone(),
            tool_name: query.tool_name.clone(),
            input: query.input.clone(),
            summary: query
                .summary
                .clone()
                .unwrap_or_else(|| query.tool_name.clone()),
            description: query.description.clone(),
            decision_reason: query.decision_reason.clone(),
            blocked_path: query.blocked_path.clone(),
            tool_use_id,
            agent_id: query.agent_id.clone(),
            suggestions: query.suggestions.clone(),
            created_at: Utc::now(),
        };

        let (waiter_tx, waiter_rx) = oneshot::channel();
        if !self
            .manager
            .set_pending(&session_id, record, waiter_tx, self.timeout)
        {
            return PermissionDecision::deny("Session no longer exists.", true);
        }

        let signal = query.signal.clone().unwrap_or_default();
        tokio::select! {
            decision = waiter_rx => decision.unwrap_or_else(|_| {
                PermissionDecision::deny("Session no longer exists.", true)
            }),
            _ = signal.cancelled() => {
                self.manager.finish_request(
                    &session_id,
                    &request_id,
                    PermissionDecision::deny("Session cancelled", true),
                    FinishSource::Signal,
                );
                PermissionDecision::deny("Session cancelled", true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use pretty_assertions::assert_eq;
    use switchboard_protocol::AssistantMessage;
    use switchboard_protocol::ResultMessage;
    use switchboard_protocol::StatusMessage;

    use crate::agent::AgentRun;
    use crate::config::RuntimeConfig;

    enum Step {
        Yield(StreamMessage),
        Fail(AgentStreamError),
        AskPermission(ToolPermissionQuery),
        /// Park forever; the consumer only gets out via cancellation.
        Block,
    }

    struct ScriptedStream {
        steps: VecDeque<Step>,
        handler: Arc<dyn ToolPermissionHandler>,
        decisions: Arc<StdMutex<Vec<PermissionDecision>>>,
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
                        futures::future::pending::<()>().await;
                    }
                    Some(Step::AskPermission(query)) => {
                        let decision = self.handler.can_use_tool(query).await;
                        self.decisions.lock().unwrap().push(decision);
                    }
                }
            }
        }
    }

    struct NoopController;

    impl AgentController for NoopController {
        fn close(&self) {}
        fn interrupt(&self) {}
    }

    #[derive(Default)]
    struct ScriptedLauncher {
        runs: StdMutex<VecDeque<Vec<Step>>>,
        invocations: StdMutex<Vec<(Option<String>, bool)>>,
        decisions: Arc<StdMutex<Vec<PermissionDecision>>>,
    }

    impl ScriptedLauncher {
        fn with_runs(runs: Vec<Vec<Step>>) -> Arc<Self> {
            Arc::new(Self {
                runs: StdMutex::new(runs.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl AgentLauncher for ScriptedLauncher {
        async fn launch(
            &self,
            invocation: AgentInvocation,
        ) -> Result<AgentRun, AgentStreamError> {
            self.invocations
                .lock()
                .unwrap()
                .push((invocation.resume.clone(), invocation.fork_session));
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

    fn init_msg(session_id: &str, tools: &[&str]) -> StreamMessage {
        AgentMessage::System(SystemMessage::Init(InitMessage {
            session_id: session_id.into(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            model: None,
            cwd: None,
            permission_mode: None,
        }))
        .into()
    }

    fn status_msg(status: &str) -> StreamMessage {
        AgentMessage::System(SystemMessage::Status(StatusMessage {
            status: status.into(),
            permission_mode: None,
        }))
        .into()
    }

    fn assistant_msg(text: &str) -> StreamMessage {
        AgentMessage::Assistant(AssistantMessage {
            message: json!({"role": "assistant", "content": [{"type": "text", "text": text}]}),
            parent_tool_use_id: None,
            error: None,
        })
        .into()
    }

    fn success_result(text: &str, num_turns: u32, cost: f64) -> StreamMessage {
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

    fn permission_query(tool: &str, signal: Option<CancellationToken>) -> ToolPermissionQuery {
        ToolPermissionQuery {
            tool_name: tool.into(),
            input: json!({"command": "echo hi"}),
            tool_use_id: "tu1".into(),
            signal,
            ..Default::default()
        }
    }

    fn start_spec(manager: &SessionManager, cancel: CancellationToken) -> QuerySpec {
        let config = SessionConfig {
            cwd: "/repo".into(),
            ..Default::default()
        };
        let on_init: InitCallback = {
            let manager = manager.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            Arc::new(move |init: &InitMessage| {
                manager.create_if_absent(&init.session_id, config.clone(), cancel.clone());
            })
        };
        QuerySpec {
            mode: QueryMode::Start,
            prompt: "fix the bug".into(),
            config,
            session_id: None,
            fork_session: false,
            wait_for_init: true,
            cancel,
            permission_timeout: Duration::from_secs(60),
            init_timeout: Duration::from_secs(30),
            on_init: Some(on_init),
        }
    }

    async fn wait_for_status(manager: &SessionManager, session_id: &str, status: SessionStatus) {
        for _ in 0..500 {
            if manager.status(session_id) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("session {session_id} never reached {status}");
    }

    #[tokio::test]
    async fn start_run_reaches_idle_with_stored_result() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(status_msg("compacting")),
            Step::Yield(init_msg("sess-123", &["Read"])),
            Step::Yield(success_result("Fixed", 1, 0.01)),
        ]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );

        assert_eq!(handle.session_id().await.unwrap(), "sess-123");
        handle.done.await.unwrap();

        assert_eq!(manager.status("sess-123"), Some(SessionStatus::Idle));
        let stored = manager.stored_result("sess-123").unwrap();
        assert_eq!(stored.result, "Fixed");
        assert_eq!(stored.session_total_turns, Some(1));
        assert_eq!(manager.init_tools("sess-123").unwrap(), vec!["Read".to_string()]);

        // The pre-init status message was flushed as a progress event.
        let view = manager.poll_view("sess-123", None).unwrap();
        assert!(view
            .events
            .iter()
            .any(|e| e.event_type == SessionEventType::Progress));
        assert!(view
            .events
            .iter()
            .any(|e| e.event_type == SessionEventType::Result));
    }

    #[tokio::test]
    async fn permission_flow_round_trips_through_broker() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-perm", &["Bash"])),
            Step::AskPermission(permission_query("Bash", None)),
            Step::Yield(success_result("done", 1, 0.0)),
        ]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-perm");

        wait_for_status(&manager, "sess-perm", SessionStatus::WaitingPermission).await;
        let view = manager.poll_view("sess-perm", None).unwrap();
        assert_eq!(view.actions.len(), 1);
        let request_id = view.actions[0].request_id.clone();
        assert!(request_id.starts_with("tu1:Bash:"));

        assert!(manager.finish_request(
            "sess-perm",
            &request_id,
            PermissionDecision::allow(),
            FinishSource::Respond,
        ));

        handle.done.await.unwrap();
        assert_eq!(manager.status("sess-perm"), Some(SessionStatus::Idle));
        let decisions = launcher.decisions.lock().unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].is_allow());
    }

    #[tokio::test]
    async fn pre_aborted_signal_denies_synchronously() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let aborted = CancellationToken::new();
        aborted.cancel();
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-abort", &[])),
            Step::AskPermission(permission_query("Bash", Some(aborted))),
            Step::Yield(success_result("done", 1, 0.0)),
        ]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-abort");
        handle.done.await.unwrap();

        let decisions = launcher.decisions.lock().unwrap();
        assert_eq!(
            decisions[0],
            PermissionDecision::deny("Session cancelled", true)
        );
        // No pending entry was ever created.
        let view = manager.poll_view("sess-abort", None).unwrap();
        assert!(!view
            .events
            .iter()
            .any(|e| e.event_type == SessionEventType::PermissionRequest));
    }

    #[tokio::test]
    async fn allowed_tool_fast_path_skips_registration() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-fast", &["Bash"])),
            Step::AskPermission(permission_query("Bash", None)),
            Step::Yield(success_result("done", 1, 0.0)),
        ]]);

        let cancel = CancellationToken::new();
        let mut spec = start_spec(&manager, cancel.clone());
        let config = SessionConfig {
            cwd: "/repo".into(),
            allowed_tools: vec!["Bash".into()],
            ..Default::default()
        };
        spec.config = config.clone();
        spec.on_init = Some({
            let manager = manager.clone();
            Arc::new(move |init: &InitMessage| {
                manager.create_if_absent(&init.session_id, config.clone(), cancel.clone());
            })
        });

        let mut handle = consume_query(manager.clone(), launcher.clone(), spec);
        assert_eq!(handle.session_id().await.unwrap(), "sess-fast");
        handle.done.await.unwrap();

        let decisions = launcher.decisions.lock().unwrap();
        assert!(decisions[0].is_allow());
        let view = manager.poll_view("sess-fast", None).unwrap();
        assert!(!view
            .events
            .iter()
            .any(|e| e.event_type == SessionEventType::PermissionRequest));
    }

    #[tokio::test]
    async fn disallowed_tool_fast_path_denies_without_registration() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-deny", &[])),
            Step::AskPermission(permission_query("Bash", None)),
            Step::Yield(success_result("done", 1, 0.0)),
        ]]);

        let cancel = CancellationToken::new();
        let mut spec = start_spec(&manager, cancel.clone());
        let config = SessionConfig {
            cwd: "/repo".into(),
            disallowed_tools: vec!["Bash".into()],
            ..Default::default()
        };
        spec.config = config.clone();
        spec.on_init = Some({
            let manager = manager.clone();
            Arc::new(move |init: &InitMessage| {
                manager.create_if_absent(&init.session_id, config.clone(), cancel.clone());
            })
        });

        let mut handle = consume_query(manager.clone(), launcher.clone(), spec);
        assert_eq!(handle.session_id().await.unwrap(), "sess-deny");
        handle.done.await.unwrap();

        let decisions = launcher.decisions.lock().unwrap();
        assert_eq!(
            decisions[0],
            PermissionDecision::deny("Tool 'Bash' is disallowed by session policy", false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_retries_with_resume() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![
            vec![
                Step::Yield(init_msg("sess-retry", &[])),
                Step::Fail(AgentStreamError::Stream("read ECONNRESET".into())),
            ],
            vec![Step::Yield(success_result("ok after retry", 1, 0.0))],
        ]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-retry");
        handle.done.await.unwrap();

        let invocations = launcher.invocations.lock().unwrap();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0], (None, false));
        assert_eq!(invocations[1], (Some("sess-retry".to_string()), false));

        assert_eq!(manager.status("sess-retry"), Some(SessionStatus::Idle));
        assert_eq!(manager.stored_result("sess-retry").unwrap().result, "ok after retry");

        let view = manager.poll_view("sess-retry", None).unwrap();
        let retry_event = view
            .events
            .iter()
            .find(|e| e.data.get("type") == Some(&json!("retry")))
            .expect("retry progress event");
        assert_eq!(retry_event.event_type, SessionEventType::Progress);
        assert_eq!(retry_event.data["attempt"], json!(1));
        assert_eq!(retry_event.data["maxRetries"], json!(3));
        assert_eq!(retry_event.data["delayMs"], json!(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_after_three_retries() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let fail_run = || {
            vec![
                Step::Yield(init_msg("sess-exhaust", &[])),
                Step::Fail(AgentStreamError::Stream("socket hang up".into())),
            ]
        };
        let launcher =
            ScriptedLauncher::with_runs(vec![fail_run(), fail_run(), fail_run(), fail_run()]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-exhaust");
        handle.done.await.unwrap();

        assert_eq!(launcher.invocations.lock().unwrap().len(), 4);
        assert_eq!(manager.status("sess-exhaust"), Some(SessionStatus::Error));
        let stored = manager.stored_result("sess-exhaust").unwrap();
        assert!(stored.is_error);
        assert_eq!(stored.result, "Error [INTERNAL]: socket hang up");
    }

    #[tokio::test]
    async fn stream_end_without_result_synthesizes_internal_error() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-noresult", &[])),
            Step::Yield(assistant_msg("working on it")),
        ]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-noresult");
        handle.done.await.unwrap();

        assert_eq!(manager.status("sess-noresult"), Some(SessionStatus::Error));
        let stored = manager.stored_result("sess-noresult").unwrap();
        assert!(stored.is_error);
        assert!(stored.result.contains("No result message received"));
        let view = manager.poll_view("sess-noresult", None).unwrap();
        assert!(view
            .events
            .iter()
            .any(|e| e.event_type == SessionEventType::Error));
    }

    #[tokio::test]
    async fn stream_end_before_init_rejects_session_id() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        let err = handle.session_id().await.unwrap_err();
        assert_eq!(
            err,
            CoreError::Internal("query stream ended before receiving session init".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn init_timeout_rejects_with_timeout() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![Step::Block]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        let err = handle.session_id().await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn cancel_mid_run_finalizes_as_cancelled() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-cancel", &[])),
            Step::Block,
        ]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-cancel");

        assert!(manager.cancel_session("sess-cancel", None, Some("api".into())));
        handle.done.await.unwrap();

        assert_eq!(manager.status("sess-cancel"), Some(SessionStatus::Cancelled));
        let stored = manager.stored_result("sess-cancel").unwrap();
        assert_eq!(stored.result, "Error [CANCELLED]: Session was cancelled.");
    }

    #[tokio::test]
    async fn fatal_error_after_init_records_internal_error() {
        let manager = SessionManager::new(RuntimeConfig::default());
        let launcher = ScriptedLauncher::with_runs(vec![vec![
            Step::Yield(init_msg("sess-fatal", &[])),
            Step::Fail(AgentStreamError::Stream("model exploded".into())),
        ]]);

        let cancel = CancellationToken::new();
        let mut handle = consume_query(
            manager.clone(),
            launcher.clone(),
            start_spec(&manager, cancel),
        );
        assert_eq!(handle.session_id().await.unwrap(), "sess-fatal");
        handle.done.await.unwrap();

        assert_eq!(manager.status("sess-fatal"), Some(SessionStatus::Error));
        assert_eq!(
            manager.stored_result("sess-fatal").unwrap().result,
            "Error [INTERNAL]: model exploded"
        );
    }

    #[test]
    fn classification_order_is_abort_then_transient_then_fatal() {
        let cancel = CancellationToken::new();
        assert_eq!(
            classify_stream_error(&AgentStreamError::Aborted, &cancel),
            ErrorClass::Abort
        );
        assert_eq!(
            classify_stream_error(&AgentStreamError::Stream("read ETIMEDOUT".into()), &cancel),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_stream_error(&AgentStreamError::Stream("boom".into()), &cancel),
            ErrorClass::Fatal
        );

        // A tripped cancel handle wins over everything else.
        cancel.cancel();
        assert_eq!(
            classify_stream_error(&AgentStreamError::Stream("read ETIMEDOUT".into()), &cancel),
            ErrorClass::Abort
        );
    }
}
