//! Read-side shaping: the `check` operation.
//!
//! `poll` renders a point-in-time view of one session; `respond_permission`
//! routes a decision through the broker and returns the refreshed view.
//! Neither blocks on the consumer.

use serde_json::Value;
use switchboard_core::CoreError;
use switchboard_core::SessionManager;
use switchboard_core::describe_tool;
use switchboard_core::discover_tools_from_init;
use switchboard_protocol::AgentResult;
use switchboard_protocol::FinishSource;
use switchboard_protocol::PermissionDecision;
use switchboard_protocol::SessionEvent;
use switchboard_protocol::SessionEventType;
use switchboard_protocol::SessionStatus;

use crate::wire::ActionView;
use crate::wire::CheckRequest;
use crate::wire::PermissionOptions;
use crate::wire::PollOptions;
use crate::wire::PollResponse;
use crate::wire::ResponseMode;

const MINIMAL_MAX_EVENTS: usize = 200;

pub fn poll(manager: &SessionManager, request: &CheckRequest) -> Result<PollResponse, CoreError> {
    let session_id = request.session_id.as_str();
    let view = manager
        .poll_view(session_id, request.cursor)
        .ok_or_else(|| CoreError::session_not_found(session_id))?;

    let mode = request.response_mode.unwrap_or_default();
    let options = request.poll_options.unwrap_or_default();
    let max_events = request.max_events.unwrap_or(match mode {
        ResponseMode::Minimal => MINIMAL_MAX_EVENTS,
        ResponseMode::Full => usize::MAX,
    });

    let mut events = view.events;
    let mut truncated = false;
    let mut next_cursor = view.next_cursor;
    if events.len() > max_events {
        events.truncate(max_events);
        truncated = true;
        if let Some(last) = events.last() {
            next_cursor = last.id + 1;
        }
    }

    let include_terminal_events = options
        .include_terminal_events
        .unwrap_or(mode == ResponseMode::Full);
    let include_result = options.include_result.unwrap_or(true);
    let include_progress_events = options.include_progress_events.unwrap_or(true);

    let status = view.status;
    let terminal_status = matches!(status, SessionStatus::Idle | SessionStatus::Error);

    // The top-level result already carries terminal data; dropping the
    // terminal events from the window avoids sending it twice.
    if !include_terminal_events && include_result && terminal_status {
        events.retain(|e| !e.event_type.is_terminal());
    }
    if !include_progress_events {
        events.retain(|e| {
            e.event_type != SessionEventType::Progress
                || !matches!(
                    e.data.get("type").and_then(Value::as_str),
                    Some("tool_progress") | Some("auth_status")
                )
        });
    }

    let events: Vec<Value> = events
        .into_iter()
        .map(|event| shape_event(event, mode, &options))
        .collect();

    let actions = (status == SessionStatus::WaitingPermission).then(|| {
        // Tools the agent announced at init get catalog descriptions where
        // we have them, with the raw name as the fallback.
        let discovered = discover_tools_from_init(&view.init_tools);
        view.actions
            .into_iter()
            .map(|request| {
                let tool_description = discovered
                    .iter()
                    .find(|tool| tool.name == request.tool_name)
                    .map(|tool| tool.description.clone())
                    .unwrap_or_else(|| describe_tool(&request.tool_name).to_string());
                ActionView {
                    request,
                    tool_description,
                }
            })
            .collect::<Vec<_>>()
    });

    let result = (terminal_status && include_result)
        .then_some(view.stored_result)
        .flatten()
        .map(|stored| redact_result(&stored, mode, &options));

    let poll_interval = match status {
        SessionStatus::WaitingPermission => Some(1000),
        SessionStatus::Running => Some(3000),
        _ => None,
    };

    Ok(PollResponse {
        session_id: session_id.to_string(),
        status,
        events,
        next_cursor,
        cursor_reset_to: view.cursor_reset_to,
        truncated: truncated.then_some(true),
        truncated_fields: truncated.then(|| vec!["events".to_string()]),
        actions,
        result,
        poll_interval,
    })
}

pub fn respond_permission(
    manager: &SessionManager,
    request: &CheckRequest,
) -> Result<PollResponse, CoreError> {
    let session_id = request.session_id.as_str();
    if session_id.is_empty() {
        return Err(CoreError::InvalidArgument(
            "sessionId must be a non-empty string".to_string(),
        ));
    }
    let request_id = request.request_id.as_deref().unwrap_or_default();
    if request_id.is_empty() {
        return Err(CoreError::InvalidArgument(
            "requestId must be a non-empty string".to_string(),
        ));
    }
    let decision = match request.decision.as_deref() {
        Some("allow") => {
            let options = request.permission_options.clone().unwrap_or_default();
            let PermissionOptions {
                updated_input,
                updated_permissions,
            } = options;
            PermissionDecision::Allow {
                updated_input,
                updated_permissions,
            }
        }
        Some("deny") => PermissionDecision::deny(
            request
                .deny_message
                .clone()
                .unwrap_or_else(|| "Permission denied by caller".to_string()),
            request.interrupt.unwrap_or(false),
        ),
        other => {
            return Err(CoreError::InvalidArgument(format!(
                "decision must be \"allow\" or \"deny\", got {other:?}"
            )));
        }
    };

    if !manager.contains(session_id) {
        return Err(CoreError::session_not_found(session_id));
    }
    if !manager.has_pending_request(session_id, request_id) {
        return Err(CoreError::PermissionRequestNotFound(format!(
            "No pending permission request '{request_id}'"
        )));
    }
    manager.finish_request(session_id, request_id, decision, FinishSource::Respond);

    poll(manager, request)
}

fn shape_event(event: SessionEvent, mode: ResponseMode, options: &PollOptions) -> Value {
    // SessionEvent always serializes to an object.
    #[allow(clippy::unwrap_used)]
    let mut value = serde_json::to_value(&event).unwrap();

    match event.event_type {
        SessionEventType::Output if mode == ResponseMode::Minimal => {
            if let Some(message) = value
                .get_mut("data")
                .and_then(|d| d.get_mut("message"))
            {
                *message = slim_assistant_message(message);
            }
        }
        SessionEventType::Result | SessionEventType::Error => {
            if let Ok(stored) = serde_json::from_value::<AgentResult>(event.data.clone()) {
                value["data"] = redact_result(&stored, mode, options);
            }
        }
        _ => {}
    }
    value
}

/// Minimal-mode view of an assistant message: keep `role`, `stop_reason`,
/// and `content` (with `cache_control` stripped from each block); drop the
/// bookkeeping fields.
fn slim_assistant_message(message: &Value) -> Value {
    let Some(map) = message.as_object() else {
        return message.clone();
    };
    let mut slim = serde_json::Map::new();
    for key in ["role", "stop_reason"] {
        if let Some(v) = map.get(key) {
            slim.insert(key.to_string(), v.clone());
        }
    }
    if let Some(content) = map.get("content") {
        let content = match content.as_array() {
            Some(blocks) => Value::Array(
                blocks
                    .iter()
                    .map(|block| {
                        let mut block = block.clone();
                        if let Some(obj) = block.as_object_mut() {
                            obj.remove("cache_control");
                        }
                        block
                    })
                    .collect(),
            ),
            None => content.clone(),
        };
        slim.insert("content".to_string(), content);
    }
    Value::Object(slim)
}

/// Per-mode redaction of an AgentResult. Minimal drops the verbose fields;
/// full keeps them, subject to the per-field overrides.
fn redact_result(result: &AgentResult, mode: ResponseMode, options: &PollOptions) -> Value {
    // AgentResult always serializes to an object.
    #[allow(clippy::unwrap_used)]
    let mut value = serde_json::to_value(result).unwrap();
    let Some(map) = value.as_object_mut() else {
        return value;
    };

    let full = mode == ResponseMode::Full;
    if !full {
        map.remove("durationApiMs");
        map.remove("sessionTotalTurns");
        map.remove("sessionTotalCostUsd");
    }
    if !options.include_usage.unwrap_or(full) {
        map.remove("usage");
    }
    if !options.include_model_usage.unwrap_or(full) {
        map.remove("modelUsage");
    }
    if !options.include_structured_output.unwrap_or(full) {
        map.remove("structuredOutput");
    }
    value
}
