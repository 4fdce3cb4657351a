//! Dispatches decoded requests to the session runtime.
//!
//! `start` and `reply` block on the init gate, so every request runs in its
//! own task; polls against shared state stay responsive while a start is in
//! flight.

use std::sync::Arc;

use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::error;

use crate::poll;
use crate::session_ops::ServerState;
use crate::wire::CheckAction;
use crate::wire::CheckError;
use crate::wire::Request;
use crate::wire::RequestOp;
use crate::wire::Response;
use crate::wire::SessionResponse;
use crate::wire::StartResponse;

pub(crate) struct MessageProcessor {
    state: Arc<ServerState>,
    outgoing: mpsc::Sender<Response>,
}

impl MessageProcessor {
    pub fn new(state: Arc<ServerState>, outgoing: mpsc::Sender<Response>) -> Self {
        Self { state, outgoing }
    }

    pub fn process_request(&self, request: Request) {
        let state = self.state.clone();
        let outgoing = self.outgoing.clone();
        let Request { id, op } = request;
        tokio::spawn(async move {
            let result = dispatch_op(&state, op).await;
            if outgoing.send(Response { id, result }).await.is_err() {
                error!("response channel closed before request completed");
            }
        });
    }
}

/// Run one operation and fold errors into the per-op error shape.
pub async fn dispatch_op(state: &ServerState, op: RequestOp) -> Value {
    match op {
        RequestOp::Start(request) => match state.start(request, None).await {
            Ok(response) => to_value(response),
            Err(err) => to_value(StartResponse::failed(err.to_string())),
        },
        RequestOp::Reply(request) => match state.reply(request).await {
            Ok(response) => to_value(response),
            Err(err) => to_value(StartResponse::failed(err.to_string())),
        },
        RequestOp::Session(request) => match state.session(request) {
            Ok(response) => to_value(response),
            Err(err) => to_value(SessionResponse {
                sessions: Vec::new(),
                message: Some(err.to_string()),
                is_error: Some(true),
            }),
        },
        RequestOp::Check(request) => {
            let result = match request.action {
                CheckAction::Poll => poll::poll(state.manager(), &request),
                CheckAction::RespondPermission => {
                    poll::respond_permission(state.manager(), &request)
                }
            };
            match result {
                Ok(response) => to_value(response),
                Err(err) => to_value(CheckError {
                    session_id: request.session_id,
                    error: err.to_string(),
                    is_error: true,
                }),
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        error!("failed to serialize response: {err}");
        json!({})
    })
}
