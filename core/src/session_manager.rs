// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Owner of all session state.
//!
//! The manager is the sole writer of session status and counters. Every
//! mutation happens under the per-session lock, which is never held across
//! an await point; the consumer, the poll surface, the permission timers,
//! and the background sweeper all serialize through it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use serde_json::json;
use switchboard_protocol::AgentResult;
use switchboard_protocol::FinishSource;
use switchboard_protocol::PermissionDecision;
use switchboard_protocol::PermissionRequest;
use switchboard_protocol::SessionConfig;
use switchboard_protocol::SessionEvent;
use switchboard_protocol::SessionEventType;
use switchboard_protocol::SessionStatus;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::RuntimeConfig;
use crate::event_buffer::EventBuffer;
use crate::permissions::PendingPermission;
use crate::permissions::PendingPermissions;
use crate::permissions::apply_policy_downgrade;
use crate::session::SessionRecord;

/// Runtime state of one session; guarded by the slot mutex.
struct SessionState {
    record: SessionRecord,
    buffer: EventBuffer,
    pending: PendingPermissions,
    stored_result: Option<AgentResult>,
    cancel: Option<CancellationToken>,
    init_tools: Vec<String>,
    last_tool_use_id: Option<String>,
}

impl SessionState {
    fn new(record: SessionRecord) -> Self {
        Self {
            record,
            buffer: EventBuffer::default(),
            pending: PendingPermissions::default(),
            stored_result: None,
            cancel: None,
            init_tools: Vec::new(),
            last_tool_use_id: None,
        }
    }

    fn push_event(&mut self, event_type: SessionEventType, data: Value, pinned: Option<bool>) -> u64 {
        let SessionState {
            buffer, pending, ..
        } = self;
        buffer.push(event_type, data, pinned, &|id| pending.contains(id))
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.record.last_active_at = now;
    }

    /// Finish one pending request: policy downgrade, result event, waiter
    /// completion, and the waiting→running transition when the map drains.
    fn finish_request(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        source: FinishSource,
    ) -> bool {
        let Some(mut entry) = self.pending.remove(request_id) else {
            return false;
        };
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }
        let decision = apply_policy_downgrade(
            decision,
            &entry.record.tool_name,
            &self.record.config.disallowed_tools,
        );
        self.push_event(
            SessionEventType::PermissionResult,
            json!({
                "requestId": request_id,
                "behavior": decision.behavior(),
                "source": source.to_string(),
            }),
            None,
        );
        // The result event is visible before the blocked consumer resumes.
        let _ = entry.waiter.send(decision);
        if self.pending.is_empty() && self.record.status == SessionStatus::WaitingPermission {
            self.record.status = SessionStatus::Running;
        }
        self.touch(Utc::now());
        true
    }

    fn finish_all(&mut self, decision: &PermissionDecision, source: FinishSource) -> usize {
        let ids = self.pending.request_ids();
        let mut finished = 0;
        for id in ids {
            if self.finish_request(&id, decision.clone(), source) {
                finished += 1;
            }
        }
        finished
    }

    fn fire_cancel(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }
}

struct SessionSlot {
    state: Mutex<SessionState>,
}

struct Inner {
    config: RuntimeConfig,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

/// Point-in-time view used by the poll surface; taken under one lock so the
/// events page, pending actions, and stored result are mutually consistent.
#[derive(Debug, Clone)]
pub struct PollView {
    pub status: SessionStatus,
    pub events: Vec<SessionEvent>,
    pub next_cursor: u64,
    pub cursor_reset_to: Option<u64>,
    pub actions: Vec<PermissionRequest>,
    pub stored_result: Option<AgentResult>,
    /// Tool names announced by the last init message.
    pub init_tools: Vec<String>,
}

/// Tool allow/deny lists consulted by the permission fast paths.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.inner.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Create a session if no record exists yet. Used by the start path's
    /// init callback (idempotent across retries) and by disk-resume.
    pub fn create_if_absent(
        &self,
        session_id: &str,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> bool {
        let mut sessions = self.inner.sessions.lock().unwrap();
        if sessions.contains_key(session_id) {
            return false;
        }
        let mut state = SessionState::new(SessionRecord::new(
            session_id.to_string(),
            config,
            Utc::now(),
        ));
        state.cancel = Some(cancel);
        sessions.insert(
            session_id.to_string(),
            Arc::new(SessionSlot {
                state: Mutex::new(state),
            }),
        );
        info!(session_id, "session created");
        true
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.lock().unwrap().contains_key(session_id)
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        Some(state.record.status)
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// Atomic compare-and-set acquire for a new reply run. Only `idle` and
    /// `error` are acquirable; the terminal view is cleared so the new run
    /// starts clean. Returns the prior status on success.
    pub fn try_acquire(
        &self,
        session_id: &str,
        expected: SessionStatus,
        cancel: CancellationToken,
    ) -> Option<SessionStatus> {
        if !expected.is_acquirable() {
            return None;
        }
        let slot = self.slot(session_id)?;
        let mut state = slot.state.lock().unwrap();
        if state.record.status != expected {
            return None;
        }
        state.record.status = SessionStatus::Running;
        state.cancel = Some(cancel);
        state.buffer.clear_terminal();
        state.touch(Utc::now());
        debug!(session_id, from = %expected, "session acquired");
        Some(expected)
    }

    /// Cancel a running or waiting session. Pending permissions are denied
    /// with `interrupt: true` before the run's cancel handle fires.
    pub fn cancel_session(
        &self,
        session_id: &str,
        reason: Option<String>,
        source: Option<String>,
    ) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let mut state = slot.state.lock().unwrap();
        if !matches!(
            state.record.status,
            SessionStatus::Running | SessionStatus::WaitingPermission
        ) {
            return false;
        }
        if state.record.status == SessionStatus::WaitingPermission {
            state.finish_all(
                &PermissionDecision::deny("Session cancelled", true),
                FinishSource::Cancel,
            );
        }
        state.fire_cancel();
        state.record.status = SessionStatus::Cancelled;
        state.record.cancelled_at = Some(Utc::now());
        state.record.cancelled_reason = reason;
        state.record.cancelled_source = source;
        state.touch(Utc::now());
        info!(session_id, "session cancelled");
        true
    }

    /// Put a session back into a prior status after a failed fork attempt.
    pub fn restore_status(&self, session_id: &str, status: SessionStatus) {
        if let Some(slot) = self.slot(session_id) {
            let mut state = slot.state.lock().unwrap();
            state.record.status = status;
            state.cancel = None;
            state.touch(Utc::now());
        }
    }

    pub fn push_event(
        &self,
        session_id: &str,
        event_type: SessionEventType,
        data: Value,
        pinned: Option<bool>,
    ) -> Option<u64> {
        let slot = self.slot(session_id)?;
        let mut state = slot.state.lock().unwrap();
        let id = state.push_event(event_type, data, pinned);
        state.touch(Utc::now());
        Some(id)
    }

    pub fn note_tool_use(&self, session_id: &str, tool_use_id: &str) {
        if let Some(slot) = self.slot(session_id) {
            let mut state = slot.state.lock().unwrap();
            state.last_tool_use_id = Some(tool_use_id.to_string());
        }
    }

    pub fn set_init_tools(&self, session_id: &str, tools: Vec<String>) {
        if let Some(slot) = self.slot(session_id) {
            let mut state = slot.state.lock().unwrap();
            state.init_tools = tools;
        }
    }

    pub fn init_tools(&self, session_id: &str) -> Option<Vec<String>> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        Some(state.init_tools.clone())
    }

    pub fn last_tool_use_id(&self, session_id: &str) -> Option<String> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        state.last_tool_use_id.clone()
    }

    /// The config snapshot captured at creation; replies reuse it verbatim.
    pub fn session_config(&self, session_id: &str) -> Option<SessionConfig> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        Some(state.record.config.clone())
    }

    pub fn tool_policy(&self, session_id: &str) -> Option<ToolPolicy> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        Some(ToolPolicy {
            allowed_tools: state.record.config.allowed_tools.clone(),
            disallowed_tools: state.record.config.disallowed_tools.clone(),
        })
    }

    /// Register a pending permission request: arms the timeout timer, moves
    /// the session to `waiting_permission`, and pushes the request event.
    /// Rejects when the session is missing/terminal or the request id is
    /// already pending.
    pub fn set_pending(
        &self,
        session_id: &str,
        record: PermissionRequest,
        waiter: oneshot::Sender<PermissionDecision>,
        timeout: Duration,
    ) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let mut state = slot.state.lock().unwrap();
        if matches!(
            state.record.status,
            SessionStatus::Cancelled | SessionStatus::Error
        ) {
            return false;
        }
        let request_id = record.request_id.clone();
        if state.pending.contains(&request_id) {
            return false;
        }
        let data = serde_json::to_value(&record).unwrap_or_else(|_| json!({}));

        let timer = {
            let manager = self.clone();
            let session_id = session_id.to_string();
            let request_id = request_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let timed_out = manager.finish_request(
                    &session_id,
                    &request_id,
                    PermissionDecision::deny(
                        format!("timed out after {}ms", timeout.as_millis()),
                        false,
                    ),
                    FinishSource::Timeout,
                );
                if timed_out {
                    warn!(%session_id, %request_id, "permission request timed out");
                }
            })
            .abort_handle()
        };

        state.pending.insert(PendingPermission {
            record,
            waiter,
            timer: Some(timer),
        });
        state.record.status = SessionStatus::WaitingPermission;
        state.push_event(SessionEventType::PermissionRequest, data, None);
        state.touch(Utc::now());
        true
    }

    pub fn finish_request(
        &self,
        session_id: &str,
        request_id: &str,
        decision: PermissionDecision,
        source: FinishSource,
    ) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let mut state = slot.state.lock().unwrap();
        state.finish_request(request_id, decision, source)
    }

    pub fn finish_all(
        &self,
        session_id: &str,
        decision: PermissionDecision,
        source: FinishSource,
    ) -> usize {
        let Some(slot) = self.slot(session_id) else {
            return 0;
        };
        let mut state = slot.state.lock().unwrap();
        state.finish_all(&decision, source)
    }

    pub fn has_pending_request(&self, session_id: &str, request_id: &str) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };
        let state = slot.state.lock().unwrap();
        state.pending.contains(request_id)
    }

    pub fn pending_count(&self, session_id: &str) -> usize {
        self.slot(session_id)
            .map(|slot| slot.state.lock().unwrap().pending.len())
            .unwrap_or(0)
    }

    /// Terminal bookkeeping for a run that produced a `result` message.
    ///
    /// Fork runs replace the counters; plain replies accumulate. When the
    /// session was cancelled mid-run the status is left alone but totals are
    /// still updated and the cancel handle cleared.
    pub fn record_terminal(
        &self,
        session_id: &str,
        mut result: AgentResult,
        fork: bool,
    ) -> Option<AgentResult> {
        let slot = self.slot(session_id)?;
        let mut state = slot.state.lock().unwrap();
        let (total_turns, total_cost) = if fork {
            (result.num_turns, result.total_cost_usd)
        } else {
            (
                state.record.total_turns + result.num_turns,
                state.record.total_cost_usd + result.total_cost_usd,
            )
        };
        state.record.total_turns = total_turns;
        state.record.total_cost_usd = total_cost;
        result.session_total_turns = Some(total_turns);
        result.session_total_cost_usd = Some(total_cost);

        state.stored_result = Some(result.clone());
        state.buffer.clear_terminal();
        let event_type = if result.is_error {
            SessionEventType::Error
        } else {
            SessionEventType::Result
        };
        let data = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
        state.push_event(event_type, data, None);

        if state.record.status != SessionStatus::Cancelled {
            state.record.status = if result.is_error {
                SessionStatus::Error
            } else {
                SessionStatus::Idle
            };
        }
        state.cancel = None;
        state.touch(Utc::now());
        Some(result)
    }

    /// Terminal bookkeeping for a run that failed without a `result` message
    /// (abort, fatal error, or end-of-stream). Counters are untouched.
    pub fn record_failure(&self, session_id: &str, result: AgentResult) -> Option<AgentResult> {
        let slot = self.slot(session_id)?;
        let mut state = slot.state.lock().unwrap();
        state.stored_result = Some(result.clone());
        state.buffer.clear_terminal();
        let data = serde_json::to_value(&result).unwrap_or_else(|_| json!({}));
        state.push_event(SessionEventType::Error, data, None);
        if state.record.status != SessionStatus::Cancelled {
            state.record.status = SessionStatus::Error;
        }
        state.cancel = None;
        state.touch(Utc::now());
        Some(result)
    }

    pub fn stored_result(&self, session_id: &str) -> Option<AgentResult> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        state.stored_result.clone()
    }

    pub fn poll_view(&self, session_id: &str, cursor: Option<u64>) -> Option<PollView> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        let read = state.buffer.read(cursor);
        let actions = if state.record.status == SessionStatus::WaitingPermission {
            state.pending.records_by_age()
        } else {
            Vec::new()
        };
        Some(PollView {
            status: state.record.status,
            events: read.events,
            next_cursor: read.next_cursor,
            cursor_reset_to: read.cursor_reset_to,
            actions,
            stored_result: state.stored_result.clone(),
            init_tools: state.init_tools.clone(),
        })
    }

    pub fn session_json(&self, session_id: &str, sensitive: bool) -> Option<Value> {
        let slot = self.slot(session_id)?;
        let state = slot.state.lock().unwrap();
        Some(if sensitive {
            state.record.to_sensitive_json()
        } else {
            state.record.to_public_json()
        })
    }

    pub fn sessions_json(&self, sensitive: bool) -> Vec<Value> {
        let slots: Vec<Arc<SessionSlot>> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions.values().cloned().collect()
        };
        let mut out: Vec<Value> = slots
            .iter()
            .map(|slot| {
                let state = slot.state.lock().unwrap();
                if sensitive {
                    state.record.to_sensitive_json()
                } else {
                    state.record.to_public_json()
                }
            })
            .collect();
        out.sort_by(|a, b| {
            let a_id = a.get("sessionId").and_then(Value::as_str).unwrap_or("");
            let b_id = b.get("sessionId").and_then(Value::as_str).unwrap_or("");
            a_id.cmp(b_id)
        });
        out
    }

    /// One pass of the background sweeper.
    pub fn sweep_once(&self, now: DateTime<Utc>) {
        let slots: Vec<(String, Arc<SessionSlot>)> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect()
        };

        let ttl = chrono_duration(self.inner.config.session_ttl);
        let running_max = chrono_duration(self.inner.config.running_session_max);
        let skew_tolerance = chrono_duration(self.inner.config.sweep_interval);

        let mut to_delete: Vec<String> = Vec::new();
        for (session_id, slot) in slots {
            let mut state = slot.state.lock().unwrap();
            let last_active = state.record.last_active_at;
            if last_active > now + skew_tolerance {
                warn!(%session_id, "deleting session with invalid lastActiveAt");
                to_delete.push(session_id);
                continue;
            }
            let age = now.signed_duration_since(last_active);
            match state.record.status {
                SessionStatus::Running if age > running_max => {
                    warn!(%session_id, "running session exceeded max runtime");
                    state.fire_cancel();
                    state.record.status = SessionStatus::Error;
                    state.cancel = None;
                }
                SessionStatus::WaitingPermission if age > running_max => {
                    warn!(%session_id, "waiting session exceeded max runtime");
                    state.finish_all(
                        &PermissionDecision::deny("Session timed out", false),
                        FinishSource::Cleanup,
                    );
                    state.fire_cancel();
                    state.record.status = SessionStatus::Error;
                    state.cancel = None;
                }
                SessionStatus::Idle | SessionStatus::Cancelled | SessionStatus::Error
                    if age > ttl =>
                {
                    debug!(%session_id, "expiring idle session");
                    state.finish_all(
                        &PermissionDecision::deny("Session expired", false),
                        FinishSource::Cleanup,
                    );
                    to_delete.push(session_id);
                }
                _ => {}
            }
        }

        if !to_delete.is_empty() {
            let mut sessions = self.inner.sessions.lock().unwrap();
            for session_id in to_delete {
                sessions.remove(&session_id);
            }
        }
    }

    /// Spawn the periodic sweeper. The task holds only a weak reference so
    /// it winds down when the manager is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh server
            // does not sweep before anything can exist.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionManager { inner }.sweep_once(Utc::now());
            }
        })
    }

    /// Server teardown: cancel in-flight sessions and deny their pending
    /// permissions. Records are kept for in-flight readers.
    pub fn shutdown(&self) {
        let slots: Vec<(String, Arc<SessionSlot>)> = {
            let sessions = self.inner.sessions.lock().unwrap();
            sessions
                .iter()
                .map(|(id, slot)| (id.clone(), slot.clone()))
                .collect()
        };
        for (session_id, slot) in slots {
            let mut state = slot.state.lock().unwrap();
            if matches!(
                state.record.status,
                SessionStatus::Running | SessionStatus::WaitingPermission
            ) {
                state.finish_all(
                    &PermissionDecision::deny("Server shutting down", true),
                    FinishSource::Destroy,
                );
                state.fire_cancel();
                state.record.status = SessionStatus::Cancelled;
                state.record.cancelled_at = Some(Utc::now());
                state.record.cancelled_reason = Some("Server shutting down".to_string());
                state.record.cancelled_source = Some("shutdown".to_string());
                info!(%session_id, "session cancelled at shutdown");
            }
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
