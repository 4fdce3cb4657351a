//! Append-only per-session event ring with stable cursors.
//!
//! Ids are monotonic and never reused after eviction, so a caller that polls
//! with a stale cursor can detect the gap via `cursor_reset_to` and accept
//! it instead of silently replaying from the wrong offset.

use chrono::Utc;
use serde_json::Value;
use switchboard_protocol::SessionEvent;
use switchboard_protocol::SessionEventType;

pub(crate) const DEFAULT_MAX_SIZE: usize = 1000;
pub(crate) const DEFAULT_HARD_MAX_SIZE: usize = 2000;

#[derive(Debug)]
pub struct EventBuffer {
    events: Vec<SessionEvent>,
    next_id: u64,
    max_size: usize,
    hard_max_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    pub events: Vec<SessionEvent>,
    pub next_cursor: u64,
    pub cursor_reset_to: Option<u64>,
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_HARD_MAX_SIZE)
    }
}

impl EventBuffer {
    pub fn new(max_size: usize, hard_max_size: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 1,
            max_size,
            hard_max_size,
        }
    }

    /// Append an event, assigning the next id. Permission and terminal
    /// events are pinned unless the caller overrides.
    ///
    /// `is_request_active` reports whether a permission request id still has
    /// a pending entry; finished requests become safely droppable.
    pub fn push(
        &mut self,
        event_type: SessionEventType,
        data: Value,
        pinned: Option<bool>,
        is_request_active: &dyn Fn(&str) -> bool,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.events.push(SessionEvent {
            id,
            event_type,
            data,
            timestamp: Utc::now(),
            pinned: pinned.unwrap_or_else(|| event_type.is_pinned_by_default()),
        });
        self.enforce_caps(is_request_active);
        id
    }

    /// Events with `id >= cursor` (all, if the cursor is omitted).
    pub fn read(&self, cursor: Option<u64>) -> ReadResult {
        let start = cursor.unwrap_or(0);
        let events: Vec<SessionEvent> = self
            .events
            .iter()
            .filter(|e| e.id >= start)
            .cloned()
            .collect();

        let cursor_reset_to = match (cursor, self.events.first()) {
            (Some(c), Some(first)) if c < first.id => Some(first.id),
            _ => None,
        };

        let next_cursor = events
            .last()
            .map(|e| e.id + 1)
            .unwrap_or_else(|| cursor.unwrap_or(self.next_id));

        ReadResult {
            events,
            next_cursor,
            cursor_reset_to,
        }
    }

    /// Drop all `result`/`error` events; called at run boundaries so a
    /// re-reply starts with a clean terminal view.
    pub fn clear_terminal(&mut self) {
        self.events.retain(|e| !e.event_type.is_terminal());
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Terminal events currently retained (at most one outside of the push
    /// window between `clear_terminal` and the next terminal push).
    pub fn terminal_events(&self) -> Vec<&SessionEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type.is_terminal())
            .collect()
    }

    fn enforce_caps(&mut self, is_request_active: &dyn Fn(&str) -> bool) {
        // Soft cap: prefer unpinned evictions, then pinned events that no
        // longer protect anything (permission results, finished requests).
        while self.events.len() > self.max_size {
            if let Some(idx) = self.events.iter().position(|e| !e.pinned) {
                self.events.remove(idx);
                continue;
            }
            if let Some(idx) = self
                .events
                .iter()
                .position(|e| Self::is_safely_droppable(e, is_request_active))
            {
                self.events.remove(idx);
                continue;
            }
            break;
        }

        // Hard cap: permission bookkeeping only. Terminal events are never
        // evicted here; they are bounded by `clear_terminal` at run
        // boundaries.
        while self.events.len() > self.hard_max_size {
            if let Some(idx) = self
                .events
                .iter()
                .position(|e| Self::is_safely_droppable(e, is_request_active))
            {
                self.events.remove(idx);
                continue;
            }
            break;
        }
    }

    /// Permission bookkeeping that no longer protects anything: any
    /// `permission_result`, or a `permission_request` whose id has been
    /// finished.
    fn is_safely_droppable(event: &SessionEvent, is_request_active: &dyn Fn(&str) -> bool) -> bool {
        match event.event_type {
            SessionEventType::PermissionResult => true,
            SessionEventType::PermissionRequest => event
                .request_id()
                .is_none_or(|id| !is_request_active(id)),
            _ => false,
        }
    }
}
