//! Pending tool-use permission requests for one session.
//!
//! Each entry pairs the caller-visible request record with the one-shot
//! waiter the blocked consumer is suspended on and the timeout timer that
//! denies the request if nobody answers. The session manager wires event
//! pushes and status transitions around this map.

use std::collections::HashMap;

use switchboard_protocol::PermissionDecision;
use switchboard_protocol::PermissionRequest;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

pub(crate) struct PendingPermission {
    pub record: PermissionRequest,
    pub waiter: oneshot::Sender<PermissionDecision>,
    pub timer: Option<AbortHandle>,
}

#[derive(Default)]
pub(crate) struct PendingPermissions {
    entries: HashMap<String, PendingPermission>,
}

impl PendingPermissions {
    /// Insert a pending request; rejects duplicates by request id.
    pub fn insert(&mut self, entry: PendingPermission) -> bool {
        let request_id = entry.record.request_id.clone();
        if self.entries.contains_key(&request_id) {
            return false;
        }
        self.entries.insert(request_id, entry);
        true
    }

    pub fn remove(&mut self, request_id: &str) -> Option<PendingPermission> {
        self.entries.remove(request_id)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn request_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Pending records sorted by creation time, oldest first.
    pub fn records_by_age(&self) -> Vec<PermissionRequest> {
        let mut records: Vec<PermissionRequest> =
            self.entries.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

/// An `allow` for a tool the session policy disallows is downgraded to a
/// deny before it ever reaches the waiting consumer.
pub(crate) fn apply_policy_downgrade(
    decision: PermissionDecision,
    tool_name: &str,
    disallowed_tools: &[String],
) -> PermissionDecision {
    if decision.is_allow() && disallowed_tools.iter().any(|t| t == tool_name) {
        PermissionDecision::deny(
            format!("Tool '{tool_name}' is disallowed by session policy"),
            false,
        )
    } else {
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(request_id: &str, created_at_secs: i64) -> PermissionRequest {
        PermissionRequest {
            request_id: request_id.into(),
            tool_name: "Bash".into(),
            input: json!({}),
            summary: "Bash".into(),
            description: None,
            decision_reason: None,
            blocked_path: None,
            tool_use_id: "tu1".into(),
            agent_id: None,
            suggestions: None,
            created_at: DateTime::<Utc>::from_timestamp(created_at_secs, 0).unwrap(),
        }
    }

    fn entry(request_id: &str, created_at_secs: i64) -> (PendingPermission, oneshot::Receiver<PermissionDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingPermission {
                record: record(request_id, created_at_secs),
                waiter: tx,
                timer: None,
            },
            rx,
        )
    }

    #[test]
    fn insert_rejects_duplicate_request_ids() {
        let mut pending = PendingPermissions::default();
        let (a, _rx_a) = entry("r-1", 1);
        let (b, _rx_b) = entry("r-1", 2);
        assert!(pending.insert(a));
        assert!(!pending.insert(b));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn records_sort_oldest_first() {
        let mut pending = PendingPermissions::default();
        let (newer, _rx_a) = entry("r-2", 20);
        let (older, _rx_b) = entry("r-1", 10);
        pending.insert(newer);
        pending.insert(older);
        let records = pending.records_by_age();
        assert_eq!(
            records.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
            vec!["r-1", "r-2"]
        );
    }

    #[test]
    fn allow_is_downgraded_for_disallowed_tool() {
        let downgraded = apply_policy_downgrade(
            PermissionDecision::allow(),
            "Bash",
            &["Bash".to_string()],
        );
        assert_eq!(
            downgraded,
            PermissionDecision::deny("Tool 'Bash' is disallowed by session policy", false)
        );
    }

    #[test]
    fn allow_passes_through_for_permitted_tool() {
        let decision = apply_policy_downgrade(PermissionDecision::allow(), "Read", &["Bash".to_string()]);
        assert!(decision.is_allow());
    }

    #[test]
    fn deny_is_never_rewritten() {
        let deny = PermissionDecision::deny("no", true);
        let decision = apply_policy_downgrade(deny.clone(), "Bash", &["Bash".to_string()]);
        assert_eq!(decision, deny);
    }
}
