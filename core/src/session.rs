//! Session records and their serialized projections.

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use switchboard_protocol::SessionConfig;
use switchboard_protocol::SessionStatus;

/// Durable (in-memory) part of a session: the status machine, counters, and
/// the configuration snapshot captured at creation. Runtime-only state (the
/// cancel handle, event buffer, pending permissions, stored result) lives in
/// the session manager and is never serialized.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_source: Option<String>,
    pub total_turns: u32,
    pub total_cost_usd: f64,
    #[serde(flatten)]
    pub config: SessionConfig,
}

/// Keys redacted from the public projection.
const PUBLIC_REDACTED: &[&str] = &[
    "cwd",
    "systemPrompt",
    "agents",
    "additionalDirectories",
    "pathToExecutable",
    "mcpServers",
    "sandbox",
    "settingSources",
    "debugFile",
    "env",
];

/// Keys the sensitive projection adds back. Everything else stays redacted
/// even with sensitive access.
const SENSITIVE_KEPT: &[&str] = &["cwd", "systemPrompt", "agents", "additionalDirectories"];

impl SessionRecord {
    pub fn new(session_id: String, config: SessionConfig, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            status: SessionStatus::Running,
            created_at: now,
            last_active_at: now,
            cancelled_at: None,
            cancelled_reason: None,
            cancelled_source: None,
            total_turns: 0,
            total_cost_usd: 0.0,
            config,
        }
    }

    fn to_full_json(&self) -> Value {
        // SessionRecord always serializes to an object.
        #[allow(clippy::unwrap_used)]
        serde_json::to_value(self).unwrap()
    }

    pub fn to_public_json(&self) -> Value {
        let mut value = self.to_full_json();
        if let Some(map) = value.as_object_mut() {
            for key in PUBLIC_REDACTED {
                map.remove(*key);
            }
        }
        value
    }

    pub fn to_sensitive_json(&self) -> Value {
        let mut value = self.to_full_json();
        if let Some(map) = value.as_object_mut() {
            for key in PUBLIC_REDACTED {
                if !SENSITIVE_KEPT.contains(key) {
                    map.remove(*key);
                }
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn record_with_secrets() -> SessionRecord {
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "hunter2".to_string());
        let config = SessionConfig {
            cwd: "/home/user/project".into(),
            model: Some("sonnet".into()),
            system_prompt: Some(switchboard_protocol::SystemPromptSpec::Text("be careful".into())),
            additional_directories: vec!["/tmp/scratch".into()],
            path_to_executable: Some("/usr/local/bin/agent".into()),
            mcp_servers: Some(json!({"db": {"command": "db-mcp"}})),
            sandbox: Some(json!({"enabled": true})),
            debug_file: Some("/var/log/agent.log".into()),
            env: Some(env),
            ..Default::default()
        };
        SessionRecord::new("sess-1".into(), config, Utc::now())
    }

    #[test]
    fn public_projection_redacts_sensitive_config() {
        let value = record_with_secrets().to_public_json();
        let map = value.as_object().unwrap();
        for key in super::PUBLIC_REDACTED {
            assert!(!map.contains_key(*key), "{key} must be redacted");
        }
        assert_eq!(map["sessionId"], json!("sess-1"));
        assert_eq!(map["status"], json!("running"));
        assert_eq!(map["model"], json!("sonnet"));
        assert_eq!(map["totalTurns"], json!(0));
    }

    #[test]
    fn sensitive_projection_adds_back_only_the_four_fields() {
        let value = record_with_secrets().to_sensitive_json();
        let map = value.as_object().unwrap();
        assert_eq!(map["cwd"], json!("/home/user/project"));
        assert_eq!(map["systemPrompt"], json!("be careful"));
        assert_eq!(map["additionalDirectories"], json!(["/tmp/scratch"]));
        // Secrets stay redacted even with sensitive access.
        for key in ["env", "mcpServers", "sandbox", "debugFile", "pathToExecutable"] {
            assert!(!map.contains_key(key), "{key} must stay redacted");
        }
    }
}
