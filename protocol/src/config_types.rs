//! Session configuration snapshot and its small enums.
//!
//! A [`SessionConfig`] is captured once when a session is created and reused
//! for every subsequent reply on that session; it mirrors the option set the
//! external agent process accepts.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingSource {
    User,
    Project,
    Local,
}

impl SettingSource {
    /// Default when the caller omits `settingSources`.
    pub fn all() -> Vec<SettingSource> {
        vec![
            SettingSource::User,
            SettingSource::Project,
            SettingSource::Local,
        ]
    }
}

/// Extended-thinking configuration forwarded to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingSpec {
    Adaptive,
    Enabled { budget_tokens: u64 },
    Disabled,
}

/// System prompt: either a literal string or a named preset with an optional
/// appended suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPromptSpec {
    Text(String),
    Preset {
        preset: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        append: Option<String>,
    },
}

/// Tool surface: an explicit list or a preset marker string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolsSpec {
    List(Vec<String>),
    Preset(String),
}

/// Definition of a named subagent the session may delegate to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub description: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

/// The full per-session configuration snapshot.
///
/// Serialization of this struct is the *unredacted* shape; the session
/// manager removes sensitive keys when projecting public or sensitive views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<SystemPromptSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agents: Option<BTreeMap<String, AgentDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<Effort>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub betas: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_directories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_to_executable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_file_checkpointing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_partial_messages: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_mcp_config: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setting_sources: Option<Vec<SettingSource>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_request_timeout_ms: Option<u64>,
}

impl SessionConfig {
    pub fn is_tool_disallowed(&self, tool_name: &str) -> bool {
        self.disallowed_tools.iter().any(|t| t == tool_name)
    }

    pub fn is_tool_allowed(&self, tool_name: &str) -> bool {
        self.allowed_tools.iter().any(|t| t == tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn minimal_config_serializes_compactly() {
        let config = SessionConfig {
            cwd: "/repo".into(),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&config).unwrap(), json!({"cwd": "/repo"}));
    }

    #[test]
    fn system_prompt_accepts_string_or_preset() {
        let text: SystemPromptSpec = serde_json::from_value(json!("be terse")).unwrap();
        assert_eq!(text, SystemPromptSpec::Text("be terse".into()));

        let preset: SystemPromptSpec =
            serde_json::from_value(json!({"preset": "claude_code", "append": "and polite"}))
                .unwrap();
        assert_eq!(
            preset,
            SystemPromptSpec::Preset {
                preset: "claude_code".into(),
                append: Some("and polite".into()),
            }
        );
    }

    #[test]
    fn tools_accepts_list_or_preset_marker() {
        let list: ToolsSpec = serde_json::from_value(json!(["Read", "Bash"])).unwrap();
        assert_eq!(list, ToolsSpec::List(vec!["Read".into(), "Bash".into()]));

        let preset: ToolsSpec = serde_json::from_value(json!("default")).unwrap();
        assert_eq!(preset, ToolsSpec::Preset("default".into()));
    }

    #[test]
    fn thinking_spec_is_type_tagged() {
        let enabled = serde_json::to_value(ThinkingSpec::Enabled { budget_tokens: 4096 }).unwrap();
        assert_eq!(enabled, json!({"type": "enabled", "budget_tokens": 4096}));
    }

    #[test]
    fn tool_policy_helpers() {
        let config = SessionConfig {
            cwd: "/repo".into(),
            allowed_tools: vec!["Read".into()],
            disallowed_tools: vec!["Bash".into()],
            ..Default::default()
        };
        assert!(config.is_tool_allowed("Read"));
        assert!(config.is_tool_disallowed("Bash"));
        assert!(!config.is_tool_allowed("Write"));
    }
}
