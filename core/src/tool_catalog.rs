//! Descriptive catalog of well-known agent tools.
//!
//! Purely informational: the descriptions decorate pending permission
//! actions in poll responses. Authorization decisions never consult this
//! table.

use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTool {
    pub name: String,
    pub description: String,
    pub category: Option<&'static str>,
}

static CATALOG: LazyLock<HashMap<&'static str, ToolInfo>> = LazyLock::new(|| {
    const TOOLS: &[ToolInfo] = &[
        ToolInfo {
            name: "Bash",
            description: "Run a shell command in the session's working directory",
            category: "execution",
        },
        ToolInfo {
            name: "Read",
            description: "Read a file from the local filesystem",
            category: "filesystem",
        },
        ToolInfo {
            name: "Write",
            description: "Create or overwrite a file",
            category: "filesystem",
        },
        ToolInfo {
            name: "Edit",
            description: "Apply a string replacement to a file",
            category: "filesystem",
        },
        ToolInfo {
            name: "Glob",
            description: "Match files by glob pattern",
            category: "search",
        },
        ToolInfo {
            name: "Grep",
            description: "Search file contents by regular expression",
            category: "search",
        },
        ToolInfo {
            name: "WebFetch",
            description: "Fetch and summarize a URL",
            category: "network",
        },
        ToolInfo {
            name: "WebSearch",
            description: "Search the web",
            category: "network",
        },
        ToolInfo {
            name: "Task",
            description: "Delegate work to a subagent",
            category: "orchestration",
        },
        ToolInfo {
            name: "NotebookEdit",
            description: "Edit a Jupyter notebook cell",
            category: "filesystem",
        },
        ToolInfo {
            name: "TodoWrite",
            description: "Maintain the session task list",
            category: "orchestration",
        },
    ];
    TOOLS.iter().map(|t| (t.name, *t)).collect()
});

pub fn lookup(name: &str) -> Option<&'static ToolInfo> {
    CATALOG.get(name)
}

/// Description text shown next to a pending permission action.
pub fn describe(name: &str) -> &str {
    lookup(name).map(|t| t.description).unwrap_or(name)
}

/// Merge tool names announced by an init message with the static catalog.
/// Catalog entries win; unknown names fall back to the name itself as the
/// description. Duplicate names collapse to one entry, first occurrence
/// order preserved.
pub fn discover_tools_from_init(names: &[String]) -> Vec<DiscoveredTool> {
    let mut seen: Vec<DiscoveredTool> = Vec::new();
    for name in names {
        if seen.iter().any(|t| &t.name == name) {
            continue;
        }
        let entry = match lookup(name) {
            Some(info) => DiscoveredTool {
                name: name.clone(),
                description: info.description.to_string(),
                category: Some(info.category),
            },
            None => DiscoveredTool {
                name: name.clone(),
                description: name.clone(),
                category: None,
            },
        };
        seen.push(entry);
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn describe_falls_back_to_the_name() {
        assert_eq!(describe("Bash"), "Run a shell command in the session's working directory");
        assert_eq!(describe("mcp__db__query"), "mcp__db__query");
    }

    #[test]
    fn discovery_dedupes_and_prefers_catalog_entries() {
        let names = vec![
            "Bash".to_string(),
            "mcp__db__query".to_string(),
            "Bash".to_string(),
        ];
        let tools = discover_tools_from_init(&names);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "Bash");
        assert_eq!(tools[0].category, Some("execution"));
        assert_eq!(tools[1].description, "mcp__db__query");
        assert_eq!(tools[1].category, None);
    }
}
