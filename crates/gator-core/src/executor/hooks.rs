//! Before/after-tool-use hooks for runner-driven agents.
//!
//! The deny-list is configuration, not architecture (see the merge
//! resolver's glob layers for the same principle applied to conflicts):
//! sensible defaults ship here, but an operator can extend or replace them
//! via [`GatorConfig`]-sourced patterns rather than editing code.

use glob::Pattern;
use serde::{Deserialize, Serialize};

/// A tool invocation the before-tool-use hook inspects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub tool_name: String,
    pub tool_input: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct DangerousPatterns {
    /// Tool names this hook inspects at all (others pass through).
    command_tools: Vec<String>,
    /// Shell-command glob patterns that are denied outright.
    denied_command_patterns: Vec<String>,
    /// File-path glob patterns that may not be written to.
    denied_write_paths: Vec<String>,
}

impl Default for DangerousPatterns {
    fn default() -> Self {
        Self {
            command_tools: vec!["bash".to_string(), "shell".to_string()],
            denied_command_patterns: vec![
                "rm -rf /*".to_string(),
                "* --no-verify*".to_string(),
                "*force-push*".to_string(),
                "git push --force*".to_string(),
                "*curl* | sh*".to_string(),
            ],
            denied_write_paths: vec!["**/.env".to_string(), "**/id_rsa*".to_string(), "**/*.pem".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub enum HookVerdict {
    Allow,
    Deny { reason: String },
}

impl DangerousPatterns {
    pub fn new(
        command_tools: Vec<String>,
        denied_command_patterns: Vec<String>,
        denied_write_paths: Vec<String>,
    ) -> Self {
        Self {
            command_tools,
            denied_command_patterns,
            denied_write_paths,
        }
    }

    /// Evaluate a tool call before it runs. Matching is best-effort glob
    /// matching against the command string / target path, not a shell
    /// parser: it catches the common dangerous idioms without attempting
    /// to be a complete sandbox.
    pub fn before_tool_use(&self, call: &ToolUse) -> HookVerdict {
        if self.command_tools.contains(&call.tool_name) {
            if let Some(command) = call.tool_input.get("command").and_then(|v| v.as_str()) {
                for pattern in &self.denied_command_patterns {
                    if Pattern::new(pattern).map(|p| p.matches(command)).unwrap_or(false) {
                        return HookVerdict::Deny {
                            reason: format!("command matches denied pattern {pattern:?}: {command}"),
                        };
                    }
                }
            }
        }

        if call.tool_name == "write" || call.tool_name == "edit" {
            if let Some(path) = call.tool_input.get("path").and_then(|v| v.as_str()) {
                for pattern in &self.denied_write_paths {
                    if Pattern::new(pattern).map(|p| p.matches(path)).unwrap_or(false) {
                        return HookVerdict::Deny {
                            reason: format!("write target matches denied pattern {pattern:?}: {path}"),
                        };
                    }
                }
            }
        }

        HookVerdict::Allow
    }
}
