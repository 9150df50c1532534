//! Shared types passed across the [`super::Harness`] trait boundary.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::process::ChildStdin;
use uuid::Uuid;

/// A task materialized into the shape a harness needs to spawn an agent:
/// a working directory, a prompt, and the invariant commands it should be
/// told about.
#[derive(Debug)]
pub struct MaterializedTask {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub invariant_commands: Vec<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}

/// A handle to a spawned agent process.
#[derive(Debug)]
pub struct AgentHandle {
    pub pid: u32,
    pub stdin: Option<ChildStdin>,
    pub task_id: Uuid,
    pub attempt: u32,
    pub harness_name: String,
}

/// One event parsed out of a running agent's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Message { role: String, content: String },
    ToolCall { tool: String, input: serde_json::Value },
    ToolResult { tool: String, output: serde_json::Value },
    TokenUsage { input_tokens: u64, output_tokens: u64 },
    Error { message: String },
    Completed,
}
