//! Per-task execution driver: launches a `gator-runner` subprocess into a
//! pane and talks to it over the RPC bus.
//!
//! This is the fleet-path analogue of [`crate::lifecycle::run_agent_lifecycle`],
//! which drives a `Harness` in-process for the plan orchestrator. Here the
//! harness instead runs inside a separate OS process so a crashed agent
//! can't take the orchestrator down with it.

pub mod hooks;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::graph::GraphTask;
use crate::pane::PaneController;

/// Permission posture passed through to the runner's harness invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
}

/// Ephemeral config handed to a runner subprocess on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub worker_id: String,
    pub task: GraphTask,
    pub worktree_path: PathBuf,
    pub master_endpoint: PathBuf,
    pub permission_mode: PermissionMode,
    pub allowed_tools: Vec<String>,
    pub max_turns: Option<u32>,
    pub model: Option<String>,
    /// Hex-encoded shared secret for the rpc bus's optional HMAC-signed
    /// mode. `None` means the bus carries envelopes unsigned.
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ExecutorResult {
    /// Fire-and-forget mode: the runner was launched but its completion was
    /// not awaited.
    Started,
    Completed { summary: serde_json::Value },
    Failed { error: String },
}

/// Registers a one-shot waiter for a task's terminal RPC event and drives a
/// runner subprocess into a pane to produce it.
pub struct Executor {
    pane: PaneController,
    config_dir: PathBuf,
}

impl Executor {
    pub fn new(pane: PaneController, config_dir: PathBuf) -> Self {
        Self { pane, config_dir }
    }

    /// Write the runner's config to an ephemeral JSON file and send the
    /// `gator-runner --config=<path>` command into the task's pane.
    ///
    /// In fire-and-forget mode this returns immediately after the command
    /// is sent. Otherwise it awaits `completion`, which the caller should
    /// resolve from the bus's `task_completed`/`task_failed` events for this
    /// task id (wiring the oneshot into the RPC [`crate::rpc::HandlerRegistry`]
    /// or the fleet's own event loop is the caller's responsibility -- the
    /// executor only knows how to launch the process).
    pub async fn execute(
        &self,
        session_name: &str,
        config: &RunnerConfig,
        fire_and_forget: bool,
        completion: Option<oneshot::Receiver<ExecutorResult>>,
        timeout: Duration,
    ) -> Result<ExecutorResult> {
        let config_path = self.write_config(config).await?;

        self.pane
            .send_command(session_name, &format!("gator-runner --config={}", config_path.display()))
            .with_context(|| format!("failed to launch runner in pane {session_name}"))?;

        if fire_and_forget {
            return Ok(ExecutorResult::Started);
        }

        let Some(completion) = completion else {
            return Ok(ExecutorResult::Started);
        };

        match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(ExecutorResult::Failed {
                error: "runner disconnected before reporting a result".to_string(),
            }),
            Err(_) => {
                let _ = self.pane.interrupt(session_name);
                Ok(ExecutorResult::Failed {
                    error: format!("task exceeded timeout of {timeout:?}"),
                })
            }
        }
    }

    async fn write_config(&self, config: &RunnerConfig) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.config_dir).await.ok();
        let path = self
            .config_dir
            .join(format!("runner-{}-{}.json", config.worker_id, Uuid::new_v4()));
        let body = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

/// Stream message shapes the spec defines for the runner's stdout protocol.
/// `gator-runner` emits one of these per line, in addition to reporting the
/// same events over the RPC bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerStreamMessage {
    Init { task_id: String, timestamp: chrono::DateTime<chrono::Utc> },
    SdkMessage { task_id: String, message: serde_json::Value, timestamp: chrono::DateTime<chrono::Utc> },
    Progress { task_id: String, percent: u8, message: String, timestamp: chrono::DateTime<chrono::Utc> },
    TaskCompleted { task_id: String, result: serde_json::Value, timestamp: chrono::DateTime<chrono::Utc> },
    TaskFailed { task_id: String, error: String, timestamp: chrono::DateTime<chrono::Utc> },
}

pub fn default_config_dir() -> PathBuf {
    std::env::temp_dir().join("gator-runner-configs")
}

pub fn config_dir_for(base: &Path) -> PathBuf {
    base.join(".gator").join("runner-configs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_config_round_trips_through_json() {
        let config = RunnerConfig {
            worker_id: "worker-0".to_string(),
            task: GraphTask::new("t1", "Task 1"),
            worktree_path: PathBuf::from("/tmp/wt"),
            master_endpoint: PathBuf::from("/tmp/bus.sock"),
            permission_mode: PermissionMode::AcceptEdits,
            allowed_tools: vec!["bash".to_string()],
            max_turns: Some(10),
            model: None,
            encryption_key: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.worker_id, "worker-0");
        assert_eq!(parsed.task.id, "t1");
    }
}
