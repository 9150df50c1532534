//! `gator-runner`: the per-task worker process a pane executes.
//!
//! Launched by [`gator_core::executor::Executor::execute`] as
//! `gator-runner --config=<path>`. Reads its [`RunnerConfig`] from that
//! file, drives a harness the same way
//! [`gator_core::lifecycle::run_agent_lifecycle`] does for the plan
//! orchestrator (spawn, write prompt to stdin, collect the event stream),
//! but reports back to the fleet over the RPC bus instead of writing
//! directly to Postgres, and additionally mirrors every event to stdout as
//! a [`RunnerStreamMessage`] line for anyone tailing the pane.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use uuid::Uuid;

use gator_core::executor::{RunnerConfig, RunnerStreamMessage};
use gator_core::graph::task_uuid;
use gator_core::harness::types::{AgentEvent, MaterializedTask};
use gator_core::harness::{ClaudeCodeAdapter, Harness};
use gator_core::rpc::reporter::StatusReporter;
use gator_core::rpc::{self, EncryptionKey, HandlerRegistry};

#[derive(Parser)]
#[command(name = "gator-runner", about = "Runs a single fleet task and reports back over the rpc bus")]
struct Args {
    /// Path to the JSON-encoded RunnerConfig written by the executor.
    #[arg(long)]
    config: PathBuf,
}

fn emit_stream(message: &RunnerStreamMessage) {
    if let Ok(line) = serde_json::to_string(message) {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let body = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read runner config {}", args.config.display()))?;
    let config: RunnerConfig = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse runner config {}", args.config.display()))?;

    let task_id = config.task.id.clone();
    let worker_id = config.worker_id.clone();

    let encryption = config
        .encryption_key
        .as_deref()
        .map(EncryptionKey::from_hex)
        .transpose()
        .context("invalid encryption key in runner config")?;
    let (bus, _events) = rpc::connect(&config.master_endpoint, HandlerRegistry::new(), encryption)
        .await
        .context("failed to connect to fleet rpc bus")?;
    let reporter = StatusReporter::new(bus, worker_id.clone());
    reporter.report_ready().await;
    reporter.report_task_started(&task_id).await;
    let heartbeat = reporter.start_heartbeat(Duration::from_secs(30));

    emit_stream(&RunnerStreamMessage::Init {
        task_id: task_id.clone(),
        timestamp: chrono::Utc::now(),
    });

    let mut env_vars = HashMap::new();
    env_vars.insert("GATOR_WORKER_ID".to_string(), worker_id.clone());

    let materialized = MaterializedTask {
        task_id: task_uuid(&task_id),
        name: config.task.title.clone(),
        description: if config.task.description.is_empty() {
            config.task.title.clone()
        } else {
            config.task.description.clone()
        },
        invariant_commands: vec![],
        working_dir: config.worktree_path.clone(),
        env_vars,
    };

    let harness = ClaudeCodeAdapter::new();

    let result = run_task(&harness, &materialized, &task_id).await;

    heartbeat.abort();

    match &result {
        Ok(summary) => {
            emit_stream(&RunnerStreamMessage::TaskCompleted {
                task_id: task_id.clone(),
                result: summary.clone(),
                timestamp: chrono::Utc::now(),
            });
            reporter.report_task_completed(&task_id, summary.clone()).await;
        }
        Err(e) => {
            emit_stream(&RunnerStreamMessage::TaskFailed {
                task_id: task_id.clone(),
                error: e.to_string(),
                timestamp: chrono::Utc::now(),
            });
            reporter.report_task_failed(&task_id, &e.to_string()).await;
        }
    }

    // Give the emit a moment to flush over the socket before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    result.map(|_| ())
}

/// Spawn the harness, feed it the task prompt, and collect its event stream
/// until completion, forwarding every event as a stream message along the
/// way. Returns a JSON summary on success.
async fn run_task(
    harness: &dyn Harness,
    task: &MaterializedTask,
    task_id: &str,
) -> Result<serde_json::Value> {
    let mut handle = harness.spawn(task).await.context("failed to spawn agent")?;

    if let Some(mut stdin) = handle.stdin.take() {
        use tokio::io::AsyncWriteExt;
        if let Err(e) = stdin.write_all(task.description.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write prompt to agent stdin");
        }
        drop(stdin);
    }

    let mut stream = harness.events(&handle);
    let mut transcript = Vec::new();
    let mut last_error: Option<String> = None;

    while let Some(event) = stream.next().await {
        emit_stream(&RunnerStreamMessage::SdkMessage {
            task_id: task_id.to_string(),
            message: agent_event_to_json(&event),
            timestamp: chrono::Utc::now(),
        });

        match event {
            AgentEvent::Message { role, content } => transcript.push(serde_json::json!({"role": role, "content": content})),
            AgentEvent::Error { message } => last_error = Some(message),
            AgentEvent::Completed => break,
            _ => {}
        }
    }

    if let Some(error) = last_error {
        anyhow::bail!(error);
    }

    Ok(serde_json::json!({"transcript": transcript}))
}

fn agent_event_to_json(event: &AgentEvent) -> serde_json::Value {
    match event {
        AgentEvent::Message { role, content } => serde_json::json!({"type": "message", "role": role, "content": content}),
        AgentEvent::ToolCall { tool, input } => serde_json::json!({"type": "tool_call", "tool": tool, "input": input}),
        AgentEvent::ToolResult { tool, output } => serde_json::json!({"type": "tool_result", "tool": tool, "output": output}),
        AgentEvent::TokenUsage { input_tokens, output_tokens } => {
            serde_json::json!({"type": "token_usage", "input_tokens": input_tokens, "output_tokens": output_tokens})
        }
        AgentEvent::Error { message } => serde_json::json!({"type": "error", "message": message}),
        AgentEvent::Completed => serde_json::json!({"type": "completed"}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_uuid_is_stable_for_non_uuid_ids() {
        let a = task_uuid("task-a");
        let b = task_uuid("task-a");
        assert_eq!(a, b);
    }

    #[test]
    fn task_uuid_parses_real_uuids_unchanged() {
        let id = Uuid::new_v4();
        assert_eq!(task_uuid(&id.to_string()), id);
    }
}
