//! Periodic, resumable run-state persistence for the fleet orchestrator.
//!
//! The Postgres row is the system of record for the plan-based orchestrator;
//! the fleet path has no such row; instead it dumps its full in-memory
//! state to a JSON file it can reload on `--resume`. Writes go to a `.tmp`
//! sibling and are renamed into place, so a crash mid-write never leaves a
//! corrupt snapshot behind.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::GraphTask;
use crate::worker_pool::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub tasks: Vec<GraphTask>,
    pub workers: Vec<Worker>,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stats: Stats,
}

pub async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(snapshot)?;
    tokio::fs::write(&tmp_path, body).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Returns `Ok(None)` on a fresh start (no snapshot file yet) rather than
/// erroring.
pub async fn load_snapshot(path: &Path) -> anyhow::Result<Option<Snapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
