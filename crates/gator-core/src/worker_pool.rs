//! In-memory worker registry with heartbeat-based crash detection and
//! bounded recovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pane::PaneController;
use crate::worktree::WorktreeManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub status: WorkerStatus,
    pub working_copy: Option<PathBuf>,
    pub pane: Option<String>,
    pub current_task: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
}

impl Worker {
    fn new(id: String) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            working_copy: None,
            pane: None,
            current_task: None,
            last_heartbeat: Utc::now(),
            completed: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub heartbeat_timeout: Duration,
    pub auto_recover: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(90),
            auto_recover: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecoverySummary {
    pub recovered: Vec<String>,
    pub gave_up: Vec<String>,
}

pub struct WorkerPool {
    workers: HashMap<String, Worker>,
    config: WorkerPoolConfig,
    retry_counts: HashMap<String, u32>,
}

impl WorkerPool {
    /// Create `concurrency` idle workers, each bound to its own working
    /// copy under `project`'s worktree base (the actual worktree is created
    /// lazily by the fleet when a task is first assigned).
    pub fn initialize(project: &Path, concurrency: usize, config: WorkerPoolConfig) -> Self {
        let mut workers = HashMap::new();
        for i in 0..concurrency {
            let id = format!("worker-{i}");
            let _ = project; // working copies are created per-task, not per-worker, up front
            workers.insert(id.clone(), Worker::new(id));
        }
        Self {
            workers,
            config,
            retry_counts: HashMap::new(),
        }
    }

    pub fn workers(&self) -> Vec<Worker> {
        self.workers.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Worker> {
        self.workers.get(id).cloned()
    }

    pub fn idle_worker(&self) -> Option<Worker> {
        self.workers
            .values()
            .find(|w| w.status == WorkerStatus::Idle)
            .cloned()
    }

    pub fn set_status(&mut self, id: &str, status: WorkerStatus) {
        if let Some(w) = self.workers.get_mut(id) {
            w.status = status;
        }
    }

    pub fn bind_task(&mut self, id: &str, task_id: &str, working_copy: PathBuf, pane: String) {
        if let Some(w) = self.workers.get_mut(id) {
            w.status = WorkerStatus::Busy;
            w.current_task = Some(task_id.to_string());
            w.working_copy = Some(working_copy);
            w.pane = Some(pane);
            w.last_heartbeat = Utc::now();
        }
    }

    pub fn release(&mut self, id: &str) {
        if let Some(w) = self.workers.get_mut(id) {
            w.status = WorkerStatus::Idle;
            w.current_task = None;
        }
    }

    pub fn update_heartbeat(&mut self, id: &str, at: DateTime<Utc>) {
        if let Some(w) = self.workers.get_mut(id) {
            w.last_heartbeat = at;
        }
    }

    pub fn increment_completed(&mut self, id: &str) {
        if let Some(w) = self.workers.get_mut(id) {
            w.completed += 1;
        }
        self.retry_counts.remove(id);
    }

    pub fn increment_failed(&mut self, id: &str) {
        if let Some(w) = self.workers.get_mut(id) {
            w.failed += 1;
        }
    }

    /// Workers in `Error` status, or whose last heartbeat is older than the
    /// configured timeout.
    pub fn detect_crashed(&self) -> Vec<Worker> {
        let now = Utc::now();
        self.workers
            .values()
            .filter(|w| {
                w.status == WorkerStatus::Error
                    || (w.status == WorkerStatus::Busy
                        && now.signed_duration_since(w.last_heartbeat)
                            > chrono::Duration::from_std(self.config.heartbeat_timeout).unwrap_or_default())
            })
            .cloned()
            .collect()
    }

    /// Attempt to bring one crashed worker back to `Idle`:
    /// 1. Mark `Offline` so the scheduler won't reassign to it mid-recovery.
    /// 2. Best-effort tear down its pane and working copy.
    /// 3. Wait `retry_delay`.
    /// 4. If under `max_retries`, mark `Idle` and clear its bound task.
    /// 5. Otherwise leave it `Offline` permanently.
    /// 6. Return whether recovery succeeded.
    pub async fn recover_worker(
        &mut self,
        id: &str,
        pane: &PaneController,
        worktree: &WorktreeManager,
    ) -> bool {
        let worker = match self.workers.get(id) {
            Some(w) => w.clone(),
            None => return false,
        };

        self.set_status(id, WorkerStatus::Offline);

        if let Some(name) = &worker.pane {
            let _ = pane.kill_session(name);
        }
        if let Some(path) = &worker.working_copy {
            let _ = worktree.remove_worktree(path);
        }

        tokio::time::sleep(self.config.retry_delay).await;

        let attempts = self.retry_counts.entry(id.to_string()).or_insert(0);
        *attempts += 1;

        if *attempts > self.config.max_retries {
            return false;
        }

        if let Some(w) = self.workers.get_mut(id) {
            w.status = WorkerStatus::Idle;
            w.current_task = None;
            w.working_copy = None;
            w.pane = None;
            w.last_heartbeat = Utc::now();
        }
        true
    }

    pub async fn auto_recover_all(&mut self, pane: &PaneController, worktree: &WorktreeManager) -> RecoverySummary {
        let mut summary = RecoverySummary::default();
        if !self.config.auto_recover {
            return summary;
        }
        let crashed: Vec<String> = self.detect_crashed().into_iter().map(|w| w.id).collect();
        for id in crashed {
            if self.recover_worker(&id, pane, worktree).await {
                summary.recovered.push(id);
            } else {
                summary.gave_up.push(id);
            }
        }
        summary
    }

    /// Tear down every worker's pane/working copy, e.g. at the end of a run.
    pub fn cleanup(&mut self, pane: &PaneController, worktree: &WorktreeManager) {
        for worker in self.workers.values() {
            if let Some(name) = &worker.pane {
                let _ = pane.kill_session(name);
            }
            if let Some(path) = &worker.working_copy {
                let _ = worktree.remove_worktree(path);
            }
        }
    }
}
