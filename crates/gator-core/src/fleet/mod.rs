//! Event-driven fleet orchestrator.
//!
//! A sibling to [`crate::orchestrator::run_orchestrator`] (the existing
//! plan-based, DB-polling orchestrator), not a replacement for it: `gator
//! dispatch` keeps using the simpler in-process orchestrator; `gator fleet
//! run` uses this one. Both share the worktree service, gate/invariant
//! system, and harness registry.
//!
//! `Fleet` owns all mutable state (graph, worker pool, merge resolver,
//! snapshot path) and is driven by exactly one task reading a single mpsc
//! channel -- the same single-event-loop discipline
//! `run_orchestrator` already uses with its `LifecycleDone` channel. No
//! `Arc<Mutex<_>>` is shared across a process boundary: the only
//! cross-process interface is the RPC bus.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gator_db::models::{ConflictLayer, ConflictResolution};
use gator_db::queries::conflict_records::{self, NewConflictRecord};
use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{Executor, ExecutorResult, PermissionMode, RunnerConfig};
use crate::graph::{GraphStats, GraphTask, TaskGraph};
use crate::merge::{MergeOutcome, MergeResolver, MergeResolverConfig};
use crate::pane::PaneController;
use crate::resource_monitor::ResourceMonitor;
use crate::rpc::{BusServer, EncryptionKey, HandlerRegistry};
use crate::scheduler::{Scheduler, SchedulingPolicy};
use crate::snapshot::{self, Phase, Snapshot, Stats};
use crate::worker_pool::{WorkerPool, WorkerPoolConfig};
use crate::worktree::WorktreeManager;

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub project_path: PathBuf,
    pub trunk_branch: String,
    pub concurrency: usize,
    pub policy: SchedulingPolicy,
    pub fire_and_forget: bool,
    pub task_timeout: Duration,
    pub snapshot_path: PathBuf,
    pub worker_pool: WorkerPoolConfig,
    pub merge: MergeResolverConfig,
    /// Shared HMAC key for the rpc bus's optional signed-frame mode, same
    /// key on every worker. `None` runs the bus unsigned.
    pub encryption: Option<EncryptionKey>,
}

#[derive(Debug, Clone)]
pub enum FleetOutcome {
    /// Fire-and-forget mode: the run was launched and is continuing in a
    /// detached background task; this return carries no final stats.
    Started,
    Completed { stats: GraphStats },
    Failed { stats: GraphStats, unresolved_conflicts: usize },
    Interrupted,
}

/// A terminal event a worker's runner/pane produced, fed back onto the
/// single internal channel the fleet's main loop reads.
enum FleetEvent {
    TaskCompleted { worker_id: String, task_id: String, result: serde_json::Value },
    TaskFailed { worker_id: String, task_id: String, error: String },
    MergeRequest { worker_id: String, task_id: String, branch: String },
    WorkerLog { worker_id: String, level: String, message: String },
    Heartbeat { worker_id: String },
}

/// Waiters registered by `assign_task` for a task's terminal rpc event, keyed
/// by task id. `accept_loop` resolves an entry here instead of forwarding a
/// `FleetEvent` when one is registered, so a task awaited inline isn't also
/// dispatched through the main loop's event channel.
type CompletionMap = Arc<Mutex<HashMap<String, oneshot::Sender<ExecutorResult>>>>;

pub struct Fleet {
    plan_id: Uuid,
    config: FleetConfig,
    graph: TaskGraph,
    scheduler: Scheduler,
    pool: WorkerPool,
    pane: PaneController,
    worktree: WorktreeManager,
    merge: MergeResolver,
    resources: ResourceMonitor,
    db: Option<PgPool>,
    unresolved_conflicts: u64,
    running: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<FleetEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<FleetEvent>>,
    completions: CompletionMap,
}

impl Fleet {
    pub fn new(plan_id: Uuid, config: FleetConfig, db: Option<PgPool>) -> Result<Self> {
        let worktree = WorktreeManager::new(&config.project_path, None)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("failed to initialize worktree manager")?;
        let pane = PaneController::new(Some(format!("gator-{plan_id}")));
        let pool = WorkerPool::initialize(&config.project_path, config.concurrency, config.worker_pool);
        let merge = MergeResolver::new(worktree.clone(), config.merge.clone(), None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            plan_id,
            scheduler: Scheduler::new(config.policy),
            graph: TaskGraph::new(),
            pool,
            pane,
            worktree,
            merge,
            resources: ResourceMonitor::default(),
            db,
            unresolved_conflicts: 0,
            running: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: Some(events_rx),
            completions: Arc::new(Mutex::new(HashMap::new())),
            config,
        })
    }

    pub fn load_tasks(&mut self, tasks: Vec<GraphTask>) -> Result<()> {
        self.graph.add_many(tasks).map_err(|e| anyhow::anyhow!("{e}"))
    }

    /// Rehydrate from a prior snapshot. Tasks still `Running` whose bound
    /// worker's pane no longer exists are reset to `Pending` -- the
    /// concrete reconciliation rule for fire-and-forget runs that were
    /// stopped and resumed.
    pub async fn resume_from_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        self.graph.add_many(snapshot.tasks.clone())?;
        for task in &snapshot.tasks {
            if matches!(task.status, crate::graph::GraphStatus::Running) {
                let still_alive = task
                    .assigned_worker
                    .as_deref()
                    .map(|id| {
                        self.pool
                            .get(id)
                            .and_then(|w| w.pane)
                            .map(|pane| self.pane.session_exists(&pane).unwrap_or(false))
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                if !still_alive {
                    self.graph.reset_to_pending(&task.id)?;
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self, phase: Phase, started_at: chrono::DateTime<chrono::Utc>) -> Snapshot {
        let tasks = self.graph.all();
        let stats = self.graph.stats();
        Snapshot {
            tasks,
            workers: self.pool.workers(),
            phase,
            started_at,
            updated_at: chrono::Utc::now(),
            stats: Stats {
                total: stats.total,
                completed: stats.completed,
                failed: stats.failed,
            },
        }
    }

    /// Run the main loop to completion (or until `cancel` fires). Steps per
    /// the fleet's event-driven design:
    /// 1. start the RPC server and register handlers
    /// 2. initialize the worker pool (done in `new`)
    /// 3. write the initial snapshot and start the autosave timer
    /// 4. try_assign
    /// 5. process events as they arrive (completed/failed/merge-request/heartbeat)
    /// 6. re-try_assign after every state change, and periodically on a
    ///    crash-detection tick even with no new events
    /// 7. finalize once nothing is left running or ready
    ///
    /// In fire-and-forget mode (`config.fire_and_forget`), the initial
    /// `try_assign` still runs inline, but steps 5-7 are handed to a detached
    /// background task and this returns [`FleetOutcome::Started`]
    /// immediately; otherwise this awaits the whole run and returns its real
    /// outcome.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<FleetOutcome> {
        self.running.store(true, Ordering::SeqCst);
        let started_at = chrono::Utc::now();

        let socket_path = self.config.snapshot_path.with_extension("sock");
        let bus_server = BusServer::bind(&socket_path, HandlerRegistry::new(), self.config.encryption.clone())
            .context("failed to bind fleet rpc socket")?;

        tokio::spawn(accept_loop(bus_server, self.events_tx.clone(), Arc::clone(&self.completions)));

        snapshot::write_snapshot(&self.config.snapshot_path, &self.snapshot(Phase::Running, started_at))
            .await
            .ok();

        let autosave_path = self.config.snapshot_path.clone();
        let autosave_running = Arc::clone(&self.running);
        let autosave_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if !autosave_running.load(Ordering::SeqCst) {
                    break;
                }
                // The fleet itself writes the authoritative snapshot inside
                // the main loop on every state change; this timer only
                // exists as a heartbeat for external tooling watching the
                // socket path and is a deliberate no-op placeholder here.
                let _ = &autosave_path;
            }
        });

        self.try_assign().await;

        if self.config.fire_and_forget {
            let plan_id = self.plan_id;
            tokio::spawn(async move {
                let outcome = self.run_until_done(cancel, autosave_handle, started_at).await;
                tracing::info!(%plan_id, ?outcome, "fire-and-forget fleet run finished");
            });
            return Ok(FleetOutcome::Started);
        }

        Ok(self.run_until_done(cancel, autosave_handle, started_at).await)
    }

    /// The event loop body shared by both the inline-await and
    /// fire-and-forget paths; consumes `self` since it either runs to
    /// completion on the caller's task or is itself spawned as one.
    async fn run_until_done(
        mut self,
        cancel: CancellationToken,
        autosave_handle: tokio::task::JoinHandle<()>,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> FleetOutcome {
        let mut events_rx = self.events_rx.take().expect("events_rx taken exactly once per run");
        let mut crash_ticker = tokio::time::interval(Duration::from_secs(15));

        let outcome = loop {
            if cancel.is_cancelled() {
                break self.drain_and_stop(started_at).await;
            }

            if self.graph.stats().running == 0 && self.ready_or_pending_remaining() == 0 {
                break self.finalize(started_at).await;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    break self.drain_and_stop(started_at).await;
                }
                _ = crash_ticker.tick() => {
                    self.run_crash_recovery().await;
                    self.try_assign().await;
                    snapshot::write_snapshot(&self.config.snapshot_path, &self.snapshot(Phase::Running, started_at))
                        .await
                        .ok();
                }
                event = events_rx.recv() => {
                    let result = match event {
                        Some(FleetEvent::TaskCompleted { worker_id, task_id, result }) => {
                            self.on_task_completed(&worker_id, &task_id, result).await
                        }
                        Some(FleetEvent::TaskFailed { worker_id, task_id, error }) => {
                            self.on_task_failed(&worker_id, &task_id, error).await
                        }
                        Some(FleetEvent::MergeRequest { worker_id, task_id, branch }) => {
                            self.on_merge_request(&worker_id, &task_id, &branch).await
                        }
                        Some(FleetEvent::Heartbeat { worker_id }) => {
                            self.pool.update_heartbeat(&worker_id, chrono::Utc::now());
                            continue;
                        }
                        Some(FleetEvent::WorkerLog { worker_id, level, message }) => {
                            let entry = crate::resource_monitor::LogEntry { timestamp: chrono::Utc::now(), level, message };
                            self.resources.record_log(&worker_id, entry.clone());
                            append_log_line(&self.config.project_path, &worker_id, &entry).await.ok();
                            continue;
                        }
                        None => break self.finalize(started_at).await,
                    };
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "error processing fleet event");
                    }
                    self.try_assign().await;
                    snapshot::write_snapshot(&self.config.snapshot_path, &self.snapshot(Phase::Running, started_at))
                        .await
                        .ok();
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        autosave_handle.abort();
        self.pool.cleanup(&self.pane, &self.worktree);

        outcome
    }

    /// Detect crashed workers, attempt bounded recovery, and mark any task
    /// they were bound to as `Failed` so the scheduler reconsiders it
    /// instead of waiting on a worker that will never report back.
    async fn run_crash_recovery(&mut self) {
        let crashed: Vec<(String, Option<String>)> = self
            .pool
            .detect_crashed()
            .into_iter()
            .map(|w| (w.id, w.current_task))
            .collect();
        if crashed.is_empty() {
            return;
        }

        let summary = self.pool.auto_recover_all(&self.pane, &self.worktree).await;
        for (worker_id, task_id) in crashed {
            let Some(task_id) = task_id else { continue };
            if !summary.recovered.contains(&worker_id) && !summary.gave_up.contains(&worker_id) {
                continue;
            }
            if let Some(task) = self.graph.get(&task_id) {
                if task.status == crate::graph::GraphStatus::Running {
                    let _ = self
                        .graph
                        .mark_failed(&task_id, format!("worker {worker_id} crashed (heartbeat timeout or error)"));
                }
            }
        }
    }

    fn ready_or_pending_remaining(&self) -> usize {
        let stats = self.graph.stats();
        stats.pending + stats.ready
    }

    async fn drain_and_stop(&mut self, started_at: chrono::DateTime<chrono::Utc>) -> FleetOutcome {
        tokio::time::sleep(Duration::from_secs(10)).await;
        snapshot::write_snapshot(&self.config.snapshot_path, &self.snapshot(Phase::Idle, started_at))
            .await
            .ok();
        FleetOutcome::Interrupted
    }

    /// Assign ready tasks to idle workers until one side runs out. A task
    /// that fails to assign (e.g. a broken worktree base) is excluded for
    /// the rest of this tick so other idle worker/ready task pairs still
    /// get a chance; it stays `Pending` and is reconsidered on the next
    /// tick rather than being marked `Failed`.
    async fn try_assign(&mut self) {
        let mut excluded = HashSet::new();
        loop {
            let Some(worker) = self.pool.idle_worker() else { break };
            let Some(task) = self.scheduler.next_excluding(&self.graph, &excluded) else { break };

            if let Err(e) = self.assign_task(&worker.id, &task.id).await {
                tracing::warn!(worker = %worker.id, task = %task.id, error = %e, "failed to assign task, trying next ready task");
                self.pool.release(&worker.id);
                excluded.insert(task.id.clone());
                continue;
            }
        }
    }

    async fn assign_task(&mut self, worker_id: &str, task_id: &str) -> Result<()> {
        let task = self.graph.get(task_id).context("task vanished before assignment")?;
        let branch = WorktreeManager::branch_name(&self.plan_id.to_string(), task_id);

        let worktree = self.worktree.clone();
        let branch_for_create = branch.clone();
        let info = tokio::task::spawn_blocking(move || worktree.create_worktree(&branch_for_create))
            .await
            .context("worktree creation task panicked")?
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let session = self.pane.create_session(task_id, &info.path).map_err(|e| anyhow::anyhow!("{e}"))?;

        self.pool.bind_task(worker_id, task_id, info.path.clone(), session.clone());
        self.graph.mark_running(task_id, worker_id)?;

        let executor = Executor::new(self.pane.clone(), executor_config_dir(&self.config.snapshot_path));
        let runner_config = RunnerConfig {
            worker_id: worker_id.to_string(),
            task: task.clone(),
            worktree_path: info.path,
            master_endpoint: self.config.snapshot_path.with_extension("sock"),
            permission_mode: PermissionMode::AcceptEdits,
            allowed_tools: vec![],
            max_turns: None,
            model: None,
            encryption_key: self.config.encryption.as_ref().map(|k| k.to_hex()),
        };

        if self.config.fire_and_forget {
            executor
                .execute(&session, &runner_config, true, None, self.config.task_timeout)
                .await?;
            return Ok(());
        }

        // Register a waiter for this task's terminal rpc event and drive the
        // await on its own task, so `try_assign`'s loop isn't blocked behind
        // one task while other idle workers are still waiting to be given
        // work. `accept_loop` resolves this oneshot when the runner reports
        // back; the executor's own timeout still applies here, unlike the
        // fire-and-forget path above.
        let (tx, rx) = oneshot::channel();
        self.completions.lock().await.insert(task_id.to_string(), tx);

        let completions = Arc::clone(&self.completions);
        let events_tx = self.events_tx.clone();
        let worker_id = worker_id.to_string();
        let task_id = task_id.to_string();
        let timeout = self.config.task_timeout;
        tokio::spawn(async move {
            let outcome = executor.execute(&session, &runner_config, false, Some(rx), timeout).await;
            completions.lock().await.remove(&task_id);
            let event = match outcome {
                Ok(ExecutorResult::Completed { summary }) => FleetEvent::TaskCompleted { worker_id, task_id, result: summary },
                Ok(ExecutorResult::Failed { error }) => FleetEvent::TaskFailed { worker_id, task_id, error },
                Ok(ExecutorResult::Started) => return,
                Err(e) => FleetEvent::TaskFailed { worker_id, task_id, error: e.to_string() },
            };
            let _ = events_tx.send(event);
        });

        Ok(())
    }

    async fn on_task_completed(&mut self, worker_id: &str, task_id: &str, _result: serde_json::Value) -> Result<()> {
        // Idempotent: ignore a duplicate completion for a task that's
        // already terminal.
        if let Some(task) = self.graph.get(task_id) {
            if task.status != crate::graph::GraphStatus::Running {
                return Ok(());
            }
        }
        self.graph.mark_completed(task_id)?;
        self.pool.increment_completed(worker_id);
        self.pool.release(worker_id);
        Ok(())
    }

    async fn on_task_failed(&mut self, worker_id: &str, task_id: &str, error: String) -> Result<()> {
        if let Some(task) = self.graph.get(task_id) {
            if task.status != crate::graph::GraphStatus::Running {
                return Ok(());
            }
        }
        self.graph.mark_failed(task_id, error)?;
        self.pool.increment_failed(worker_id);
        self.pool.release(worker_id);
        Ok(())
    }

    /// The single call site of the merge resolver: because it is only ever
    /// invoked from this loop, merges are serialized by construction.
    async fn on_merge_request(&mut self, worker_id: &str, task_id: &str, branch: &str) -> Result<()> {
        let plan_id = self.plan_id;
        let task_a_id = crate::graph::task_uuid(task_id);
        let task_b_id = task_a_id;
        let db = self.db.clone();

        let record = move |plan_id: Uuid,
                            task_a_id: Uuid,
                            task_b_id: Uuid,
                            files: Vec<String>,
                            layer: ConflictLayer,
                            resolution: ConflictResolution,
                            detail: Option<String>| {
            let db = db.clone();
            Box::pin(async move {
                if let Some(pool) = db {
                    conflict_records::insert_conflict_record(
                        &pool,
                        &NewConflictRecord {
                            plan_id,
                            task_a_id,
                            task_b_id,
                            files,
                            layer,
                            resolution,
                            detail,
                        },
                    )
                    .await?;
                }
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        };

        let outcome = self
            .merge
            .resolve_merge_request(&self.config.trunk_branch, branch, plan_id, task_a_id, task_b_id, &record)
            .await?;

        match outcome {
            MergeOutcome::Merged { .. } => {
                self.on_task_completed(worker_id, task_id, serde_json::json!({"merged": true})).await?;
            }
            MergeOutcome::Escalated { conflicted_files } => {
                self.unresolved_conflicts += 1;
                self.on_task_failed(
                    worker_id,
                    task_id,
                    format!("merge escalated: {} conflicting file(s)", conflicted_files.len()),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn finalize(&mut self, started_at: chrono::DateTime<chrono::Utc>) -> FleetOutcome {
        let stats = self.graph.stats();
        let phase = if stats.failed == 0 && self.unresolved_conflicts == 0 {
            Phase::Completed
        } else {
            Phase::Failed
        };
        snapshot::write_snapshot(&self.config.snapshot_path, &self.snapshot(phase, started_at))
            .await
            .ok();

        if stats.failed == 0 && self.unresolved_conflicts == 0 {
            FleetOutcome::Completed { stats }
        } else {
            FleetOutcome::Failed {
                stats,
                unresolved_conflicts: self.unresolved_conflicts as usize,
            }
        }
    }

    pub fn resource_monitor(&mut self) -> &mut ResourceMonitor {
        &mut self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    /// Mirrors `worktree::tests::create_temp_repo`: a throwaway git repo
    /// with one commit, suitable for exercising `Fleet::new` without a real
    /// project checkout.
    fn temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().to_path_buf();
        Command::new("git").args(["init"]).current_dir(&repo_path).output().unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@gator.dev"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Gator Test"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        std::fs::write(repo_path.join("README.md"), "# test\n").unwrap();
        Command::new("git").args(["add", "."]).current_dir(&repo_path).output().unwrap();
        Command::new("git")
            .args(["commit", "-m", "initial"])
            .current_dir(&repo_path)
            .output()
            .unwrap();
        (dir, repo_path)
    }

    fn test_config(project_path: PathBuf, snapshot_dir: &std::path::Path) -> FleetConfig {
        FleetConfig {
            project_path,
            trunk_branch: "main".to_string(),
            concurrency: 2,
            policy: SchedulingPolicy::PriorityFirst,
            fire_and_forget: true,
            task_timeout: Duration::from_secs(60),
            snapshot_path: snapshot_dir.join("run.json"),
            worker_pool: WorkerPoolConfig::default(),
            merge: MergeResolverConfig::default(),
            encryption: None,
        }
    }

    #[test]
    fn new_fleet_initializes_empty_graph_with_idle_workers() {
        let (_repo_dir, repo_path) = temp_repo();
        let snapshot_dir = TempDir::new().unwrap();
        let config = test_config(repo_path, snapshot_dir.path());

        let fleet = Fleet::new(Uuid::new_v4(), config, None).unwrap();
        assert_eq!(fleet.graph.len(), 0);
        assert_eq!(fleet.pool.workers().len(), 2);
    }

    #[test]
    fn load_tasks_populates_ready_set() {
        let (_repo_dir, repo_path) = temp_repo();
        let snapshot_dir = TempDir::new().unwrap();
        let config = test_config(repo_path, snapshot_dir.path());

        let mut fleet = Fleet::new(Uuid::new_v4(), config, None).unwrap();
        fleet
            .load_tasks(vec![
                GraphTask::new("a", "Task A"),
                GraphTask::new("b", "Task B").with_dependencies(vec!["a".to_string()]),
            ])
            .unwrap();

        assert_eq!(fleet.ready_or_pending_remaining(), 2);
        assert_eq!(fleet.graph.ready_set().len(), 1);
    }

    #[tokio::test]
    async fn resume_from_snapshot_resets_orphaned_running_tasks() {
        let (_repo_dir, repo_path) = temp_repo();
        let snapshot_dir = TempDir::new().unwrap();
        let config = test_config(repo_path, snapshot_dir.path());

        let mut fleet = Fleet::new(Uuid::new_v4(), config, None).unwrap();

        let mut task = GraphTask::new("a", "Task A");
        task.status = crate::graph::GraphStatus::Running;
        task.assigned_worker = Some("worker-0".to_string());

        let snapshot = Snapshot {
            tasks: vec![task],
            workers: fleet.pool.workers(),
            phase: Phase::Running,
            started_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            stats: Stats { total: 1, completed: 0, failed: 0 },
        };

        fleet.resume_from_snapshot(snapshot).await.unwrap();

        let restored = fleet.graph.get("a").unwrap();
        assert_eq!(restored.status, crate::graph::GraphStatus::Pending);
    }

    #[tokio::test]
    async fn finalize_reports_completed_when_nothing_failed() {
        let (_repo_dir, repo_path) = temp_repo();
        let snapshot_dir = TempDir::new().unwrap();
        let config = test_config(repo_path, snapshot_dir.path());

        let mut fleet = Fleet::new(Uuid::new_v4(), config, None).unwrap();
        fleet.load_tasks(vec![GraphTask::new("a", "Task A")]).unwrap();
        fleet.graph.mark_running("a", "worker-0").unwrap();
        fleet.graph.mark_completed("a").unwrap();

        let outcome = fleet.finalize(chrono::Utc::now()).await;
        assert!(matches!(outcome, FleetOutcome::Completed { .. }));
    }
}

/// Append one worker log line to `<project>/.gator/logs/<worker_id>.jsonl`,
/// so a separate `gator serve` process can tail a fleet run's worker logs
/// without sharing this process's in-memory [`ResourceMonitor`].
async fn append_log_line(project_path: &std::path::Path, worker_id: &str, entry: &crate::resource_monitor::LogEntry) -> Result<()> {
    let dir = project_path.join(".gator").join("logs");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(format!("{worker_id}.jsonl"));
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
    file.write_all(line.as_bytes()).await?;
    Ok(())
}

fn executor_config_dir(snapshot_path: &std::path::Path) -> PathBuf {
    snapshot_path
        .parent()
        .map(|p| p.join("runner-configs"))
        .unwrap_or_else(crate::executor::default_config_dir)
}

async fn accept_loop(server: BusServer, events_tx: mpsc::UnboundedSender<FleetEvent>, completions: CompletionMap) {
    loop {
        let (bus, mut rx) = match server.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "fleet rpc accept failed");
                break;
            }
        };
        let tx = events_tx.clone();
        let completions = Arc::clone(&completions);
        tokio::spawn(async move {
            let _bus = bus;
            while let Some(envelope) = rx.recv().await {
                match envelope {
                    crate::rpc::Envelope::Heartbeat { worker_id, .. } => {
                        let _ = tx.send(FleetEvent::Heartbeat { worker_id });
                    }
                    crate::rpc::Envelope::Event { channel, worker_id, task_id, payload, .. } => {
                        if channel == "worker:log" {
                            let level = payload.get("level").and_then(|v| v.as_str()).unwrap_or("info").to_string();
                            let message = payload.get("message").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                            let _ = tx.send(FleetEvent::WorkerLog { worker_id, level, message });
                            continue;
                        }
                        let Some(task_id) = task_id else { continue };
                        match channel.as_str() {
                            "worker:task_completed" => {
                                let waiter = completions.lock().await.remove(&task_id);
                                match waiter {
                                    Some(sender) => {
                                        let _ = sender.send(ExecutorResult::Completed { summary: payload });
                                    }
                                    None => {
                                        let _ = tx.send(FleetEvent::TaskCompleted { worker_id, task_id, result: payload });
                                    }
                                }
                            }
                            "worker:task_failed" => {
                                let error = payload.get("error").and_then(|v| v.as_str()).unwrap_or("unknown error").to_string();
                                let waiter = completions.lock().await.remove(&task_id);
                                match waiter {
                                    Some(sender) => {
                                        let _ = sender.send(ExecutorResult::Failed { error });
                                    }
                                    None => {
                                        let _ = tx.send(FleetEvent::TaskFailed { worker_id, task_id, error });
                                    }
                                }
                            }
                            "worker:merge_request" => {
                                let branch = payload.get("branch").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                                let _ = tx.send(FleetEvent::MergeRequest { worker_id, task_id, branch });
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }
        });
    }
}
