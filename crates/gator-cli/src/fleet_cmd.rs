//! `gator fleet <subcommand>`: the event-driven orchestrator path.
//!
//! Grounded on [`dispatch_cmd::run_dispatch`]'s shape (resolve config, wire
//! Ctrl+C into a `CancellationToken`, map the result onto a process exit
//! code) but drives [`gator_core::fleet::Fleet`] instead of
//! `run_orchestrator`, and loads its task set from a JSON file rather than
//! the plans table.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use gator_core::fleet::{Fleet, FleetConfig, FleetOutcome};
use gator_core::graph::{self, GraphTask};
use gator_core::merge::MergeResolverConfig;
use gator_core::rpc::EncryptionKey;
use gator_core::scheduler::SchedulingPolicy;
use gator_core::snapshot;
use gator_core::worker_pool::WorkerPoolConfig;

/// Load a fleet's task set from the spec's original tasks-JSON interop
/// format, via [`gator_core::graph::from_tasks_json`].
fn load_tasks_file(path: &Path) -> Result<Vec<GraphTask>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read tasks file {}", path.display()))?;
    graph::from_tasks_json(&body)
        .with_context(|| format!("failed to parse tasks file {} as JSON", path.display()))
}

pub struct RunOptions {
    pub tasks_file: String,
    pub workers: usize,
    pub strategy: String,
    pub fire_and_forget: bool,
    pub resume: bool,
    pub task_timeout: u64,
}

/// `gator fleet run`.
pub async fn run_fleet(
    pool: Option<&PgPool>,
    project_path: &str,
    trunk_branch: &str,
    options: RunOptions,
) -> Result<()> {
    let policy = match options.strategy.as_str() {
        "unlock" => SchedulingPolicy::UnlockFirst,
        "priority" | "" => SchedulingPolicy::PriorityFirst,
        other => bail!("unknown scheduling strategy {other:?}, expected priority|unlock"),
    };

    let project_path = std::path::PathBuf::from(project_path);
    let plan_id = Uuid::new_v4();
    let snapshot_path = project_path.join(".gator").join("fleet-run.json");
    if let Some(dir) = snapshot_path.parent() {
        std::fs::create_dir_all(dir).ok();
    }

    let config = FleetConfig {
        project_path: project_path.clone(),
        trunk_branch: trunk_branch.to_string(),
        concurrency: options.workers,
        policy,
        fire_and_forget: options.fire_and_forget,
        task_timeout: Duration::from_secs(options.task_timeout),
        snapshot_path: snapshot_path.clone(),
        worker_pool: WorkerPoolConfig::default(),
        merge: MergeResolverConfig::default(),
        // Out-of-band key distribution: read from the environment rather
        // than a CLI flag so it never lands in shell history or process args.
        encryption: EncryptionKey::from_env(),
    };

    let mut fleet = Fleet::new(plan_id, config, pool.cloned())?;

    if options.resume {
        if let Some(existing) = snapshot::load_snapshot(&snapshot_path).await? {
            println!("Resuming fleet run from {}", snapshot_path.display());
            fleet.resume_from_snapshot(existing).await?;
        } else {
            println!("No snapshot found at {}, starting fresh.", snapshot_path.display());
            let tasks = load_tasks_file(Path::new(&options.tasks_file))?;
            println!("Loaded {} task(s) from {}", tasks.len(), options.tasks_file);
            fleet.load_tasks(tasks)?;
        }
    } else {
        let tasks = load_tasks_file(Path::new(&options.tasks_file))?;
        println!("Loaded {} task(s) from {}", tasks.len(), options.tasks_file);
        fleet.load_tasks(tasks)?;
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    println!("Starting fleet run {plan_id} with {} worker(s), strategy={}", options.workers, options.strategy);

    let outcome = fleet.start(cancel).await?;

    match outcome {
        FleetOutcome::Started => {
            println!("\nFleet run launched in the background (fire-and-forget). Use `gator fleet status` to check progress.");
        }
        FleetOutcome::Completed { stats } => {
            println!(
                "\nFleet run completed: {}/{} tasks done.",
                stats.completed, stats.total
            );
        }
        FleetOutcome::Failed { stats, unresolved_conflicts } => {
            println!(
                "\nFleet run failed: {} task(s) failed, {} unresolved conflict(s) out of {} total.",
                stats.failed, unresolved_conflicts, stats.total
            );
            std::process::exit(1);
        }
        FleetOutcome::Interrupted => {
            println!("\nFleet run interrupted. Snapshot saved to {}.", snapshot_path.display());
            println!("Re-run with --resume to continue.");
            std::process::exit(2);
        }
    }

    Ok(())
}

/// `gator fleet status`: print the last-written snapshot, if any.
pub async fn run_fleet_status(project_path: &str) -> Result<()> {
    let snapshot_path = Path::new(project_path).join(".gator").join("fleet-run.json");
    match snapshot::load_snapshot(&snapshot_path).await? {
        Some(snap) => {
            println!("Fleet run phase: {:?}", snap.phase);
            println!(
                "Tasks: {} total, {} completed, {} failed",
                snap.stats.total, snap.stats.completed, snap.stats.failed
            );
            for worker in &snap.workers {
                println!(
                    "  {} [{:?}] task={:?} completed={} failed={}",
                    worker.id, worker.status, worker.current_task, worker.completed, worker.failed
                );
            }
        }
        None => {
            println!("No fleet run snapshot found at {}", snapshot_path.display());
        }
    }
    Ok(())
}
