//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use std::path::Path;

use anyhow::{Context, Result, bail};
use gator_db::queries::tasks as task_db;
use sqlx::PgPool;
use uuid::Uuid;

use gator_db::models::TaskStatus;

use super::TaskStateMachine;

/// Assign a task to a harness and worktree.
///
/// Validates that all dependencies are `passed`, sets metadata,
/// and transitions `pending -> assigned`.
pub async fn assign_task(
    pool: &PgPool,
    task_id: Uuid,
    harness: &str,
    worktree_path: &Path,
) -> Result<()> {
    TaskStateMachine::assign_task(pool, task_id, harness, worktree_path).await
}

/// Start a task: transition `assigned -> running`.
///
/// Sets `started_at` to the current timestamp.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Assigned, TaskStatus::Running).await
}

/// Begin checking a task's invariants: transition `running -> checking`.
pub async fn begin_checking(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Running, TaskStatus::Checking).await
}

/// Mark a task as passed: transition `checking -> passed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn pass_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Passed).await
}

/// Mark a task as failed: transition `checking -> failed`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn fail_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Failed).await
}

/// Retry a failed task: transition `failed -> assigned`.
///
/// Increments the attempt counter. Fails if `attempt >= retry_max`.
pub async fn retry_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Assigned).await
}

/// Escalate a failed task: transition `failed -> escalated`.
///
/// Sets `completed_at` to the current timestamp.
pub async fn escalate_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Failed, TaskStatus::Escalated).await
}

/// Approve a task awaiting human review: transition `checking -> passed`.
///
/// Commits any uncommitted agent work in the task's worktree first, so the
/// approved changes are visible to `gator merge`.
pub async fn approve_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    if task.status != TaskStatus::Checking {
        bail!(
            "cannot approve task {}: current status is {}, expected checking",
            task_id,
            task.status
        );
    }

    if let Some(worktree_path) = &task.worktree_path {
        let attempt = task.attempt.max(0) as u32;
        if let Err(e) = crate::lifecycle::commit_agent_work(
            Path::new(worktree_path),
            &task.name,
            attempt,
        ) {
            tracing::warn!(task_id = %task_id, error = %e, "failed to commit agent work on approve (non-fatal)");
        }
    }

    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Passed).await
}

/// Reject a task awaiting human review: transition `checking -> failed`.
///
/// The task then follows normal retry/escalation policy.
pub async fn reject_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Checking, TaskStatus::Failed).await
}

/// Operator-initiated retry of a failed or escalated task.
///
/// Resets the task to `pending` so the DAG scheduler picks it up fresh,
/// incrementing the attempt counter. `force` bypasses the `retry_max`
/// check (the only way to bring an escalated task, or a failed task that
/// has exhausted its retries, back into play).
pub async fn operator_retry_task(pool: &PgPool, task_id: Uuid, force: bool) -> Result<()> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {} not found", task_id))?;

    match task.status {
        TaskStatus::Failed => {
            if task.attempt >= task.retry_max && !force {
                bail!(
                    "cannot retry task {}: attempt {} >= retry_max {} (use --force to override)",
                    task_id,
                    task.attempt,
                    task.retry_max
                );
            }
            let rows = task_db::retry_task_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!("optimistic lock failed on retry for task {}", task_id);
            }
            Ok(())
        }
        TaskStatus::Escalated => {
            if !force {
                bail!(
                    "cannot retry escalated task {} without --force: it has exhausted its retry budget",
                    task_id
                );
            }
            let rows = task_db::retry_escalated_to_pending(pool, task_id, task.attempt).await?;
            if rows == 0 {
                bail!(
                    "optimistic lock failed on escalated retry for task {}",
                    task_id
                );
            }
            Ok(())
        }
        other => bail!(
            "cannot retry task {}: current status is {}, expected failed or escalated",
            task_id,
            other
        ),
    }
}
