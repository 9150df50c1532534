//! `gator pr <plan-id>` command: push the base branch and open a GitHub PR
//! via the `gh` CLI once a plan has been merged.

use std::process::Command;

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use gator_db::models::PlanStatus;
use gator_db::queries::plans as plan_db;
use gator_db::queries::tasks as task_db;

/// Options controlling PR creation.
pub struct PrOptions {
    /// Open the PR as a draft.
    pub draft: bool,
    /// Override the PR's base branch (defaults to the repo's default branch).
    pub base: Option<String>,
}

/// Push the plan's base branch and create a PR describing the completed tasks.
pub async fn run_pr(pool: &PgPool, plan_id_str: &str, options: &PrOptions) -> Result<()> {
    let plan_id =
        Uuid::parse_str(plan_id_str).with_context(|| format!("invalid plan ID: {plan_id_str}"))?;

    let plan = plan_db::get_plan(pool, plan_id)
        .await?
        .with_context(|| format!("plan {plan_id} not found"))?;

    if plan.status != PlanStatus::Completed {
        bail!(
            "plan {} is {} -- run `gator merge {}` first (expected completed)",
            plan_id,
            plan.status,
            plan_id
        );
    }

    let tasks = task_db::list_tasks_for_plan(pool, plan_id).await?;
    let passed = tasks
        .iter()
        .filter(|t| t.status == gator_db::models::TaskStatus::Passed)
        .count();

    println!("Pushing {} to origin...", plan.base_branch);
    push_branch(&plan.project_path, &plan.base_branch)?;

    let title = format!("{} ({} tasks)", plan.name, passed);
    let body = build_pr_body(&plan.name, &tasks);

    let pr_url = create_pr(
        &plan.project_path,
        &title,
        &body,
        options.base.as_deref(),
        options.draft,
    )?;

    println!("PR created: {pr_url}");

    Ok(())
}

fn push_branch(repo_path: &str, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["push", "-u", "origin", branch])
        .current_dir(repo_path)
        .output()
        .with_context(|| "failed to run git push")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git push failed: {stderr}");
    }

    Ok(())
}

fn create_pr(
    repo_path: &str,
    title: &str,
    body: &str,
    base: Option<&str>,
    draft: bool,
) -> Result<String> {
    let mut args = vec!["pr", "create", "--title", title, "--body", body];
    if let Some(base) = base {
        args.push("--base");
        args.push(base);
    }
    if draft {
        args.push("--draft");
    }

    let output = Command::new("gh")
        .args(&args)
        .current_dir(repo_path)
        .output()
        .with_context(|| "failed to run gh pr create (is the GitHub CLI installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("gh pr create failed: {stderr}");
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Build a PR description summarizing the tasks carried by the plan.
fn build_pr_body(plan_name: &str, tasks: &[gator_db::models::Task]) -> String {
    let mut body = format!("Generated by gator for plan \"{plan_name}\".\n\nTasks:\n");
    for task in tasks {
        body.push_str(&format!("- [{}] {}\n", task.status, task.name));
    }
    body
}
