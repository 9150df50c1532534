//! Layered conflict resolver: wraps [`WorktreeManager::merge_branch`] with
//! a three-tier policy over which conflicted files get resolved how.
//!
//! Grounded on the existing `gator merge` command's git-shell-out idiom
//! (trunk checkout, merge, summarize, push, cleanup); this module lifts
//! that happy path into a reusable function shared by the one-shot CLI
//! command and the fleet's live `on_merge_request` handler, and adds the
//! conflict-classification layers the plan-level merge command does not
//! need (it always escalates on conflict).

use std::process::Command;
use std::sync::Arc;

use glob::Pattern;
use gator_db::models::{ConflictLayer, ConflictResolution};
use uuid::Uuid;

use crate::harness::Harness;
use crate::worktree::{MergeResult, WorktreeError, WorktreeManager};

/// Which layer handled (or should handle) a conflicted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionLayer {
    Auto,
    AiAssisted,
    Escalate,
}

impl From<ResolutionLayer> for ConflictLayer {
    fn from(layer: ResolutionLayer) -> Self {
        match layer {
            ResolutionLayer::Auto => ConflictLayer::Auto,
            ResolutionLayer::AiAssisted => ConflictLayer::AiAssisted,
            ResolutionLayer::Escalate => ConflictLayer::Escalated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergeResolverConfig {
    /// Glob patterns for files level 1 auto-resolves by taking trunk's side.
    pub auto_patterns: Vec<String>,
    /// Glob patterns that always escalate regardless of level 2 capability.
    /// Checked before `auto_patterns`, so escalation wins on overlap.
    pub escalate_patterns: Vec<String>,
}

impl Default for MergeResolverConfig {
    fn default() -> Self {
        Self {
            auto_patterns: vec![
                "**/package-lock.json".into(),
                "**/yarn.lock".into(),
                "**/pnpm-lock.yaml".into(),
                "**/bun.lockb".into(),
                "**/.editorconfig".into(),
                "**/.prettierrc*".into(),
            ],
            escalate_patterns: vec![
                "**/auth/**".into(),
                "**/security/**".into(),
                "**/*.key".into(),
                "**/*.pem".into(),
                "**/*password*".into(),
                "**/*token*".into(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged { summary: String },
    Escalated { conflicted_files: Vec<String> },
}

/// Outcome of handing the level-2 files to an AI resolver.
#[derive(Debug, Clone, Default)]
struct LayeredOutcome {
    resolved: Vec<String>,
    unresolved: Vec<String>,
}

pub struct MergeResolver {
    worktree: WorktreeManager,
    config: MergeResolverConfig,
    ai_resolver: Option<Arc<dyn Harness>>,
}

impl MergeResolver {
    pub fn new(worktree: WorktreeManager, config: MergeResolverConfig, ai_resolver: Option<Arc<dyn Harness>>) -> Self {
        Self {
            worktree,
            config,
            ai_resolver,
        }
    }

    fn classify(&self, path: &str) -> ResolutionLayer {
        classify_path(&self.config, path)
    }

    /// Parse the file list out of a `git merge` conflict message. Lines of
    /// interest look like `CONFLICT (content): Merge conflict in <path>`.
    fn conflicted_files(details: &str) -> Vec<String> {
        details
            .lines()
            .filter_map(|line| line.rsplit_once(" in "))
            .map(|(_, path)| path.trim().to_string())
            .collect()
    }

    /// Resolve level-1 files in place by taking trunk's side, staging them.
    /// Trunk is checked out before `merge_branch` runs, so in git's own
    /// terms trunk is `ours` and the incoming task branch is `theirs`.
    fn resolve_auto(&self, files: &[String]) -> Result<(), WorktreeError> {
        for file in files {
            let output = Command::new("git")
                .args(["checkout", "--ours", "--"])
                .arg(file)
                .current_dir(self.worktree.repo_path())
                .output()
                .map_err(|e| WorktreeError::GitCommand {
                    message: format!("failed to run git checkout --ours for {file}"),
                    source: e,
                })?;
            if !output.status.success() {
                continue;
            }
            let _ = Command::new("git")
                .args(["add", "--"])
                .arg(file)
                .current_dir(self.worktree.repo_path())
                .output();
        }
        Ok(())
    }

    async fn resolve_ai_assisted(&self, files: &[String]) -> LayeredOutcome {
        let mut outcome = LayeredOutcome::default();
        let Some(_resolver) = &self.ai_resolver else {
            outcome.unresolved = files.to_vec();
            return outcome;
        };
        // A real AI-assisted pass would spawn the harness headless with a
        // conflict-resolution prompt and parse back a resolved/unresolved
        // split. Without a live harness wired in here, treat every file as
        // unresolved so it correctly escalates rather than silently losing
        // changes.
        outcome.unresolved = files.to_vec();
        outcome
    }

    async fn run_layered_resolution(&self, conflicted_files: &[String]) -> (ResolutionLayer, Vec<String>) {
        let mut auto_files = Vec::new();
        let mut ai_files = Vec::new();
        let mut escalate_files = Vec::new();

        for file in conflicted_files {
            match self.classify(file) {
                ResolutionLayer::Auto => auto_files.push(file.clone()),
                ResolutionLayer::AiAssisted => ai_files.push(file.clone()),
                ResolutionLayer::Escalate => escalate_files.push(file.clone()),
            }
        }

        if !auto_files.is_empty() {
            let _ = self.resolve_auto(&auto_files);
        }

        if !ai_files.is_empty() {
            let ai_outcome = self.resolve_ai_assisted(&ai_files).await;
            escalate_files.extend(ai_outcome.unresolved);
        }

        if escalate_files.is_empty() {
            (ResolutionLayer::Auto, Vec::new())
        } else {
            (ResolutionLayer::Escalate, escalate_files)
        }
    }

    /// Checkout trunk, pull (best effort), merge the branch, and on success
    /// push and clean up. On conflict, run the layered resolution; if
    /// anything remains unresolved, abort the merge and leave the branch in
    /// place, recording a conflict record via `record`.
    pub async fn resolve_merge_request(
        &self,
        trunk_branch: &str,
        branch: &str,
        plan_id: Uuid,
        task_a_id: Uuid,
        task_b_id: Uuid,
        record: &dyn Fn(
            Uuid,
            Uuid,
            Uuid,
            Vec<String>,
            ConflictLayer,
            ConflictResolution,
            Option<String>,
        ) -> futures::future::BoxFuture<'static, anyhow::Result<()>>,
    ) -> anyhow::Result<MergeOutcome> {
        self.worktree.checkout(trunk_branch)?;
        let _ = Command::new("git")
            .arg("pull")
            .current_dir(self.worktree.repo_path())
            .output();

        match self.worktree.merge_branch(branch)? {
            MergeResult::Success => {
                let stat_output = Command::new("git")
                    .args(["diff", "--stat", "HEAD@{1}", "HEAD"])
                    .current_dir(self.worktree.repo_path())
                    .output();
                let summary = stat_output
                    .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
                    .unwrap_or_default();

                let _ = Command::new("git")
                    .args(["push", "origin", trunk_branch])
                    .current_dir(self.worktree.repo_path())
                    .output();
                let _ = self.worktree.delete_branch(branch);

                Ok(MergeOutcome::Merged { summary })
            }
            MergeResult::Conflict { details } => {
                let files = Self::conflicted_files(&details);
                let (layer, unresolved) = self.run_layered_resolution(&files).await;

                if unresolved.is_empty() {
                    // Everything staged by the auto layer; commit the merge.
                    let output = Command::new("git")
                        .args(["commit", "--no-edit"])
                        .current_dir(self.worktree.repo_path())
                        .output();
                    if output.map(|o| o.status.success()).unwrap_or(false) {
                        record(
                            plan_id,
                            task_a_id,
                            task_b_id,
                            files,
                            layer.into(),
                            ConflictResolution::Resolved,
                            Some(details),
                        )
                        .await?;
                        let _ = Command::new("git")
                            .args(["push", "origin", trunk_branch])
                            .current_dir(self.worktree.repo_path())
                            .output();
                        let _ = self.worktree.delete_branch(branch);
                        return Ok(MergeOutcome::Merged {
                            summary: "auto-resolved conflicting files".to_string(),
                        });
                    }
                }

                let _ = Command::new("git")
                    .args(["merge", "--abort"])
                    .current_dir(self.worktree.repo_path())
                    .output();

                record(
                    plan_id,
                    task_a_id,
                    task_b_id,
                    unresolved.clone(),
                    ConflictLayer::Escalated,
                    ConflictResolution::Unresolved,
                    Some(details),
                )
                .await?;

                Ok(MergeOutcome::Escalated {
                    conflicted_files: unresolved,
                })
            }
        }
    }
}

/// Classify a conflicted file path against the configured glob layers.
/// Escalate patterns win over auto patterns on overlap; anything matching
/// neither falls to the AI-assisted layer.
pub fn classify_path(config: &MergeResolverConfig, path: &str) -> ResolutionLayer {
    for pattern in &config.escalate_patterns {
        if Pattern::new(pattern).map(|p| p.matches(path)).unwrap_or(false) {
            return ResolutionLayer::Escalate;
        }
    }
    for pattern in &config.auto_patterns {
        if Pattern::new(pattern).map(|p| p.matches(path)).unwrap_or(false) {
            return ResolutionLayer::Auto;
        }
    }
    ResolutionLayer::AiAssisted
}
