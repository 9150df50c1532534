//! Pure scheduling policy over a [`TaskGraph`]'s ready set.
//!
//! Contains no I/O: given a graph snapshot, decides which task(s) should
//! run next. The [`crate::fleet::Fleet`] main loop is the only caller that
//! combines this with worker availability.

use crate::graph::{GraphTask, TaskGraph};

/// Which order ready tasks should be handed out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Lower `priority` value first; ties broken by insertion order.
    #[default]
    PriorityFirst,
    /// Tasks that unlock the most currently-pending dependents first; ties
    /// broken by [`SchedulingPolicy::PriorityFirst`] ordering.
    UnlockFirst,
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    policy: SchedulingPolicy,
}

impl Scheduler {
    pub fn new(policy: SchedulingPolicy) -> Self {
        Self { policy }
    }

    fn priority_sorted(&self, mut ready: Vec<GraphTask>) -> Vec<GraphTask> {
        ready.sort_by_key(|t| (t.priority, t.seq));
        ready
    }

    /// Number of currently-pending tasks that list `id` as a dependency.
    fn unlock_count(graph: &TaskGraph, id: &str) -> usize {
        graph
            .all()
            .into_iter()
            .filter(|t| {
                matches!(t.status, crate::graph::GraphStatus::Pending)
                    && t.dependencies.iter().any(|d| d == id)
            })
            .count()
    }

    fn unlock_sorted(&self, graph: &TaskGraph, ready: Vec<GraphTask>) -> Vec<GraphTask> {
        let mut scored: Vec<(usize, GraphTask)> = ready
            .into_iter()
            .map(|t| (Self::unlock_count(graph, &t.id), t))
            .collect();
        scored.sort_by(|(ua, a), (ub, b)| {
            ub.cmp(ua)
                .then(a.priority.cmp(&b.priority))
                .then(a.seq.cmp(&b.seq))
        });
        scored.into_iter().map(|(_, t)| t).collect()
    }

    fn ordered_ready(&self, graph: &TaskGraph) -> Vec<GraphTask> {
        let ready = graph.ready_set();
        match self.policy {
            SchedulingPolicy::PriorityFirst => self.priority_sorted(ready),
            SchedulingPolicy::UnlockFirst => self.unlock_sorted(graph, ready),
        }
    }

    /// A runnable subtask of an in-progress task, if any task has one whose
    /// own intra-task dependencies are satisfied. This is the "subtask fast
    /// path": finishing a parent's subtasks is preferred over starting a new
    /// top-level task, since it keeps a single worker's context warm.
    ///
    /// A subtask's `dependencies` refer to sibling subtask ids within the
    /// same parent; a dependency is satisfied once that sibling is
    /// `Completed`. A dependency id that isn't a sibling subtask is outside
    /// this fast path's concern (it's a top-level dependency, already
    /// enforced by the parent task's own readiness) and doesn't block here.
    fn next_subtask(&self, graph: &TaskGraph) -> Option<GraphTask> {
        let mut candidates: Vec<GraphTask> = Vec::new();
        for parent in graph.all() {
            if !matches!(parent.status, crate::graph::GraphStatus::Running) || parent.subtasks.is_empty() {
                continue;
            }
            for sub in &parent.subtasks {
                if !matches!(sub.status, crate::graph::GraphStatus::Pending) {
                    continue;
                }
                let deps_satisfied = sub.dependencies.iter().all(|dep| {
                    parent
                        .subtasks
                        .iter()
                        .find(|sibling| &sibling.id == dep)
                        .map(|sibling| matches!(sibling.status, crate::graph::GraphStatus::Completed))
                        .unwrap_or(true)
                });
                if deps_satisfied {
                    candidates.push(sub.clone());
                }
            }
        }
        candidates.sort_by_key(|t| (t.dependencies.len(), t.priority, t.seq));
        candidates.into_iter().next()
    }

    /// The single next task to assign, or `None` if nothing is ready.
    pub fn next(&self, graph: &TaskGraph) -> Option<GraphTask> {
        if let Some(sub) = self.next_subtask(graph) {
            return Some(sub);
        }
        self.ordered_ready(graph).into_iter().next()
    }

    /// Like [`Scheduler::next`], but skips any task whose id is in
    /// `excluded` -- used within a single `try_assign` tick to move on to
    /// the next candidate after a task fails to assign, without retrying
    /// the same broken task in a tight loop for the rest of the tick.
    pub fn next_excluding(&self, graph: &TaskGraph, excluded: &std::collections::HashSet<String>) -> Option<GraphTask> {
        self.schedule(graph).into_iter().find(|t| !excluded.contains(&t.id))
    }

    /// Up to `n` tasks, in the order they'd be assigned one at a time.
    pub fn batch(&self, graph: &TaskGraph, n: usize) -> Vec<GraphTask> {
        self.ordered_ready(graph).into_iter().take(n).collect()
    }

    /// The full current ready-set ordering (subtasks first, then top-level).
    pub fn schedule(&self, graph: &TaskGraph) -> Vec<GraphTask> {
        let mut out = Vec::new();
        if let Some(sub) = self.next_subtask(graph) {
            out.push(sub);
        }
        out.extend(self.ordered_ready(graph));
        out
    }
}
