//! In-memory task dependency graph.
//!
//! Distinct from the Postgres-backed `tasks`/`task_dependencies` tables the
//! plan orchestrator queries directly: this graph is loaded once from a
//! tasks file (or from the DB, via [`TaskGraph::from_tasks`]) and then lives
//! entirely in memory for the lifetime of a fleet run, so the scheduler can
//! make assignment decisions without round-tripping to the database on
//! every tick.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status of a task within the in-memory graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A task node in the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphTask {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    pub status: GraphStatus,
    #[serde(default)]
    pub assigned_worker: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<GraphTask>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Insertion order, used as the final tie-breaker so otherwise-equal
    /// tasks schedule in the order they were added.
    #[serde(default)]
    pub seq: u64,
}

impl GraphTask {
    /// Construct a new pending task with no dependencies.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            dependencies: Vec::new(),
            priority: 0,
            status: GraphStatus::Pending,
            assigned_worker: None,
            error: None,
            subtasks: Vec::new(),
            created_at: Utc::now(),
            seq: 0,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Errors raised by graph mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("task {0:?} already exists in the graph")]
    DuplicateId(String),
    #[error("task {0:?} depends on unknown task {1:?}")]
    UnknownDependency(String, String),
    #[error("task {0:?} not found")]
    NotFound(String),
    #[error("task {0:?} is not running, cannot transition")]
    NotRunning(String),
    #[error("graph contains a dependency cycle")]
    CyclicGraph,
}

/// Aggregate counts over the graph, by status.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub total: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// The in-memory task dependency graph.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<String, GraphTask>,
    next_seq: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single task. Dependencies must already be present in the graph.
    pub fn add(&mut self, mut task: GraphTask) -> Result<(), GraphError> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateId(task.id));
        }
        for dep in &task.dependencies {
            if !self.tasks.contains_key(dep) {
                return Err(GraphError::UnknownDependency(task.id.clone(), dep.clone()));
            }
        }
        task.seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Add many tasks at once, resolving dependencies against each other
    /// regardless of insertion order within the batch.
    pub fn add_many(&mut self, tasks: Vec<GraphTask>) -> Result<(), GraphError> {
        let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in &tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep) && !self.tasks.contains_key(dep) {
                    return Err(GraphError::UnknownDependency(task.id.clone(), dep.clone()));
                }
            }
        }
        for task in tasks {
            if self.tasks.contains_key(&task.id) {
                return Err(GraphError::DuplicateId(task.id));
            }
            let mut task = task;
            task.seq = self.next_seq;
            self.next_seq += 1;
            self.tasks.insert(task.id.clone(), task);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<GraphTask> {
        self.tasks.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn dependencies_satisfied(&self, task: &GraphTask) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|t| t.status == GraphStatus::Completed)
                .unwrap_or(false)
        })
    }

    pub fn mark_running(&mut self, id: &str, worker_id: &str) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(id).ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        task.status = GraphStatus::Running;
        task.assigned_worker = Some(worker_id.to_string());
        task.error = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, id: &str) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(id).ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        if task.status != GraphStatus::Running {
            return Err(GraphError::NotRunning(id.to_string()));
        }
        task.status = GraphStatus::Completed;
        task.assigned_worker = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, id: &str, error: String) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(id).ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        task.status = GraphStatus::Failed;
        task.assigned_worker = None;
        task.error = Some(error);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, id: &str) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(id).ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        task.status = GraphStatus::Cancelled;
        task.assigned_worker = None;
        Ok(())
    }

    /// Reset a task back to `Pending`, e.g. for a resume after the worker
    /// that held it vanished without reporting a result.
    pub fn reset_to_pending(&mut self, id: &str) -> Result<(), GraphError> {
        let task = self.tasks.get_mut(id).ok_or_else(|| GraphError::NotFound(id.to_string()))?;
        task.status = GraphStatus::Pending;
        task.assigned_worker = None;
        Ok(())
    }

    /// Tasks whose status is `Pending` and every dependency is `Completed`.
    /// Returns owned clones: callers cannot mutate graph state through the
    /// returned values.
    pub fn ready_set(&self) -> Vec<GraphTask> {
        self.tasks
            .values()
            .filter(|t| t.status == GraphStatus::Pending && self.dependencies_satisfied(t))
            .cloned()
            .collect()
    }

    /// Detect a dependency cycle via DFS with a three-color marking.
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            self.tasks.keys().map(|k| (k.as_str(), Color::White)).collect();

        fn visit<'a>(
            id: &'a str,
            tasks: &'a HashMap<String, GraphTask>,
            colors: &mut HashMap<&'a str, Color>,
        ) -> bool {
            match colors.get(id) {
                Some(Color::Black) => return false,
                Some(Color::Grey) => return true,
                _ => {}
            }
            colors.insert(id, Color::Grey);
            if let Some(task) = tasks.get(id) {
                for dep in &task.dependencies {
                    if visit(dep, tasks, colors) {
                        return true;
                    }
                }
            }
            colors.insert(id, Color::Black);
            false
        }

        for id in self.tasks.keys() {
            if colors.get(id.as_str()) == Some(&Color::White) && visit(id, &self.tasks, &mut colors) {
                return true;
            }
        }
        false
    }

    /// Return tasks in dependency order (dependencies before dependents).
    /// Does not itself check for cycles; call [`Self::has_cycle`] first.
    pub fn topological_order(&self) -> Result<Vec<GraphTask>, GraphError> {
        if self.has_cycle() {
            return Err(GraphError::CyclicGraph);
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::with_capacity(self.tasks.len());

        fn visit(
            id: &str,
            tasks: &HashMap<String, GraphTask>,
            visited: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) {
            if visited.contains(id) {
                return;
            }
            visited.insert(id.to_string());
            if let Some(task) = tasks.get(id) {
                for dep in &task.dependencies {
                    visit(dep, tasks, visited, order);
                }
            }
            order.push(id.to_string());
        }

        let mut ids: Vec<&String> = self.tasks.keys().collect();
        ids.sort_by_key(|id| self.tasks[*id].seq);
        for id in ids {
            visit(id, &self.tasks, &mut visited, &mut order);
        }

        Ok(order
            .into_iter()
            .filter_map(|id| self.tasks.get(&id).cloned())
            .collect())
    }

    pub fn stats(&self) -> GraphStats {
        let mut stats = GraphStats {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in self.tasks.values() {
            match task.status {
                GraphStatus::Pending => stats.pending += 1,
                GraphStatus::Ready => stats.ready += 1,
                GraphStatus::Running => stats.running += 1,
                GraphStatus::Completed => stats.completed += 1,
                GraphStatus::Failed => stats.failed += 1,
                GraphStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// All tasks, as owned clones, sorted by insertion order.
    pub fn all(&self) -> Vec<GraphTask> {
        let mut tasks: Vec<GraphTask> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }
}

/// Derive a stable UUID from a graph task id that may not itself be one
/// (fleet task ids are free-form strings, e.g. loaded from a tasks file).
/// The same id always maps to the same UUID, so it can key rows in tables
/// that require a UUID (e.g. `conflict_records`) without forcing every
/// tasks-file author to mint real UUIDs.
pub fn task_uuid(id: &str) -> uuid::Uuid {
    uuid::Uuid::parse_str(id).unwrap_or_else(|_| uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, id.as_bytes()))
}

/// Map the spec's original tasks-JSON priority strings onto numeric
/// priorities (lower is more urgent, matching [`GraphTask::priority`]).
pub fn priority_from_label(label: &str) -> i64 {
    match label {
        "high" => 1,
        "medium" => 3,
        "low" => 5,
        other => other.parse().unwrap_or(3),
    }
}

/// Map the spec's original tasks-JSON status strings onto [`GraphStatus`].
pub fn status_from_label(label: &str) -> GraphStatus {
    match label {
        "pending" | "deferred" => GraphStatus::Pending,
        "in-progress" | "in_progress" => GraphStatus::Running,
        "done" => GraphStatus::Completed,
        "blocked" | "failed" => GraphStatus::Failed,
        "cancelled" => GraphStatus::Cancelled,
        _ => GraphStatus::Pending,
    }
}

/// One entry in the spec's original tasks-JSON interop format:
/// `{id, title, description, dependencies, priority, status, subtasks?}`,
/// where `priority` may be a label or a raw number and `status` is a label.
#[derive(Debug, Deserialize)]
struct TasksJsonEntry {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    priority: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    subtasks: Vec<TasksJsonEntry>,
}

fn entry_into_task(entry: TasksJsonEntry) -> GraphTask {
    let priority = match entry.priority {
        Some(serde_json::Value::String(s)) => priority_from_label(&s),
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(3),
        _ => 3,
    };
    let status = entry
        .status
        .as_deref()
        .map(status_from_label)
        .unwrap_or(GraphStatus::Pending);

    let mut task = GraphTask::new(entry.id, entry.title)
        .with_dependencies(entry.dependencies)
        .with_priority(priority);
    task.description = entry.description;
    task.status = status;
    task.subtasks = entry.subtasks.into_iter().map(entry_into_task).collect();
    task
}

/// Parse the spec's original tasks-JSON interop format (a JSON array of
/// tasks) into graph-ready [`GraphTask`]s, applying the priority and status
/// label maps exactly as the original tool's format expects.
pub fn from_tasks_json(body: &str) -> Result<Vec<GraphTask>, serde_json::Error> {
    let entries: Vec<TasksJsonEntry> = serde_json::from_str(body)?;
    Ok(entries.into_iter().map(entry_into_task).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> GraphTask {
        GraphTask::new(id, id).with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", &[])).unwrap();
        graph.add(task("b", &["a"])).unwrap();

        let ready: Vec<String> = graph.ready_set().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["a".to_string()]);

        graph.mark_running("a", "w1").unwrap();
        graph.mark_completed("a").unwrap();

        let ready: Vec<String> = graph.ready_set().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["b".to_string()]);
    }

    #[test]
    fn from_tasks_json_applies_priority_and_status_labels() {
        let body = r#"[
            {"id": "a", "title": "Task A", "priority": "high", "status": "in-progress"},
            {"id": "b", "title": "Task B", "dependencies": ["a"], "description": "depends on a"}
        ]"#;
        let tasks = from_tasks_json(body).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].priority, 1);
        assert_eq!(tasks[0].status, GraphStatus::Running);
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
        assert_eq!(tasks[1].description, "depends on a");
        assert_eq!(tasks[1].status, GraphStatus::Pending);
    }

    #[test]
    fn from_tasks_json_parses_nested_subtasks() {
        let body = r#"[
            {"id": "a", "title": "Task A", "subtasks": [
                {"id": "a.1", "title": "Subtask"}
            ]}
        ]"#;
        let tasks = from_tasks_json(body).unwrap();
        assert_eq!(tasks[0].subtasks.len(), 1);
        assert_eq!(tasks[0].subtasks[0].id, "a.1");
    }

    #[test]
    fn task_uuid_is_stable_for_non_uuid_ids() {
        let a = task_uuid("task-a");
        let b = task_uuid("task-a");
        assert_eq!(a, b);
        assert_ne!(a, task_uuid("task-b"));
    }

    #[test]
    fn task_uuid_parses_real_uuids_unchanged() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(task_uuid(&id.to_string()), id);
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", &[])).unwrap();
        assert_eq!(graph.add(task("a", &[])), Err(GraphError::DuplicateId("a".into())));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let mut graph = TaskGraph::new();
        let err = graph.add(task("a", &["missing"])).unwrap_err();
        assert_eq!(err, GraphError::UnknownDependency("a".into(), "missing".into()));
    }

    #[test]
    fn cycle_detection() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", &[])).unwrap();
        graph.add(task("b", &["a"])).unwrap();
        // Introduce a cycle by hand: b now also (transitively) depends on
        // a task that depends on b.
        graph.add(task("c", &["b"])).unwrap();
        {
            let b = graph.tasks.get_mut("b").unwrap();
            b.dependencies.push("c".to_string());
        }
        assert!(graph.has_cycle());
        assert_eq!(graph.topological_order().unwrap_err(), GraphError::CyclicGraph);
    }

    #[test]
    fn topological_order_is_stable_for_diamond() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", &[])).unwrap();
        graph.add(task("b", &["a"])).unwrap();
        graph.add(task("c", &["a"])).unwrap();
        graph.add(task("d", &["b", "c"])).unwrap();

        let order: Vec<String> = graph.topological_order().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(order.first(), Some(&"a".to_string()));
        assert_eq!(order.last(), Some(&"d".to_string()));
    }

    #[test]
    fn mark_completed_requires_running() {
        let mut graph = TaskGraph::new();
        graph.add(task("a", &[])).unwrap();
        assert_eq!(graph.mark_completed("a"), Err(GraphError::NotRunning("a".into())));
    }

    #[test]
    fn priority_and_status_label_mapping() {
        assert_eq!(priority_from_label("high"), 1);
        assert_eq!(priority_from_label("medium"), 3);
        assert_eq!(priority_from_label("low"), 5);
        assert!(matches!(status_from_label("done"), GraphStatus::Completed));
        assert!(matches!(status_from_label("blocked"), GraphStatus::Failed));
    }
}
