//! Task store contract and an in-memory implementation.
//!
//! The store is the single source of truth for task status. Every status
//! change goes through [`TaskStore::transition`], which applies a patch only
//! if the row still matches the caller's expectation, the same contract as
//! `UPDATE tasks SET ... WHERE id = ? AND status = <expected>`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleet_core::{Assignment, Dependency, FleetError, FleetResult, Task, TaskStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use uuid::Uuid;

/// Which assignee a listing should match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AssigneeFilter {
    #[default]
    Any,
    Unassigned,
    Assigned,
    Expert(Uuid),
}

/// Listing filter. Results are ordered oldest first.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub assignee: AssigneeFilter,
    pub parent: Option<Uuid>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Pending tasks nobody has been assigned to yet.
    pub fn unassigned() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            assignee: AssigneeFilter::Unassigned,
            ..Self::default()
        }
    }

    /// Tasks in `status`.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Tasks whose parent is `parent`.
    pub fn children_of(parent: Uuid) -> Self {
        Self {
            parent: Some(parent),
            ..Self::default()
        }
    }

    /// Restricts to one assignee.
    pub fn for_expert(mut self, expert_id: Uuid) -> Self {
        self.assignee = AssigneeFilter::Expert(expert_id);
        self
    }

    /// Caps the number of rows returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if self.parent.is_some() && self.parent != task.parent_task_id {
            return false;
        }
        match self.assignee {
            AssigneeFilter::Any => true,
            AssigneeFilter::Unassigned => task.assignee_expert_id.is_none(),
            AssigneeFilter::Assigned => task.assignee_expert_id.is_some(),
            AssigneeFilter::Expert(id) => task.assignee_expert_id == Some(id),
        }
    }
}

/// Preconditions for an optimistic transition.
#[derive(Debug, Clone, Copy)]
pub struct Expect {
    pub status: TaskStatus,
    /// Lease token the row must still carry.
    pub lease_id: Option<Uuid>,
    /// The lease must be older than this instant.
    pub lease_older_than: Option<DateTime<Utc>>,
}

impl Expect {
    /// A row in `status`, whatever its lease.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status,
            lease_id: None,
            lease_older_than: None,
        }
    }

    /// An in-progress row still leased to `lease_id`.
    pub fn leased(lease_id: Uuid) -> Self {
        Self {
            status: TaskStatus::InProgress,
            lease_id: Some(lease_id),
            lease_older_than: None,
        }
    }

    /// An in-progress row whose lease was last renewed before `cutoff`.
    pub fn stale_since(cutoff: DateTime<Utc>) -> Self {
        Self {
            status: TaskStatus::InProgress,
            lease_id: None,
            lease_older_than: Some(cutoff),
        }
    }

    fn holds(&self, task: &Task) -> bool {
        task.status == self.status
            && self.lease_id.map_or(true, |id| task.lease_id == Some(id))
            && self
                .lease_older_than
                .map_or(true, |cutoff| task.updated_at < cutoff)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum LeaseChange {
    #[default]
    Keep,
    Set(Uuid),
    Clear,
}

/// Changes applied by a successful transition.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    status: Option<TaskStatus>,
    result: Option<String>,
    last_error: Option<String>,
    bump_attempts: bool,
    touch: bool,
    lease: LeaseChange,
    metadata: Vec<(String, serde_json::Value)>,
}

impl TaskPatch {
    /// Moves to `status` and renews `updated_at`.
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            touch: true,
            ..Self::default()
        }
    }

    /// Renews `updated_at` only.
    pub fn heartbeat() -> Self {
        Self {
            touch: true,
            ..Self::default()
        }
    }

    /// Stores the result text.
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    /// Stores the last error.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Counts one more attempt.
    pub fn bump_attempts(mut self) -> Self {
        self.bump_attempts = true;
        self
    }

    /// Installs a lease token.
    pub fn with_lease(mut self, lease_id: Uuid) -> Self {
        self.lease = LeaseChange::Set(lease_id);
        self
    }

    /// Removes the lease token.
    pub fn clear_lease(mut self) -> Self {
        self.lease = LeaseChange::Clear;
        self
    }

    /// Sets one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    fn apply(self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(error) = self.last_error {
            task.last_error = Some(error);
        }
        if self.bump_attempts {
            task.attempts += 1;
        }
        if self.touch {
            task.updated_at = now;
        }
        match self.lease {
            LeaseChange::Keep => {}
            LeaseChange::Set(id) => task.lease_id = Some(id),
            LeaseChange::Clear => task.lease_id = None,
        }
        for (key, value) in self.metadata {
            task.metadata.insert(key, value);
        }
    }
}

/// Per-expert figures derived from task rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpertStats {
    /// Pending plus in-progress tasks assigned to the expert.
    pub active: u32,
    /// Completed tasks in the recent window.
    pub completed: u32,
    /// Failed tasks in the recent window.
    pub failed: u32,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

impl ExpertStats {
    /// Success ratio over the recent window, `None` without history.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.completed + self.failed;
        (total > 0).then(|| f64::from(self.completed) / f64::from(total))
    }
}

/// Window used for the "recent" success rate.
pub const SUCCESS_WINDOW_DAYS: i64 = 30;

/// Persistence for tasks and their dependency edges.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Adds a new row. Fails if the id exists.
    async fn insert(&self, task: Task) -> FleetResult<()>;

    async fn get(&self, id: Uuid) -> FleetResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> FleetResult<Vec<Task>>;

    /// Pending, assigned tasks whose dependencies are all completed,
    /// highest priority first, then oldest.
    async fn runnable(&self, limit: usize) -> FleetResult<Vec<Task>>;

    /// Applies `patch` only if the row still satisfies `expect`. Returns the
    /// updated row, or `None` when the precondition no longer held.
    async fn transition(&self, id: Uuid, expect: Expect, patch: TaskPatch)
        -> FleetResult<Option<Task>>;

    /// Writes an assignment onto a pending row whose assignee is still
    /// `expected_assignee`. Returns whether the write happened.
    async fn assign(
        &self,
        assignment: &Assignment,
        expected_assignee: Option<Uuid>,
    ) -> FleetResult<bool>;

    /// Appends a dependency edge. Rejects edges to unknown tasks and edges
    /// that would close a cycle.
    async fn add_dependency(&self, dependency: Dependency) -> FleetResult<()>;

    /// Edges whose `child_task_id` is `id`.
    async fn dependencies_of(&self, id: Uuid) -> FleetResult<Vec<Dependency>>;

    /// Edges whose `parent_task_id` is `id`: the tasks waiting on it.
    async fn dependents_of(&self, id: Uuid) -> FleetResult<Vec<Dependency>>;

    /// Per-expert load and recent outcomes.
    async fn expert_stats(&self) -> FleetResult<HashMap<Uuid, ExpertStats>>;
}

/// Serializable dump of a store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub tasks: Vec<Task>,
    pub dependencies: Vec<Dependency>,
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<Uuid, Task>,
    dependencies: Vec<Dependency>,
}

impl StoreState {
    fn is_runnable(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending
            && task.assignee_expert_id.is_some()
            && self
                .dependencies
                .iter()
                .filter(|d| d.child_task_id == task.id)
                .all(|d| {
                    self.tasks
                        .get(&d.parent_task_id)
                        .is_some_and(|p| p.status == TaskStatus::Completed)
                })
    }

    /// Whether `target` can be reached from `from` along prerequisite →
    /// dependent edges.
    fn reaches(&self, from: Uuid, target: Uuid) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == target {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            stack.extend(
                self.dependencies
                    .iter()
                    .filter(|d| d.parent_task_id == node)
                    .map(|d| d.child_task_id),
            );
        }
        false
    }
}

/// Process-local task store with JSON snapshot persistence.
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: RwLock<StoreState>,
}

impl InMemoryTaskStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded from a snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let tasks = snapshot.tasks.into_iter().map(|t| (t.id, t)).collect();
        Self {
            state: RwLock::new(StoreState {
                tasks,
                dependencies: snapshot.dependencies,
            }),
        }
    }

    /// Copy of every row and edge.
    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        StoreSnapshot {
            tasks,
            dependencies: state.dependencies.clone(),
        }
    }

    /// Writes the snapshot as pretty JSON.
    pub async fn save(&self, path: &Path) -> FleetResult<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Loads a snapshot file; a missing file yields an empty store.
    pub async fn load(path: &Path) -> FleetResult<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let snapshot: StoreSnapshot = serde_json::from_str(&data)
            .map_err(|e| FleetError::Store(format!("Failed to parse task snapshot: {e}")))?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of tasks per status.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.state.read().tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: Task) -> FleetResult<()> {
        let mut state = self.state.write();
        if state.tasks.contains_key(&task.id) {
            return Err(FleetError::Store(format!("task {} already exists", task.id)));
        }
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> FleetResult<Option<Task>> {
        Ok(self.state.read().tasks.get(&id).cloned())
    }

    async fn list(&self, filter: &TaskFilter) -> FleetResult<Vec<Task>> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn runnable(&self, limit: usize) -> FleetResult<Vec<Task>> {
        let state = self.state.read();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| state.is_runnable(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.priority, t.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn transition(
        &self,
        id: Uuid,
        expect: Expect,
        patch: TaskPatch,
    ) -> FleetResult<Option<Task>> {
        let mut state = self.state.write();
        let Some(task) = state.tasks.get_mut(&id) else {
            return Err(FleetError::Store(format!("task {id} not found")));
        };
        if !expect.holds(task) {
            return Ok(None);
        }
        patch.apply(task, Utc::now());
        Ok(Some(task.clone()))
    }

    async fn assign(
        &self,
        assignment: &Assignment,
        expected_assignee: Option<Uuid>,
    ) -> FleetResult<bool> {
        let mut state = self.state.write();
        let Some(task) = state.tasks.get_mut(&assignment.task_id) else {
            return Err(FleetError::Store(format!(
                "task {} not found",
                assignment.task_id
            )));
        };
        if task.status != TaskStatus::Pending || task.assignee_expert_id != expected_assignee {
            return Ok(false);
        }
        task.assignee_expert_id = Some(assignment.expert_id);
        if assignment.backend_hint.is_some() {
            task.backend_hint = assignment.backend_hint;
        }
        if assignment.model_hint.is_some() {
            task.model_hint.clone_from(&assignment.model_hint);
        }
        task.assigned_at = Some(Utc::now());
        Ok(true)
    }

    async fn add_dependency(&self, dependency: Dependency) -> FleetResult<()> {
        let mut state = self.state.write();
        for id in [dependency.parent_task_id, dependency.child_task_id] {
            if !state.tasks.contains_key(&id) {
                return Err(FleetError::Store(format!(
                    "dependency references unknown task {id}"
                )));
            }
        }
        if state.dependencies.contains(&dependency) {
            return Ok(());
        }
        if state.reaches(dependency.child_task_id, dependency.parent_task_id) {
            return Err(FleetError::Store(format!(
                "dependency {} -> {} would create a cycle",
                dependency.parent_task_id, dependency.child_task_id
            )));
        }
        state.dependencies.push(dependency);
        Ok(())
    }

    async fn dependencies_of(&self, id: Uuid) -> FleetResult<Vec<Dependency>> {
        Ok(self
            .state
            .read()
            .dependencies
            .iter()
            .filter(|d| d.child_task_id == id)
            .copied()
            .collect())
    }

    async fn dependents_of(&self, id: Uuid) -> FleetResult<Vec<Dependency>> {
        Ok(self
            .state
            .read()
            .dependencies
            .iter()
            .filter(|d| d.parent_task_id == id)
            .copied()
            .collect())
    }

    async fn expert_stats(&self) -> FleetResult<HashMap<Uuid, ExpertStats>> {
        let since = Utc::now() - ChronoDuration::days(SUCCESS_WINDOW_DAYS);
        let state = self.state.read();
        let mut stats: HashMap<Uuid, ExpertStats> = HashMap::new();
        for task in state.tasks.values() {
            let Some(expert) = task.assignee_expert_id else {
                continue;
            };
            let entry = stats.entry(expert).or_default();
            match task.status {
                TaskStatus::Pending | TaskStatus::InProgress => entry.active += 1,
                TaskStatus::Completed if task.updated_at >= since => entry.completed += 1,
                TaskStatus::Failed if task.updated_at >= since => entry.failed += 1,
                _ => {}
            }
            if task.assigned_at > entry.last_assigned_at {
                entry.last_assigned_at = task.assigned_at;
            }
        }
        Ok(stats)
    }
}
