use crate::model::{BackendId, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for assignment or for a worker.
    Pending,
    /// Claimed by a worker; `updated_at` is the lease timestamp.
    InProgress,
    /// Finished with a validated result.
    Completed,
    /// Retry budget exhausted.
    Failed,
}

impl TaskStatus {
    /// Pending and in-progress tasks count toward an expert's load.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Completed and failed tasks never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work in the task store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub goal: String,
    pub status: TaskStatus,
    /// Category hint (coding, reasoning, ...). Inferred when absent.
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Goal this task was decomposed from.
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub assignee_expert_id: Option<Uuid>,
    #[serde(default)]
    pub backend_hint: Option<BackendId>,
    #[serde(default)]
    pub model_hint: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Threads every event from submission to the final outcome.
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Lease timestamp while in progress.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Token of the worker currently holding the lease.
    #[serde(default)]
    pub lease_id: Option<Uuid>,
    #[serde(default)]
    pub result: Option<String>,
    /// Failed execution attempts so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub estimated_duration_min: Option<u32>,
    /// Depth in the decomposition hierarchy (0 = submitted goal).
    #[serde(default)]
    pub depth: u32,
}

impl Task {
    /// Pending, unassigned task with a fresh correlation id.
    pub fn new(goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            status: TaskStatus::Pending,
            category: None,
            priority: Priority::Medium,
            parent_task_id: None,
            assignee_expert_id: None,
            backend_hint: None,
            model_hint: None,
            metadata: HashMap::new(),
            correlation_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            assigned_at: None,
            lease_id: None,
            result: None,
            attempts: 0,
            last_error: None,
            estimated_duration_min: None,
            depth: 0,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Sets the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Makes this task a child of `parent`, inheriting its correlation id.
    pub fn with_parent(mut self, parent: &Task) -> Self {
        self.parent_task_id = Some(parent.id);
        self.correlation_id = parent.correlation_id;
        self.depth = parent.depth + 1;
        self.priority = parent.priority;
        self
    }

    /// Sets the preferred backend.
    pub fn with_backend_hint(mut self, backend: BackendId) -> Self {
        self.backend_hint = Some(backend);
        self
    }

    /// Sets the preferred model.
    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    /// Sets one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_estimated_duration(mut self, minutes: u32) -> Self {
        self.estimated_duration_min = Some(minutes);
        self
    }

    /// Whether the orchestrator still has to assign this task.
    pub fn is_unassigned(&self) -> bool {
        self.status == TaskStatus::Pending && self.assignee_expert_id.is_none()
    }

    /// Seconds since the last lease renewal.
    pub fn lease_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.updated_at).num_seconds()
    }
}

/// Kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Ordering declared between sibling subtasks.
    Sequence,
    /// A decomposed goal waits for one of its subtasks before synthesis.
    Subtask,
}

/// Dependency edge: `child_task_id` may not run before `parent_task_id`
/// is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub parent_task_id: Uuid,
    pub child_task_id: Uuid,
    pub kind: DependencyKind,
}

impl Dependency {
    /// `dependent` waits for `prerequisite`.
    pub fn new(prerequisite: Uuid, dependent: Uuid, kind: DependencyKind) -> Self {
        Self {
            parent_task_id: prerequisite,
            child_task_id: dependent,
            kind,
        }
    }
}
