//! Per-expert worker metrics.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Counters for one expert's executed tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionMetrics {
    pub dispatched: u64,
    pub completed: u64,
    /// Terminal failures only; retried attempts are counted separately.
    pub failed: u64,
    pub retried: u64,
    /// Executions whose lease was taken away before they could record a result.
    pub abandoned: u64,
    pub duration_ms: u64,
}

/// Live state of one expert as seen by the worker pool.
#[derive(Debug, Clone, Serialize)]
pub struct ExpertActivity {
    pub expert_id: Uuid,
    pub in_flight: Vec<Uuid>,
    pub metrics: ExecutionMetrics,
}

/// Tracks in-flight tasks and outcome counters for every expert the pool has
/// executed work for. Unassigned tasks are tracked under the nil id.
pub struct PoolMonitor {
    states: Arc<RwLock<HashMap<Uuid, ExpertActivity>>>,
}

impl PoolMonitor {
    /// Monitor with no recorded activity.
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Mark a task as started by an expert.
    pub async fn start_task(&self, expert_id: Option<Uuid>, task_id: Uuid) {
        let expert_id = expert_id.unwrap_or_else(Uuid::nil);
        let mut states = self.states.write().await;
        let state = states
            .entry(expert_id)
            .or_insert_with(|| ExpertActivity {
                expert_id,
                in_flight: Vec::new(),
                metrics: ExecutionMetrics::default(),
            });
        state.in_flight.push(task_id);
        state.metrics.dispatched += 1;
    }

    /// Counts a completed task and its duration.
    pub async fn record_completed(&self, expert_id: Option<Uuid>, task_id: Uuid, duration_ms: u64) {
        self.finish(expert_id, task_id, duration_ms, |m| m.completed += 1)
            .await;
    }

    /// Counts a task that failed for good.
    pub async fn record_failed(&self, expert_id: Option<Uuid>, task_id: Uuid, duration_ms: u64) {
        self.finish(expert_id, task_id, duration_ms, |m| m.failed += 1)
            .await;
    }

    /// Counts an attempt that will be retried.
    pub async fn record_retry(&self, expert_id: Option<Uuid>, task_id: Uuid, duration_ms: u64) {
        self.finish(expert_id, task_id, duration_ms, |m| m.retried += 1)
            .await;
    }

    /// Counts an attempt whose lease was lost.
    pub async fn record_abandoned(&self, expert_id: Option<Uuid>, task_id: Uuid, duration_ms: u64) {
        self.finish(expert_id, task_id, duration_ms, |m| m.abandoned += 1)
            .await;
    }

    async fn finish(
        &self,
        expert_id: Option<Uuid>,
        task_id: Uuid,
        duration_ms: u64,
        bump: impl FnOnce(&mut ExecutionMetrics),
    ) {
        let expert_id = expert_id.unwrap_or_else(Uuid::nil);
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&expert_id) {
            state.in_flight.retain(|id| *id != task_id);
            state.metrics.duration_ms += duration_ms;
            bump(&mut state.metrics);
        }
    }

    /// Number of tasks currently executing across all experts.
    pub async fn in_flight(&self) -> usize {
        let states = self.states.read().await;
        states.values().map(|s| s.in_flight.len()).sum()
    }

    /// Snapshot of all experts, ordered by id.
    pub async fn snapshot(&self) -> Vec<ExpertActivity> {
        let states = self.states.read().await;
        let mut all: Vec<ExpertActivity> = states.values().cloned().collect();
        all.sort_by_key(|s| s.expert_id);
        all
    }

    /// Activity of one expert.
    pub async fn get(&self, expert_id: Uuid) -> Option<ExpertActivity> {
        let states = self.states.read().await;
        states.get(&expert_id).cloned()
    }

    /// Totals across every expert.
    pub async fn aggregate(&self) -> ExecutionMetrics {
        let states = self.states.read().await;
        let mut total = ExecutionMetrics::default();
        for state in states.values() {
            total.dispatched += state.metrics.dispatched;
            total.completed += state.metrics.completed;
            total.failed += state.metrics.failed;
            total.retried += state.metrics.retried;
            total.abandoned += state.metrics.abandoned;
            total.duration_ms += state.metrics.duration_ms;
        }
        total
    }

    /// Per-expert and aggregate metrics as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let experts = self.snapshot().await;
        let aggregate = self.aggregate().await;
        serde_json::json!({
            "experts": experts,
            "aggregate": aggregate,
        })
    }
}

impl Default for PoolMonitor {
    fn default() -> Self {
        Self::new()
    }
}
