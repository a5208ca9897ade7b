//! Worker pool: pulls runnable tasks, leases them, and drives each one
//! through the backend router until it completes, goes back for a retry,
//! or fails for good.
//!
//! Claiming is optimistic. A worker only owns a task once its
//! `Pending -> InProgress` transition succeeds, and from then on every write
//! it makes is conditioned on the lease token it installed. A heartbeat
//! renews the lease while the backend call is in flight; the reaper hands
//! tasks whose lease went quiet back to the queue.

use crate::analyzer::GENERAL_CATEGORY;
use crate::engine::TITLE_KEY;
use crate::monitor::PoolMonitor;
use crate::store::{Expect, TaskFilter, TaskPatch, TaskStore};
use chrono::{Duration as ChronoDuration, Utc};
use fleet_backends::{ModelGateway, OverflowPolicy, RouteRequest, RouteResponse};
use fleet_core::config::WorkerConfig;
use fleet_core::events::{emit, FleetEvent};
use fleet_core::{BackendId, DependencyKind, FleetError, FleetResult, Priority, Task, TaskStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata key counting how often the reaper reclaimed a task.
pub const LEASE_RECOVERIES_KEY: &str = "lease_recoveries";
/// Metadata key recording the backend that produced a task's result.
pub const BACKEND_KEY: &str = "backend";
/// Metadata key recording the model that produced a task's result.
pub const MODEL_KEY: &str = "model_used";

/// Backend and model a group of tasks is expected to land on.
pub type TargetKey = (Option<BackendId>, Option<String>);

/// What happened to one executed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    /// The attempt failed and the task is pending again.
    Retrying,
    /// The retry limit was reached.
    Failed,
    /// Another actor changed the task first; nothing was written.
    LeaseLost,
}

/// Summary of one polling pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub runnable: usize,
    pub groups: usize,
    pub claimed: usize,
    /// Tasks another worker claimed between the read and the claim.
    pub lost_claims: usize,
    /// The pool ran out of permits before every runnable task was claimed.
    pub saturated: bool,
}

/// Bounded pool of task executors sharing one semaphore.
pub struct WorkerPool {
    store: Arc<dyn TaskStore>,
    gateway: Arc<dyn ModelGateway>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    monitor: Arc<PoolMonitor>,
}

impl WorkerPool {
    /// Pool sized by `config.max_concurrent`.
    pub fn new(
        store: Arc<dyn TaskStore>,
        gateway: Arc<dyn ModelGateway>,
        config: WorkerConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            gateway,
            config,
            permits,
            monitor: Arc::new(PoolMonitor::new()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Per-expert metrics of this pool.
    pub fn monitor(&self) -> &Arc<PoolMonitor> {
        &self.monitor
    }

    /// Permits not held by an executing task.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Groups tasks by the backend and model the gateway would send them to,
    /// keeping the store's priority order inside each group.
    pub fn group_by_target(&self, tasks: Vec<Task>) -> BTreeMap<TargetKey, Vec<Task>> {
        let mut groups: BTreeMap<TargetKey, Vec<Task>> = BTreeMap::new();
        for task in tasks {
            let request = self.request_for(&task, String::new());
            let key = match self.gateway.resolve_target(&request) {
                Some(candidate) => (Some(candidate.backend), candidate.model),
                None => (task.backend_hint, task.model_hint.clone()),
            };
            groups.entry(key).or_default().push(task);
        }
        groups
    }

    /// Claims as many runnable tasks as there are free permits and starts
    /// executing them. Returns the handles of the started executions.
    pub async fn poll_once(
        self: &Arc<Self>,
    ) -> FleetResult<(PollReport, Vec<JoinHandle<ExecutionOutcome>>)> {
        let mut report = PollReport::default();
        let available = self.permits.available_permits();
        if available == 0 {
            report.saturated = true;
            return Ok((report, Vec::new()));
        }

        let runnable = self.store.runnable(available).await?;
        report.runnable = runnable.len();
        let groups = self.group_by_target(runnable);
        report.groups = groups.len();

        let mut handles = Vec::new();
        'groups: for ((backend, model), tasks) in groups {
            debug!(
                backend = ?backend,
                model = model.as_deref().unwrap_or("auto"),
                tasks = tasks.len(),
                "Dispatching task group"
            );
            for task in tasks {
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    report.saturated = true;
                    break 'groups;
                };
                match self.claim(&task).await {
                    Ok(Some(leased)) => {
                        report.claimed += 1;
                        let pool = Arc::clone(self);
                        handles.push(tokio::spawn(async move {
                            let _permit = permit;
                            pool.execute(leased).await
                        }));
                    }
                    Ok(None) => report.lost_claims += 1,
                    Err(e) => warn!(task_id = %task.id, error = %e, "Claim failed"),
                }
            }
        }
        Ok((report, handles))
    }

    /// One polling pass that waits for every started execution.
    pub async fn run_once(self: &Arc<Self>) -> FleetResult<Vec<ExecutionOutcome>> {
        let (_, handles) = self.poll_once().await?;
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "Task execution panicked"),
            }
        }
        Ok(outcomes)
    }

    /// Moves a pending task to in-progress under a fresh lease. `None` means
    /// another worker got there first.
    pub async fn claim(&self, task: &Task) -> FleetResult<Option<Task>> {
        let lease = Uuid::new_v4();
        self.store
            .transition(
                task.id,
                Expect::status(TaskStatus::Pending),
                TaskPatch::to(TaskStatus::InProgress).with_lease(lease),
            )
            .await
    }

    /// Executes a task this worker holds the lease for and records the
    /// outcome under that lease.
    pub async fn execute(&self, task: Task) -> ExecutionOutcome {
        let Some(lease) = task.lease_id else {
            warn!(task_id = %task.id, "Refusing to execute a task without a lease");
            return ExecutionOutcome::LeaseLost;
        };
        let started = Instant::now();
        self.monitor
            .start_task(task.assignee_expert_id, task.id)
            .await;

        let heartbeat = self.spawn_heartbeat(task.id, lease);
        let (backend, result) = self.call_backend(&task).await;
        heartbeat.abort();

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match result {
            Ok(response) => self.complete(&task, lease, response, elapsed_ms).await,
            Err(error) => self.fail(&task, lease, backend, error, elapsed_ms).await,
        }
    }

    async fn call_backend(
        &self,
        task: &Task,
    ) -> (Option<BackendId>, FleetResult<RouteResponse>) {
        let prompt = match self.build_prompt(task).await {
            Ok(prompt) => prompt,
            Err(e) => return (task.backend_hint, Err(e)),
        };
        let request = self.request_for(task, prompt);
        let target = self.gateway.resolve_target(&request);
        let target_backend = target.as_ref().map(|c| c.backend).or(task.backend_hint);
        emit(&FleetEvent::Dispatched {
            task_id: task.id,
            correlation_id: task.correlation_id,
            backend: target_backend,
            model: target
                .and_then(|c| c.model)
                .or_else(|| task.model_hint.clone()),
        });

        let deadline = self.config.call_deadline();
        let response = match tokio::time::timeout(deadline, self.gateway.call(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return (e.backend().or(target_backend), Err(e)),
            Err(_) => {
                let error = match target_backend {
                    Some(backend) => FleetError::Timeout {
                        backend,
                        after: deadline,
                    },
                    None => FleetError::AllBackendsExhausted {
                        last_backend: None,
                        attempts: 0,
                        last_error: format!("no answer within {deadline:?}"),
                    },
                };
                return (target_backend, Err(error));
            }
        };

        match validate_result(&response.text, self.config.min_result_chars) {
            Ok(()) => (Some(response.backend), Ok(response)),
            Err(e) => (Some(response.backend), Err(e)),
        }
    }

    async fn complete(
        &self,
        task: &Task,
        lease: Uuid,
        response: RouteResponse,
        elapsed_ms: u64,
    ) -> ExecutionOutcome {
        let patch = TaskPatch::to(TaskStatus::Completed)
            .with_result(response.text)
            .clear_lease()
            .with_metadata(BACKEND_KEY, serde_json::json!(response.backend))
            .with_metadata(MODEL_KEY, serde_json::json!(response.model_used));

        match self.store.transition(task.id, Expect::leased(lease), patch).await {
            Ok(Some(row)) => {
                info!(
                    task_id = %task.id,
                    correlation_id = %task.correlation_id,
                    backend = %response.backend,
                    model = %response.model_used,
                    memoized = response.memoized,
                    elapsed_ms,
                    "Task completed"
                );
                emit(&FleetEvent::Outcome {
                    task_id: task.id,
                    correlation_id: task.correlation_id,
                    status: row.status,
                    attempts: row.attempts,
                    backend: Some(response.backend),
                    error: None,
                });
                self.monitor
                    .record_completed(task.assignee_expert_id, task.id, elapsed_ms)
                    .await;
                ExecutionOutcome::Completed
            }
            Ok(None) => self.lease_lost(task, elapsed_ms).await,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to record result");
                self.lease_lost(task, elapsed_ms).await
            }
        }
    }

    async fn fail(
        &self,
        task: &Task,
        lease: Uuid,
        backend: Option<BackendId>,
        error: FleetError,
        elapsed_ms: u64,
    ) -> ExecutionOutcome {
        let attempts = task.attempts + 1;
        let exhausted = attempts >= self.config.retry_limit;
        let patch = if exhausted {
            let last_backend = backend
                .map(|b| b.to_string())
                .unwrap_or_else(|| "none".into());
            TaskPatch::to(TaskStatus::Failed).with_error(format!(
                "failed after {attempts} attempt(s) (last backend: {last_backend}): {error}"
            ))
        } else {
            TaskPatch::to(TaskStatus::Pending).with_error(error.to_string())
        }
        .bump_attempts()
        .clear_lease();

        match self.store.transition(task.id, Expect::leased(lease), patch).await {
            Ok(Some(row)) => {
                warn!(
                    task_id = %task.id,
                    correlation_id = %task.correlation_id,
                    attempts = row.attempts,
                    backend = ?backend,
                    error = %error,
                    final_failure = exhausted,
                    "Task attempt failed"
                );
                emit(&FleetEvent::Outcome {
                    task_id: task.id,
                    correlation_id: task.correlation_id,
                    status: row.status,
                    attempts: row.attempts,
                    backend,
                    error: row.last_error.clone(),
                });
                if exhausted {
                    self.monitor
                        .record_failed(task.assignee_expert_id, task.id, elapsed_ms)
                        .await;
                    if let Err(e) = self.fail_dependents(&row).await {
                        warn!(task_id = %task.id, error = %e, "Failed to propagate failure to dependents");
                    }
                    ExecutionOutcome::Failed
                } else {
                    self.monitor
                        .record_retry(task.assignee_expert_id, task.id, elapsed_ms)
                        .await;
                    ExecutionOutcome::Retrying
                }
            }
            Ok(None) => self.lease_lost(task, elapsed_ms).await,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to record failure");
                self.lease_lost(task, elapsed_ms).await
            }
        }
    }

    async fn lease_lost(&self, task: &Task, elapsed_ms: u64) -> ExecutionOutcome {
        warn!(
            task_id = %task.id,
            correlation_id = %task.correlation_id,
            "Lease lost before the outcome was recorded; result discarded"
        );
        self.monitor
            .record_abandoned(task.assignee_expert_id, task.id, elapsed_ms)
            .await;
        ExecutionOutcome::LeaseLost
    }

    fn spawn_heartbeat(&self, task_id: Uuid, lease: Uuid) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let period = self.config.heartbeat();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store
                    .transition(task_id, Expect::leased(lease), TaskPatch::heartbeat())
                    .await
                {
                    Ok(Some(_)) => debug!(task_id = %task_id, "Lease renewed"),
                    Ok(None) => {
                        warn!(task_id = %task_id, "Lease no longer held, heartbeat stopped");
                        break;
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "Heartbeat failed");
                        break;
                    }
                }
            }
        })
    }

    fn request_for(&self, task: &Task, prompt: String) -> RouteRequest {
        let category = task
            .category
            .clone()
            .unwrap_or_else(|| GENERAL_CATEGORY.to_string());
        let priority = match task.priority {
            Priority::Low => Priority::Low,
            _ => Priority::Medium,
        };
        RouteRequest::new(prompt, category)
            .with_preferred_backend(task.backend_hint)
            .with_model(task.model_hint.clone())
            .with_priority(priority)
            .with_policy(OverflowPolicy::Block)
            .with_deadline(self.config.call_deadline())
            .with_correlation_id(task.correlation_id)
    }

    /// The task's goal, followed by the results of the tasks it depends on.
    async fn build_prompt(&self, task: &Task) -> FleetResult<String> {
        let dependencies = self.store.dependencies_of(task.id).await?;
        let mut synthesis = false;
        let mut sections = Vec::new();
        for dependency in dependencies {
            synthesis |= dependency.kind == DependencyKind::Subtask;
            let Some(prerequisite) = self.store.get(dependency.parent_task_id).await? else {
                continue;
            };
            let Some(result) = prerequisite.result.as_deref() else {
                continue;
            };
            let title = prerequisite
                .metadata
                .get(TITLE_KEY)
                .and_then(|v| v.as_str())
                .unwrap_or(&prerequisite.goal);
            sections.push(format!(
                "### {title}\n{}",
                truncate_chars(result, self.config.dependency_context_chars)
            ));
        }
        if sections.is_empty() {
            return Ok(task.goal.clone());
        }
        let header = if synthesis {
            "Combine the subtask results below into one complete answer."
        } else {
            "Results of the tasks this one builds on:"
        };
        Ok(format!(
            "{}\n\n{header}\n\n{}",
            task.goal,
            sections.join("\n\n")
        ))
    }

    /// Returns in-progress tasks whose lease has not been renewed within the
    /// stuck threshold to pending. Each stale lease is reclaimed at most once,
    /// even with several reapers running.
    pub async fn reap_stuck(&self) -> FleetResult<usize> {
        let now = Utc::now();
        let threshold = ChronoDuration::from_std(self.config.stuck_threshold())
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let cutoff = now - threshold;

        let in_progress = self
            .store
            .list(&TaskFilter::status(TaskStatus::InProgress))
            .await?;
        let mut recovered = 0;
        for task in in_progress.into_iter().filter(|t| t.updated_at < cutoff) {
            let recoveries = task
                .metadata
                .get(LEASE_RECOVERIES_KEY)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0)
                + 1;
            let patch = TaskPatch::to(TaskStatus::Pending)
                .clear_lease()
                .with_metadata(LEASE_RECOVERIES_KEY, serde_json::json!(recoveries));
            if self
                .store
                .transition(task.id, Expect::stale_since(cutoff), patch)
                .await?
                .is_none()
            {
                continue;
            }
            recovered += 1;
            let lease_age_secs = task.lease_age_secs(now);
            let stuck = FleetError::StuckTask { task_id: task.id };
            warn!(
                error = %stuck,
                correlation_id = %task.correlation_id,
                lease_age_secs,
                recoveries,
                "Reset stuck task to pending"
            );
            emit(&FleetEvent::StuckRecovered {
                task_id: task.id,
                correlation_id: task.correlation_id,
                lease_age_secs,
            });
        }
        Ok(recovered)
    }

    /// Fails every pending task that waits, directly or transitively, on
    /// `failed`. Each gets a diagnostic naming its failed prerequisite.
    pub async fn fail_dependents(&self, failed: &Task) -> FleetResult<usize> {
        let mut frontier = vec![failed.clone()];
        let mut blocked = 0;
        while let Some(prerequisite) = frontier.pop() {
            for edge in self.store.dependents_of(prerequisite.id).await? {
                let reason = format!(
                    "prerequisite task {} failed: {}",
                    prerequisite.id,
                    prerequisite.last_error.as_deref().unwrap_or("no diagnostic")
                );
                let Some(row) = self
                    .store
                    .transition(
                        edge.child_task_id,
                        Expect::status(TaskStatus::Pending),
                        TaskPatch::to(TaskStatus::Failed).with_error(reason),
                    )
                    .await?
                else {
                    continue;
                };
                blocked += 1;
                warn!(
                    task_id = %row.id,
                    correlation_id = %row.correlation_id,
                    prerequisite = %prerequisite.id,
                    "Task failed because a prerequisite failed"
                );
                emit(&FleetEvent::Outcome {
                    task_id: row.id,
                    correlation_id: row.correlation_id,
                    status: row.status,
                    attempts: row.attempts,
                    backend: None,
                    error: row.last_error.clone(),
                });
                frontier.push(row);
            }
        }
        Ok(blocked)
    }

    /// Sweeps failed tasks for dependents still pending, e.g. after a
    /// restart interrupted propagation.
    pub async fn fail_blocked(&self) -> FleetResult<usize> {
        let mut blocked = 0;
        for task in self.store.list(&TaskFilter::status(TaskStatus::Failed)).await? {
            blocked += self.fail_dependents(&task).await?;
        }
        Ok(blocked)
    }

    /// Starts the polling loop and the reaper loop.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let poller = {
            let pool = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    match pool.poll_once().await {
                        Ok((report, _)) if report.claimed > 0 => {
                            debug!(
                                claimed = report.claimed,
                                groups = report.groups,
                                saturated = report.saturated,
                                "Worker poll"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Worker poll failed"),
                    }
                    tokio::time::sleep(pool.config.poll_interval()).await;
                }
            })
        };

        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reaper_interval());
            loop {
                ticker.tick().await;
                if let Err(e) = self.reap_stuck().await {
                    warn!(error = %e, "Reaper pass failed");
                }
                match self.fail_blocked().await {
                    Ok(0) => {}
                    Ok(blocked) => info!(blocked, "Failed tasks blocked by failed prerequisites"),
                    Err(e) => warn!(error = %e, "Blocked-task sweep failed"),
                }
            }
        });

        vec![poller, reaper]
    }
}

/// Rejects empty, too short, and error-shaped results.
pub fn validate_result(text: &str, min_chars: usize) -> FleetResult<()> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(FleetError::InvalidResult("empty result".into()));
    }
    let chars = trimmed.chars().count();
    if chars < min_chars {
        return Err(FleetError::InvalidResult(format!(
            "result has {chars} characters, at least {min_chars} required"
        )));
    }
    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(trimmed) {
            if let Some(error) = map.get("error") {
                return Err(FleetError::InvalidResult(format!(
                    "backend returned an error object: {error}"
                )));
            }
        }
    }
    Ok(())
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("...");
    cut
}
