//! The orchestrator control loop.
//!
//! Each cycle scans unassigned tasks, classifies them, decomposes the complex
//! ones, matches experts and persists assignments. Every few cycles it
//! rebalances unstarted work away from overloaded experts. A cycle is
//! idempotent: tasks that already carry an assignee are skipped, and a goal
//! whose children already exist is never split again.

use crate::analyzer::ComplexityAnalyzer;
use crate::decomposer::TaskDecomposer;
use crate::matching::ExpertMatchingEngine;
use crate::store::{TaskFilter, TaskStore};
use fleet_core::config::OrchestratorConfig;
use fleet_core::events::{emit, FleetEvent};
use fleet_core::{Assignment, Dependency, DependencyKind, FleetResult, Task, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata key holding a child's sibling prerequisites.
pub const DEPENDS_ON_KEY: &str = "depends_on";
/// Metadata key holding a child's short title.
pub const TITLE_KEY: &str = "title";

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub scanned: usize,
    pub assigned: usize,
    pub decomposed: usize,
    pub subtasks_created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub reassigned: usize,
    /// Unassigned tasks left after the cycle.
    pub remaining: usize,
}

enum Processed {
    Assigned,
    Decomposed { subtasks: usize },
    Skipped,
}

/// Classifies, decomposes, matches and assigns tasks.
pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    analyzer: Arc<ComplexityAnalyzer>,
    decomposer: Arc<TaskDecomposer>,
    matcher: Arc<ExpertMatchingEngine>,
    config: OrchestratorConfig,
    cycles: AtomicU64,
}

impl Orchestrator {
    /// Wires the loop to its collaborators.
    pub fn new(
        store: Arc<dyn TaskStore>,
        analyzer: Arc<ComplexityAnalyzer>,
        decomposer: Arc<TaskDecomposer>,
        matcher: Arc<ExpertMatchingEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            analyzer,
            decomposer,
            matcher,
            config,
            cycles: AtomicU64::new(0),
        }
    }

    pub fn analyzer(&self) -> &Arc<ComplexityAnalyzer> {
        &self.analyzer
    }

    /// The matching engine, for live config swaps.
    pub fn matcher(&self) -> &Arc<ExpertMatchingEngine> {
        &self.matcher
    }

    /// Runs one scan → analyze → decompose → match → persist pass, plus a
    /// rebalance every `rebalance_every` cycles. Per-task failures are
    /// logged and counted; they never abort the cycle.
    pub async fn run_cycle(&self) -> FleetResult<CycleReport> {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = CycleReport {
            cycle,
            ..CycleReport::default()
        };

        let backlog = self
            .store
            .list(&TaskFilter::unassigned().with_limit(self.config.batch_size))
            .await?;
        report.scanned = backlog.len();

        for task in &backlog {
            match self.process(task).await {
                Ok(Processed::Assigned) => report.assigned += 1,
                Ok(Processed::Decomposed { subtasks }) => {
                    report.assigned += 1;
                    report.decomposed += 1;
                    report.subtasks_created += subtasks;
                }
                Ok(Processed::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(task_id = %task.id, correlation_id = %task.correlation_id, error = %e, "Task not assigned this cycle");
                }
            }
        }

        if self.config.rebalance_every > 0 && cycle % self.config.rebalance_every == 0 {
            match self.rebalance().await {
                Ok(moved) => report.reassigned = moved,
                Err(e) => warn!(error = %e, "Rebalance failed"),
            }
        }

        report.remaining = self.store.list(&TaskFilter::unassigned()).await?.len();
        info!(
            cycle,
            scanned = report.scanned,
            assigned = report.assigned,
            decomposed = report.decomposed,
            failed = report.failed,
            remaining = report.remaining,
            "Orchestrator cycle finished"
        );
        Ok(report)
    }

    async fn process(&self, scanned: &Task) -> FleetResult<Processed> {
        // The row may have changed since the scan.
        let Some(task) = self.store.get(scanned.id).await? else {
            return Ok(Processed::Skipped);
        };
        if !task.is_unassigned() {
            return Ok(Processed::Skipped);
        }

        let category = task
            .category
            .clone()
            .unwrap_or_else(|| self.analyzer.infer_category(&task.goal));

        let children = self.store.list(&TaskFilter::children_of(task.id)).await?;
        if !children.is_empty() {
            // Split in an earlier cycle that stopped before the parent was assigned.
            self.restore_edges(&task, &children).await?;
            return self.assign(&task, &category, &[]).await;
        }

        if task.depth >= self.config.max_depth {
            return self.assign(&task, &category, &[]).await;
        }

        let complexity = self.analyzer.classify(&task.goal);
        let domains = if complexity.is_multi_domain() {
            complexity.domains.clone()
        } else {
            Vec::new()
        };
        if !complexity.needs_decomposition() {
            return self.assign(&task, &category, &domains).await;
        }

        debug!(task_id = %task.id, score = complexity.score, class = %complexity.class, "Decomposing goal");
        let decomposition = self
            .decomposer
            .decompose(&task.goal, Some(&category), Some(task.correlation_id))
            .await;
        let graph = decomposition.graph;
        if graph.len() < 2 {
            return self.assign(&task, &category, &domains).await;
        }
        let levels = graph.execution_levels()?.len();
        let matches = self.matcher.find_experts_for_graph(&graph, &category).await?;

        for subtask in &graph {
            let mut child = Task::new(subtask.description.clone())
                .with_id(subtask.id)
                .with_parent(&task)
                .with_category(subtask.category.clone().unwrap_or_else(|| category.clone()))
                .with_estimated_duration(subtask.estimated_duration_min)
                .with_metadata(TITLE_KEY, serde_json::json!(subtask.title));
            if !subtask.dependencies.is_empty() {
                child = child.with_metadata(DEPENDS_ON_KEY, serde_json::json!(subtask.dependencies));
            }
            self.store.insert(child).await?;
        }
        for subtask in &graph {
            for prerequisite in &subtask.dependencies {
                self.store
                    .add_dependency(Dependency::new(*prerequisite, subtask.id, DependencyKind::Sequence))
                    .await?;
            }
            self.store
                .add_dependency(Dependency::new(subtask.id, task.id, DependencyKind::Subtask))
                .await?;
        }
        for subtask in &graph {
            if let Some(matched) = matches.get(&subtask.id) {
                let assignment = matched.assignment(subtask.id);
                if self.store.assign(&assignment, None).await? {
                    emit_assigned(&assignment, task.correlation_id);
                }
            }
        }

        emit(&FleetEvent::Decomposed {
            task_id: task.id,
            correlation_id: task.correlation_id,
            subtasks: graph.len(),
            levels,
            heuristic: decomposition.heuristic,
        });

        // The parent runs last, synthesizing its children's results.
        self.assign(&task, &category, &domains).await?;
        Ok(Processed::Decomposed {
            subtasks: graph.len(),
        })
    }

    /// Re-adds dependency edges for children persisted by an interrupted cycle.
    async fn restore_edges(&self, parent: &Task, children: &[Task]) -> FleetResult<()> {
        for child in children {
            let prerequisites: Vec<Uuid> = child
                .metadata
                .get(DEPENDS_ON_KEY)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            for prerequisite in prerequisites {
                self.store
                    .add_dependency(Dependency::new(prerequisite, child.id, DependencyKind::Sequence))
                    .await?;
            }
            self.store
                .add_dependency(Dependency::new(child.id, parent.id, DependencyKind::Subtask))
                .await?;
        }
        Ok(())
    }

    async fn assign(&self, task: &Task, category: &str, domains: &[String]) -> FleetResult<Processed> {
        let matched = self
            .matcher
            .find_best_expert_across(task, category, domains)
            .await?;
        let assignment = matched.assignment(task.id);
        if !self.store.assign(&assignment, None).await? {
            return Ok(Processed::Skipped);
        }
        emit_assigned(&assignment, task.correlation_id);
        Ok(Processed::Assigned)
    }

    /// Moves pending work from overloaded experts to underloaded ones whose
    /// fit for the task's category is within `fit_tolerance`. Returns how
    /// many tasks moved.
    pub async fn rebalance(&self) -> FleetResult<usize> {
        let experts = self.matcher.experts().await?;
        let stats = self.store.expert_stats().await?;
        let tolerance = self.matcher.config().fit_tolerance;

        let mut active: HashMap<Uuid, u32> = experts
            .iter()
            .map(|e| (e.id, stats.get(&e.id).map(|s| s.active).unwrap_or(0)))
            .collect();
        let utilization = |id: Uuid, active: &HashMap<Uuid, u32>| {
            let max = experts
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.max_concurrent_tasks)
                .unwrap_or(0);
            if max == 0 {
                return 1.0;
            }
            (f64::from(active.get(&id).copied().unwrap_or(0)) / f64::from(max)).min(1.0)
        };

        let mut moved = 0;
        for from in &experts {
            if utilization(from.id, &active) < self.config.overload_threshold {
                continue;
            }
            let mut queued = self
                .store
                .list(&TaskFilter::status(TaskStatus::Pending).for_expert(from.id))
                .await?;
            // Newest first; the oldest are closest to running.
            queued.reverse();

            for task in queued {
                if utilization(from.id, &active) < self.config.overload_threshold {
                    break;
                }
                let category = task.category.as_deref().unwrap_or("general");
                let from_fit = self.matcher.fit(from, category).unwrap_or(0.0);

                let mut targets: Vec<_> = experts
                    .iter()
                    .filter(|e| e.id != from.id)
                    .filter(|e| utilization(e.id, &active) < self.config.underload_threshold)
                    .filter(|e| {
                        self.matcher
                            .fit(e, category)
                            .is_some_and(|fit| fit + tolerance >= from_fit)
                    })
                    .collect();
                targets.sort_by(|a, b| {
                    utilization(a.id, &active).total_cmp(&utilization(b.id, &active))
                });

                let Some((to, (backend_hint, model_hint))) = targets
                    .into_iter()
                    .find_map(|e| self.matcher.hints(e, category).map(|h| (e, h)))
                else {
                    continue;
                };

                let assignment = Assignment {
                    task_id: task.id,
                    expert_id: to.id,
                    backend_hint,
                    model_hint,
                };
                if !self.store.assign(&assignment, Some(from.id)).await? {
                    continue;
                }
                if let Some(n) = active.get_mut(&from.id) {
                    *n = n.saturating_sub(1);
                }
                *active.entry(to.id).or_insert(0) += 1;
                moved += 1;
                emit(&FleetEvent::Reassigned {
                    task_id: task.id,
                    correlation_id: task.correlation_id,
                    from_expert: from.id,
                    to_expert: to.id,
                });
            }
        }
        if moved > 0 {
            info!(moved, "Rebalanced unstarted tasks");
        }
        Ok(moved)
    }

    /// Runs cycles forever: every `interval_secs`, or every
    /// `quick_poll_secs` while unassigned tasks remain.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let pause = match self.run_cycle().await {
                    Ok(report) if report.remaining > 0 => self.config.quick_poll(),
                    Ok(_) => self.config.interval(),
                    Err(e) => {
                        warn!(error = %e, "Orchestrator cycle failed");
                        self.config.interval()
                    }
                };
                tokio::time::sleep(pause).await;
            }
        })
    }
}

fn emit_assigned(assignment: &Assignment, correlation_id: Uuid) {
    emit(&FleetEvent::Assigned {
        task_id: assignment.task_id,
        correlation_id,
        expert_id: assignment.expert_id,
        backend_hint: assignment.backend_hint,
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::matching::InMemoryExpertDirectory;
    use crate::store::InMemoryTaskStore;
    use crate::test_support::registry_with;
    use async_trait::async_trait;
    use fleet_backends::{ModelGateway, RouteRequest, RouteResponse};
    use fleet_core::config::{AnalyzerConfig, DecomposerConfig, MatchingConfig};
    use fleet_core::{Expert, FleetError};

    struct NoGateway;

    #[async_trait]
    impl ModelGateway for NoGateway {
        async fn call(&self, _request: RouteRequest) -> FleetResult<RouteResponse> {
            Err(FleetError::AllBackendsExhausted {
                last_backend: None,
                attempts: 0,
                last_error: "offline".into(),
            })
        }
    }

    async fn orchestrator(
        experts: Vec<Expert>,
        config: OrchestratorConfig,
    ) -> (Orchestrator, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = registry_with(&["qwen2.5:3b"], &["qwen2.5-coder:32b"]).await;
        let matcher = ExpertMatchingEngine::new(
            Arc::new(InMemoryExpertDirectory::new(experts)),
            store.clone(),
            registry,
            MatchingConfig::default(),
        );
        let decomposer =
            TaskDecomposer::new(Arc::new(NoGateway), DecomposerConfig::default()).unwrap();
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(ComplexityAnalyzer::new(AnalyzerConfig::default())),
            Arc::new(decomposer),
            Arc::new(matcher),
            config,
        );
        (orchestrator, store)
    }

    fn team() -> Vec<Expert> {
        ["Ada", "Grace", "Linus"]
            .iter()
            .map(|n| Expert::new(*n, "engineering").with_specialization("coding", 0.8))
            .collect()
    }

    const COMPLEX_GOAL: &str = "First design the database schema for orders. \
        Then implement the API endpoint that writes orders. \
        Finally write a report describing the new tables.";

    #[tokio::test]
    async fn test_simple_task_assigned_once() {
        let (orch, store) = orchestrator(team(), OrchestratorConfig::default()).await;
        let task = Task::new("Fix the typo in the login function").with_category("coding");
        store.insert(task.clone()).await.unwrap();

        let first = orch.run_cycle().await.unwrap();
        assert_eq!(first.assigned, 1);
        assert_eq!(first.remaining, 0);
        let assigned = store.get(task.id).await.unwrap().unwrap();
        assert!(assigned.assignee_expert_id.is_some());

        let second = orch.run_cycle().await.unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(
            store.get(task.id).await.unwrap().unwrap().assignee_expert_id,
            assigned.assignee_expert_id
        );
    }

    #[tokio::test]
    async fn test_complex_goal_decomposed_with_edges() {
        let (orch, store) = orchestrator(team(), OrchestratorConfig::default()).await;
        let parent = Task::new(COMPLEX_GOAL);
        store.insert(parent.clone()).await.unwrap();

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.decomposed, 1);
        assert_eq!(report.subtasks_created, 3);

        let children = store.list(&TaskFilter::children_of(parent.id)).await.unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| c.correlation_id == parent.correlation_id));
        assert!(children.iter().all(|c| c.assignee_expert_id.is_some()));

        let parent_deps = store.dependencies_of(parent.id).await.unwrap();
        assert_eq!(parent_deps.len(), 3);
        assert!(parent_deps.iter().all(|d| d.kind == DependencyKind::Subtask));

        // Only the first child can run; the parent waits for all of them.
        let runnable = store.runnable(10).await.unwrap();
        assert_eq!(runnable.len(), 1);
        assert_ne!(runnable[0].id, parent.id);

        // Second cycle leaves everything alone.
        let again = orch.run_cycle().await.unwrap();
        assert_eq!(again.scanned, 0);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_matching_failure_skips_only_that_task() {
        let (orch, store) = orchestrator(vec![], OrchestratorConfig::default()).await;
        store.insert(Task::new("lonely task")).await.unwrap();
        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn test_interrupted_split_is_not_repeated() {
        let (orch, store) = orchestrator(team(), OrchestratorConfig::default()).await;
        let parent = Task::new(COMPLEX_GOAL);
        store.insert(parent.clone()).await.unwrap();
        // A child from an earlier, interrupted cycle.
        let child = Task::new("Design the schema").with_parent(&parent);
        store.insert(child.clone()).await.unwrap();

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.decomposed, 0);
        assert_eq!(store.list(&TaskFilter::children_of(parent.id)).await.unwrap().len(), 1);
        assert_eq!(store.dependencies_of(parent.id).await.unwrap().len(), 1);
        assert!(store.get(parent.id).await.unwrap().unwrap().assignee_expert_id.is_some());
    }

    #[tokio::test]
    async fn test_children_never_redecomposed() {
        let (orch, store) = orchestrator(team(), OrchestratorConfig::default()).await;
        let parent = Task::new("root");
        let child = Task::new(COMPLEX_GOAL).with_parent(&parent);
        store.insert(parent).await.unwrap();
        store.insert(child.clone()).await.unwrap();
        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.decomposed, 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_rebalance_moves_unstarted_work() {
        let experts = team();
        let config = OrchestratorConfig {
            rebalance_every: 1,
            ..OrchestratorConfig::default()
        };
        let (orch, store) = orchestrator(experts.clone(), config).await;
        let busy = &experts[0];
        for i in 0..3 {
            let task = Task::new(format!("queued {i}")).with_category("coding");
            store.insert(task.clone()).await.unwrap();
            store
                .assign(
                    &Assignment {
                        task_id: task.id,
                        expert_id: busy.id,
                        backend_hint: None,
                        model_hint: None,
                    },
                    None,
                )
                .await
                .unwrap();
        }

        let report = orch.run_cycle().await.unwrap();
        assert_eq!(report.reassigned, 1);
        let load = orch.matcher().load_balance().await.unwrap();
        assert!(load[&busy.id] < 1.0);
    }
}
