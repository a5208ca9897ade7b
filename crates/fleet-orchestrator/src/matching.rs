//! Expert matching: who should work on a task, and on which model.
//!
//! Candidates come in widening stages: specialists in the category, then
//! experts whose department names the category, then (if allowed) anyone.
//! Within a stage an expert must be able to reach one of its preferred
//! models through the registry; the survivors are ranked by a weighted sum
//! of proficiency, free capacity and recent success rate.

use crate::graph::TaskGraph;
use crate::store::{ExpertStats, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_backends::ModelRegistry;
use fleet_core::config::MatchingConfig;
use fleet_core::{Assignment, BackendId, Expert, FleetError, FleetResult, Task};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Source of provisioned experts.
#[async_trait]
pub trait ExpertDirectory: Send + Sync {
    async fn experts(&self) -> FleetResult<Vec<Expert>>;
}

/// Experts held in memory, typically from the `[[experts]]` config section.
pub struct InMemoryExpertDirectory {
    experts: RwLock<Vec<Expert>>,
}

impl InMemoryExpertDirectory {
    /// Directory over a fixed roster.
    pub fn new(mut experts: Vec<Expert>) -> Self {
        experts.iter_mut().for_each(Expert::ensure_id);
        Self {
            experts: RwLock::new(experts),
        }
    }

    /// Replaces the roster, e.g. after a config reload.
    pub fn replace(&self, mut experts: Vec<Expert>) {
        experts.iter_mut().for_each(Expert::ensure_id);
        *self.experts.write() = experts;
    }

    pub fn len(&self) -> usize {
        self.experts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExpertDirectory for InMemoryExpertDirectory {
    async fn experts(&self) -> FleetResult<Vec<Expert>> {
        Ok(self.experts.read().clone())
    }
}

/// Winner of a match, with the figures that decided it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedExpert {
    pub expert: Expert,
    pub score: f64,
    pub proficiency: f64,
    /// Utilization at the time of matching, `0.0..=1.0`.
    pub load: f64,
    pub backend_hint: Option<BackendId>,
    pub model_hint: Option<String>,
}

impl MatchedExpert {
    /// Assignment row for `task_id`.
    pub fn assignment(&self, task_id: Uuid) -> Assignment {
        Assignment {
            task_id,
            expert_id: self.expert.id,
            backend_hint: self.backend_hint,
            model_hint: self.model_hint.clone(),
        }
    }
}

/// Load figures for one matching pass, bumped as assignments are made.
struct LoadView {
    stats: HashMap<Uuid, ExpertStats>,
    added: HashMap<Uuid, u32>,
    stamped: HashMap<Uuid, DateTime<Utc>>,
}

impl LoadView {
    fn new(stats: HashMap<Uuid, ExpertStats>) -> Self {
        Self {
            stats,
            added: HashMap::new(),
            stamped: HashMap::new(),
        }
    }

    fn active(&self, expert: &Expert) -> u32 {
        self.stats.get(&expert.id).map(|s| s.active).unwrap_or(0)
            + self.added.get(&expert.id).copied().unwrap_or(0)
    }

    fn utilization(&self, expert: &Expert) -> f64 {
        if expert.max_concurrent_tasks == 0 {
            return 1.0;
        }
        (f64::from(self.active(expert)) / f64::from(expert.max_concurrent_tasks)).clamp(0.0, 1.0)
    }

    fn success(&self, expert: &Expert, default: f64) -> f64 {
        self.stats
            .get(&expert.id)
            .and_then(ExpertStats::success_rate)
            .unwrap_or(default)
    }

    fn last_assigned(&self, expert: &Expert) -> Option<DateTime<Utc>> {
        let stored = self.stats.get(&expert.id).and_then(|s| s.last_assigned_at);
        stored.max(self.stamped.get(&expert.id).copied())
    }

    fn record(&mut self, expert: &Expert) {
        *self.added.entry(expert.id).or_insert(0) += 1;
        self.stamped.insert(expert.id, Utc::now());
    }
}

/// Model an expert would run on.
enum Reach {
    Pinned(BackendId, String),
    /// Expert has no preference and some model is up.
    Any,
}

/// Ranks experts for tasks and reports their load.
pub struct ExpertMatchingEngine {
    directory: Arc<dyn ExpertDirectory>,
    store: Arc<dyn TaskStore>,
    registry: Arc<ModelRegistry>,
    config: Arc<RwLock<MatchingConfig>>,
}

impl ExpertMatchingEngine {
    /// Engine over a directory, a task store and the model registry.
    pub fn new(
        directory: Arc<dyn ExpertDirectory>,
        store: Arc<dyn TaskStore>,
        registry: Arc<ModelRegistry>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            directory,
            store,
            registry,
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the live weights.
    pub fn config(&self) -> MatchingConfig {
        self.config.read().clone()
    }

    /// Swaps ranking weights in place; invalid configs are rejected.
    pub fn update_config(&self, config: MatchingConfig) -> FleetResult<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Every expert in the directory.
    pub async fn experts(&self) -> FleetResult<Vec<Expert>> {
        self.directory.experts().await
    }

    async fn load_view(&self) -> FleetResult<LoadView> {
        Ok(LoadView::new(self.store.expert_stats().await?))
    }

    /// Best qualified expert for `task` in `category`, or `NoExpertAvailable`.
    pub async fn find_best_expert(&self, task: &Task, category: &str) -> FleetResult<MatchedExpert> {
        self.find_best_expert_across(task, category, &[]).await
    }

    /// Like [`find_best_expert`](Self::find_best_expert), with the first
    /// stage widened to every listed domain and their departments.
    pub async fn find_best_expert_across(
        &self,
        task: &Task,
        category: &str,
        domains: &[String],
    ) -> FleetResult<MatchedExpert> {
        self.registry.refresh(false).await;
        let experts = self.directory.experts().await?;
        let view = self.load_view().await?;
        let matched = self
            .rank(&experts, category, domains, &view)
            .ok_or_else(|| FleetError::NoExpertAvailable {
                category: category.to_string(),
            })?;
        debug!(
            task_id = %task.id,
            expert = %matched.expert.name,
            score = matched.score,
            "Expert matched"
        );
        Ok(matched)
    }

    /// Matches every subtask, in execution order, counting each assignment
    /// toward the chosen expert's load before matching the next one.
    /// Subtasks nobody can take are left out of the map.
    pub async fn find_experts_for_graph(
        &self,
        graph: &TaskGraph,
        default_category: &str,
    ) -> FleetResult<HashMap<Uuid, MatchedExpert>> {
        self.registry.refresh(false).await;
        let experts = self.directory.experts().await?;
        let mut view = self.load_view().await?;
        let mut matches = HashMap::new();
        for level in graph.execution_levels()? {
            for subtask in level {
                let category = subtask.category.as_deref().unwrap_or(default_category);
                match self.rank(&experts, category, &[], &view) {
                    Some(matched) => {
                        view.record(&matched.expert);
                        matches.insert(subtask.id, matched);
                    }
                    None => {
                        debug!(subtask = %subtask.title, category, "No expert for subtask");
                    }
                }
            }
        }
        Ok(matches)
    }

    /// Utilization per expert: active tasks over `max_concurrent_tasks`,
    /// clamped to `0.0..=1.0`.
    pub async fn load_balance(&self) -> FleetResult<HashMap<Uuid, f64>> {
        let experts = self.directory.experts().await?;
        let view = self.load_view().await?;
        Ok(experts
            .iter()
            .map(|e| (e.id, view.utilization(e)))
            .collect())
    }

    /// Proficiency the ranking would use for this expert and category, or
    /// `None` when the expert is not a candidate at all.
    pub fn fit(&self, expert: &Expert, category: &str) -> Option<f64> {
        let config = self.config.read();
        expert
            .proficiency(category)
            .or_else(|| department_matches(expert, category).then_some(config.fallback_proficiency))
            .or_else(|| config.allow_any_expert.then_some(config.fallback_proficiency / 2.0))
    }

    /// Whether one of the expert's preferred models is reachable right now.
    pub fn can_reach_model(&self, expert: &Expert) -> bool {
        self.reach(expert).is_some()
    }

    /// Backend and model hints for an expert working in `category`, or
    /// `None` when none of its preferred models is reachable.
    pub fn hints(
        &self,
        expert: &Expert,
        category: &str,
    ) -> Option<(Option<BackendId>, Option<String>)> {
        let reach = self.reach(expert)?;
        Some(self.hints_for(reach, category))
    }

    fn hints_for(&self, reach: Reach, category: &str) -> (Option<BackendId>, Option<String>) {
        match reach {
            Reach::Pinned(backend, model) => (Some(backend), Some(model)),
            Reach::Any => self
                .registry
                .best_model(category)
                .map(|d| (Some(d.backend), Some(d.name)))
                .unwrap_or((None, None)),
        }
    }

    fn reach(&self, expert: &Expert) -> Option<Reach> {
        if expert.preferred_models.is_empty() {
            return self.registry.has_available_models().then_some(Reach::Any);
        }
        expert
            .preferred_models
            .iter()
            .find_map(|m| self.registry.lookup(m))
            .map(|d| Reach::Pinned(d.backend, d.name))
    }

    fn rank(
        &self,
        experts: &[Expert],
        category: &str,
        domains: &[String],
        view: &LoadView,
    ) -> Option<MatchedExpert> {
        let config = self.config.read().clone();
        let mut wanted: Vec<&str> = vec![category];
        for d in domains {
            if !wanted.contains(&d.as_str()) {
                wanted.push(d);
            }
        }
        let widened = wanted.len() > 1;

        let specialists = |e: &Expert| {
            wanted
                .iter()
                .filter_map(|c| e.proficiency(c))
                .fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.max(p))))
        };
        let department = |e: &Expert| {
            wanted
                .iter()
                .any(|c| department_matches(e, c))
                .then_some(config.fallback_proficiency)
        };

        type Stage<'s> = Box<dyn Fn(&Expert) -> Option<f64> + 's>;
        let mut stages: Vec<Stage<'_>> = Vec::new();
        if widened {
            stages.push(Box::new(|e: &Expert| specialists(e).or_else(|| department(e))));
        } else {
            stages.push(Box::new(specialists));
            stages.push(Box::new(department));
        }
        if config.allow_any_expert {
            let any = config.fallback_proficiency / 2.0;
            stages.push(Box::new(move |_: &Expert| Some(any)));
        }

        let weight_sum =
            (config.proficiency_weight + config.load_weight + config.success_weight).max(f64::EPSILON);

        for stage in &stages {
            let mut best: Option<(MatchedExpert, Option<DateTime<Utc>>)> = None;
            for expert in experts {
                let Some(proficiency) = stage(expert) else {
                    continue;
                };
                let Some(reach) = self.reach(expert) else {
                    debug!(expert = %expert.name, "No preferred model reachable, skipping");
                    continue;
                };
                let load = view.utilization(expert);
                let success = view.success(expert, config.default_success_rate);
                let score = (config.proficiency_weight * proficiency
                    + config.load_weight * (1.0 - load)
                    + config.success_weight * success)
                    / weight_sum;
                let (backend_hint, model_hint) = self.hints_for(reach, category);
                let candidate = MatchedExpert {
                    expert: expert.clone(),
                    score,
                    proficiency,
                    load,
                    backend_hint,
                    model_hint,
                };
                let last = view.last_assigned(expert);
                let better = match &best {
                    None => true,
                    Some((current, current_last)) => {
                        if (candidate.score - current.score).abs() > 1e-9 {
                            candidate.score > current.score
                        } else if last != *current_last {
                            // Never-assigned sorts before any timestamp.
                            last < *current_last
                        } else {
                            candidate.expert.name < current.expert.name
                        }
                    }
                };
                if better {
                    best = Some((candidate, last));
                }
            }
            if let Some((matched, _)) = best {
                return Some(matched);
            }
        }
        None
    }
}

fn department_matches(expert: &Expert, category: &str) -> bool {
    !category.is_empty()
        && expert
            .department
            .to_lowercase()
            .contains(&category.to_lowercase())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::graph::SubTask;
    use crate::store::InMemoryTaskStore;
    use crate::test_support::registry_with;

    async fn engine(experts: Vec<Expert>) -> (ExpertMatchingEngine, Arc<InMemoryTaskStore>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let registry = registry_with(&["qwen2.5:3b"], &["qwen2.5-coder:32b", "qwq:32b"]).await;
        let engine = ExpertMatchingEngine::new(
            Arc::new(InMemoryExpertDirectory::new(experts)),
            store.clone(),
            registry,
            MatchingConfig::default(),
        );
        (engine, store)
    }

    async fn give_active_tasks(store: &InMemoryTaskStore, expert: &Expert, n: usize) {
        for i in 0..n {
            let task = Task::new(format!("busy {i}"));
            store.insert(task.clone()).await.unwrap();
            store
                .assign(
                    &Assignment {
                        task_id: task.id,
                        expert_id: expert.id,
                        backend_hint: None,
                        model_hint: None,
                    },
                    None,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_specialist_wins_and_gets_model_hint() {
        let coder = Expert::new("Linus", "engineering")
            .with_specialization("coding", 0.9)
            .with_preferred_model("qwen2.5-coder:32b");
        let writer = Expert::new("Ursula", "content").with_specialization("writing", 0.9);
        let (engine, _) = engine(vec![coder.clone(), writer]).await;

        let matched = engine
            .find_best_expert(&Task::new("fix bug"), "coding")
            .await
            .unwrap();
        assert_eq!(matched.expert.id, coder.id);
        assert_eq!(matched.backend_hint, Some(BackendId::Batch));
        assert_eq!(matched.model_hint.as_deref(), Some("qwen2.5-coder:32b"));
        assert_eq!(matched.assignment(Uuid::nil()).expert_id, coder.id);
    }

    #[tokio::test]
    async fn test_unreachable_model_is_hard_filter() {
        let top = Expert::new("Top", "engineering")
            .with_specialization("coding", 1.0)
            .with_preferred_model("starcoder:15b");
        let ok = Expert::new("Ok", "engineering")
            .with_specialization("coding", 0.4)
            .with_preferred_model("qwen2.5:3b");
        let (engine, _) = engine(vec![top, ok.clone()]).await;
        let matched = engine
            .find_best_expert(&Task::new("x"), "coding")
            .await
            .unwrap();
        assert_eq!(matched.expert.id, ok.id);
    }

    #[tokio::test]
    async fn test_department_fallback_then_any() {
        let analyst = Expert::new("Ada", "Data Platform");
        let generalist = Expert::new("Bob", "ops");
        let (engine, _) = engine(vec![analyst.clone(), generalist]).await;

        let matched = engine.find_best_expert(&Task::new("x"), "data").await.unwrap();
        assert_eq!(matched.expert.id, analyst.id);
        assert!((matched.proficiency - 0.3).abs() < 1e-9);

        let matched = engine.find_best_expert(&Task::new("x"), "legal").await.unwrap();
        assert!((matched.proficiency - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_expert_available() {
        let (engine, _) = engine(vec![Expert::new("Ada", "data")]).await;
        engine
            .update_config(MatchingConfig {
                allow_any_expert: false,
                ..MatchingConfig::default()
            })
            .unwrap();
        let err = engine
            .find_best_expert(&Task::new("x"), "legal")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoExpertAvailable { category } if category == "legal"));
    }

    #[tokio::test]
    async fn test_load_breaks_equal_proficiency() {
        let a = Expert::new("A", "eng").with_specialization("coding", 0.8);
        let b = Expert::new("B", "eng").with_specialization("coding", 0.8);
        let (engine, store) = engine(vec![a.clone(), b.clone()]).await;
        give_active_tasks(&store, &a, 2).await;

        let matched = engine.find_best_expert(&Task::new("x"), "coding").await.unwrap();
        assert_eq!(matched.expert.id, b.id);

        let load = engine.load_balance().await.unwrap();
        assert!((load[&a.id] - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(load[&b.id], 0.0);
    }

    #[tokio::test]
    async fn test_graph_spreads_over_distinct_experts() {
        let experts: Vec<Expert> = ["A", "B", "C"]
            .iter()
            .map(|n| Expert::new(*n, "eng").with_specialization("coding", 0.8))
            .collect();
        let (engine, _) = engine(experts.clone()).await;

        let mut graph = TaskGraph::new();
        let a = graph.add(SubTask::new("schema", 20).with_category("coding"));
        graph.add(SubTask::new("migration", 20).with_category("coding").depends_on(a));
        graph.add(SubTask::new("docs", 20).depends_on(a));

        let matches = engine.find_experts_for_graph(&graph, "coding").await.unwrap();
        assert_eq!(matches.len(), 3);
        let mut chosen: Vec<Uuid> = matches.values().map(|m| m.expert.id).collect();
        chosen.sort();
        chosen.dedup();
        assert_eq!(chosen.len(), 3);
    }

    #[tokio::test]
    async fn test_graph_reuses_least_loaded_when_short_of_experts() {
        let solo = Expert::new("Solo", "eng")
            .with_specialization("coding", 0.8)
            .with_max_concurrent_tasks(1);
        let (engine, _) = engine(vec![solo.clone()]).await;
        let mut graph = TaskGraph::new();
        let a = graph.add(SubTask::new("a", 5));
        graph.add(SubTask::new("b", 5).depends_on(a));
        let matches = engine.find_experts_for_graph(&graph, "coding").await.unwrap();
        assert!(matches.values().all(|m| m.expert.id == solo.id));
        let loads: Vec<f64> = matches.values().map(|m| m.load).collect();
        assert!(loads.contains(&0.0) && loads.contains(&1.0));
    }

    #[tokio::test]
    async fn test_multi_domain_widens_pool() {
        let writer = Expert::new("Ursula", "content").with_specialization("writing", 0.7);
        let ops = Expert::new("Ken", "ops").with_specialization("ops", 0.9);
        let (engine, _) = engine(vec![writer, ops.clone()]).await;
        let matched = engine
            .find_best_expert_across(&Task::new("x"), "writing", &["ops".to_string()])
            .await
            .unwrap();
        assert_eq!(matched.expert.id, ops.id);
    }

    #[tokio::test]
    async fn test_fit() {
        let (engine, _) = engine(vec![]).await;
        let e = Expert::new("E", "research lab").with_specialization("coding", 0.9);
        assert_eq!(engine.fit(&e, "coding"), Some(0.9));
        assert_eq!(engine.fit(&e, "research"), Some(0.3));
        assert_eq!(engine.fit(&e, "legal"), Some(0.15));
        assert!(engine.can_reach_model(&e));
    }
}
