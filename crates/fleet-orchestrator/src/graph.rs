//! In-memory subtask DAG produced by decomposition.

use fleet_core::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// A unit of a decomposed goal, alive only until it is persisted as a Task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub estimated_duration_min: u32,
    /// Subtasks that must complete before this one.
    pub dependencies: Vec<Uuid>,
}

impl SubTask {
    /// Subtask with a fresh id and no dependencies.
    pub fn new(description: impl Into<String>, estimated_duration_min: u32) -> Self {
        let description = description.into();
        Self {
            id: Uuid::new_v4(),
            title: short_title(&description),
            description,
            category: None,
            estimated_duration_min,
            dependencies: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Adds a prerequisite by id.
    pub fn depends_on(mut self, id: Uuid) -> Self {
        if !self.dependencies.contains(&id) {
            self.dependencies.push(id);
        }
        self
    }
}

fn short_title(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or_default().trim();
    if first_line.chars().count() <= 60 {
        return first_line.to_string();
    }
    let cut: String = first_line.chars().take(57).collect();
    format!("{}...", cut.trim_end())
}

/// Scheduling hints derived from a graph's levels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParallelEstimate {
    pub parallel_min: u32,
    pub sequential_min: u32,
    pub speedup: f64,
    pub levels: usize,
    pub tasks_per_level: Vec<usize>,
}

/// Subtasks in insertion order plus their dependency edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskGraph {
    nodes: Vec<SubTask>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a subtask and returns its id.
    pub fn add(&mut self, subtask: SubTask) -> Uuid {
        let id = subtask.id;
        self.nodes.push(subtask);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Subtask by id.
    pub fn get(&self, id: Uuid) -> Option<&SubTask> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Subtasks in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, SubTask> {
        self.nodes.iter()
    }

    /// Rejects duplicate ids, unknown or self dependencies, and cycles.
    pub fn validate(&self) -> FleetResult<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return Err(FleetError::DecompositionFailure(format!(
                    "duplicate subtask id {}",
                    node.id
                )));
            }
        }
        for node in &self.nodes {
            for dep in &node.dependencies {
                if *dep == node.id {
                    return Err(FleetError::DecompositionFailure(format!(
                        "subtask '{}' depends on itself",
                        node.title
                    )));
                }
                if !ids.contains(dep) {
                    return Err(FleetError::DecompositionFailure(format!(
                        "subtask '{}' depends on unknown id {dep}",
                        node.title
                    )));
                }
            }
        }
        if self.has_cycle() {
            return Err(FleetError::DecompositionFailure(
                "dependency cycle in subtask graph".into(),
            ));
        }
        Ok(())
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let index: HashMap<Uuid, &SubTask> = self.nodes.iter().map(|n| (n.id, n)).collect();
        let mut visited = HashMap::new();
        self.nodes
            .iter()
            .any(|n| Self::dfs_cycle(&index, n.id, &mut visited))
    }

    fn dfs_cycle(
        index: &HashMap<Uuid, &SubTask>,
        id: Uuid,
        visited: &mut HashMap<Uuid, u8>,
    ) -> bool {
        match visited.get(&id) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // done
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(node) = index.get(&id) {
            for dep in &node.dependencies {
                if Self::dfs_cycle(index, *dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    /// Topological layering: level 0 has no dependencies, each later level
    /// depends only on earlier ones. Insertion order is kept inside a level.
    pub fn execution_levels(&self) -> FleetResult<Vec<Vec<&SubTask>>> {
        self.validate()?;
        let mut placed: HashSet<Uuid> = HashSet::new();
        let mut levels = Vec::new();
        while placed.len() < self.nodes.len() {
            let level: Vec<&SubTask> = self
                .nodes
                .iter()
                .filter(|n| !placed.contains(&n.id))
                .filter(|n| n.dependencies.iter().all(|d| placed.contains(d)))
                .collect();
            if level.is_empty() {
                // validate() already ruled this out
                return Err(FleetError::DecompositionFailure(
                    "subtask graph cannot be leveled".into(),
                ));
            }
            placed.extend(level.iter().map(|n| n.id));
            levels.push(level);
        }
        Ok(levels)
    }

    /// Sum over levels of the longest subtask in each level, in minutes.
    pub fn estimated_parallel_duration(&self) -> FleetResult<u32> {
        Ok(self
            .execution_levels()?
            .iter()
            .map(|level| {
                level
                    .iter()
                    .map(|n| n.estimated_duration_min)
                    .max()
                    .unwrap_or(0)
            })
            .sum())
    }

    /// Parallel and sequential duration estimates.
    pub fn estimate(&self) -> FleetResult<ParallelEstimate> {
        let levels = self.execution_levels()?;
        let parallel_min = self.estimated_parallel_duration()?;
        let sequential_min: u32 = self.nodes.iter().map(|n| n.estimated_duration_min).sum();
        let speedup = if parallel_min == 0 {
            1.0
        } else {
            f64::from(sequential_min) / f64::from(parallel_min)
        };
        Ok(ParallelEstimate {
            parallel_min,
            sequential_min,
            speedup,
            levels: levels.len(),
            tasks_per_level: levels.iter().map(Vec::len).collect(),
        })
    }
}

impl<'a> IntoIterator for &'a TaskGraph {
    type Item = &'a SubTask;
    type IntoIter = std::slice::Iter<'a, SubTask>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// A→B, A→C
    fn fan_out() -> (TaskGraph, Uuid, Uuid, Uuid) {
        let mut graph = TaskGraph::new();
        let a = graph.add(SubTask::new("Design the schema", 30));
        let b = graph.add(SubTask::new("Write the migration", 45).depends_on(a));
        let c = graph.add(SubTask::new("Document the tables", 15).depends_on(a));
        (graph, a, b, c)
    }

    #[test]
    fn test_levels_fan_out() {
        let (graph, a, b, c) = fan_out();
        let levels: Vec<Vec<Uuid>> = graph
            .execution_levels()
            .unwrap()
            .iter()
            .map(|l| l.iter().map(|n| n.id).collect())
            .collect();
        assert_eq!(levels, vec![vec![a], vec![b, c]]);
    }

    #[test]
    fn test_parallel_duration() {
        let (graph, ..) = fan_out();
        assert_eq!(graph.estimated_parallel_duration().unwrap(), 75);
        let estimate = graph.estimate().unwrap();
        assert_eq!(estimate.sequential_min, 90);
        assert_eq!(estimate.levels, 2);
        assert_eq!(estimate.tasks_per_level, vec![1, 2]);
        assert!((estimate.speedup - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_chain_levels() {
        let mut graph = TaskGraph::new();
        let a = graph.add(SubTask::new("one", 10));
        let b = graph.add(SubTask::new("two", 10).depends_on(a));
        graph.add(SubTask::new("three", 10).depends_on(b));
        assert_eq!(graph.execution_levels().unwrap().len(), 3);
        assert_eq!(graph.estimated_parallel_duration().unwrap(), 30);
    }

    #[test]
    fn test_cycle_detection() {
        let mut a = SubTask::new("a", 5);
        let b = SubTask::new("b", 5).depends_on(a.id);
        a = a.depends_on(b.id);
        let mut graph = TaskGraph::new();
        graph.add(a);
        graph.add(b);
        assert!(graph.has_cycle());
        assert!(matches!(
            graph.validate(),
            Err(FleetError::DecompositionFailure(_))
        ));
        assert!(graph.execution_levels().is_err());
    }

    #[test]
    fn test_unknown_and_self_dependency_rejected() {
        let mut graph = TaskGraph::new();
        graph.add(SubTask::new("orphan", 5).depends_on(Uuid::new_v4()));
        assert!(graph.validate().is_err());

        let mut graph = TaskGraph::new();
        let s = SubTask::new("me", 5);
        let id = s.id;
        graph.add(s.depends_on(id));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::new();
        assert!(graph.execution_levels().unwrap().is_empty());
        assert_eq!(graph.estimate().unwrap().speedup, 1.0);
    }

    #[test]
    fn test_long_title_truncated() {
        let s = SubTask::new("x".repeat(100), 5);
        assert_eq!(s.title.chars().count(), 60);
        assert!(s.title.ends_with("..."));
    }
}
