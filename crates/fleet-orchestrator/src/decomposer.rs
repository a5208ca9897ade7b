//! Goal decomposition into a subtask DAG.
//!
//! The primary path asks a model for a JSON plan through the
//! [`ModelGateway`]. Any failure there (routing error, unparsable output,
//! invalid graph) is logged as a decomposition failure and the deterministic
//! heuristic split takes over, so callers always get a valid graph.

use crate::graph::{SubTask, TaskGraph};
use fleet_backends::{ModelGateway, RouteRequest};
use fleet_core::config::DecomposerConfig;
use fleet_core::{FleetError, FleetResult, Priority};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PLAN_GOAL_CHARS: usize = 2000;

/// Result of [`TaskDecomposer::decompose`].
#[derive(Debug, Clone)]
pub struct Decomposition {
    pub graph: TaskGraph,
    /// The heuristic split produced the graph.
    pub heuristic: bool,
}

/// Minutes for a subtask, from description length and category.
pub fn estimate_duration(description: &str, category: Option<&str>) -> u32 {
    let len = description.trim().chars().count();
    let base = if len > 500 {
        45.0
    } else if len > 200 {
        30.0
    } else {
        15.0
    };
    let multiplier = match category {
        Some("reasoning") => 1.5,
        Some("coding") => 1.3,
        Some("complex") => 1.4,
        _ => 1.0,
    };
    ((base * multiplier) as u32).clamp(5, 120)
}

/// Splits goals into subtask DAGs.
pub struct TaskDecomposer {
    gateway: Arc<dyn ModelGateway>,
    config: DecomposerConfig,
    fence: Regex,
    sentence_end: Regex,
    connective: Regex,
    list_item: Regex,
}

impl TaskDecomposer {
    /// Fails when the heuristic patterns do not compile.
    pub fn new(gateway: Arc<dyn ModelGateway>, config: DecomposerConfig) -> FleetResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| FleetError::Config(format!("invalid decomposer pattern: {e}")))
        };
        Ok(Self {
            gateway,
            config,
            fence: compile(r"```(?:json)?\s*([\s\S]*?)```")?,
            sentence_end: compile(r"[.!?;]\s+")?,
            connective: compile(
                r"(?i),?\s+\b(?:and then|then|after that|afterwards|finally|followed by)\b\s*",
            )?,
            list_item: compile(r"^\s*(?:[-*•]|\d+[.)])\s+(.+)$")?,
        })
    }

    /// Splits `goal` into a validated DAG. Never fails: the heuristic split
    /// covers every primary-path failure.
    pub async fn decompose(
        &self,
        goal: &str,
        category: Option<&str>,
        correlation_id: Option<Uuid>,
    ) -> Decomposition {
        if !self.config.heuristic_only {
            match self.decompose_with_model(goal, category, correlation_id).await {
                Ok(graph) => {
                    info!(subtasks = graph.len(), "Goal decomposed by model");
                    return Decomposition {
                        graph,
                        heuristic: false,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "Model decomposition failed, using heuristic split");
                }
            }
        }
        Decomposition {
            graph: self.heuristic(goal, category),
            heuristic: true,
        }
    }

    async fn decompose_with_model(
        &self,
        goal: &str,
        category: Option<&str>,
        correlation_id: Option<Uuid>,
    ) -> FleetResult<TaskGraph> {
        let mut request = RouteRequest::new(
            self.plan_prompt(goal),
            category.unwrap_or("reasoning"),
        )
        .with_system("You plan work. Reply with valid JSON only.")
        .with_priority(Priority::Medium);
        if let Some(id) = correlation_id {
            request = request.with_correlation_id(id);
        }
        let response = self
            .gateway
            .call(request)
            .await
            .map_err(|e| FleetError::DecompositionFailure(e.to_string()))?;
        debug!(backend = %response.backend, model = %response.model_used, "Plan received");
        self.parse_plan(&response.text, category)
    }

    fn plan_prompt(&self, goal: &str) -> String {
        let goal: String = goal.chars().take(PLAN_GOAL_CHARS).collect();
        format!(
            "Break the goal below into at most {max} subtasks.\n\
             Format: {{\"subtasks\": [{{\"title\": \"...\", \"description\": \"...\", \
             \"category\": \"...\", \"estimated_duration_min\": 30, \"dependencies\": []}}]}}\n\
             dependencies are 0-based indices of the subtasks this one waits for.\n\
             Goal: {goal}\nJSON:",
            max = self.config.max_subtasks
        )
    }

    /// Parses a model plan. Accepts fenced JSON, `subtasks` or `tasks`, a
    /// bare array, and `name`/`desc`/`duration` aliases. Self and
    /// out-of-range dependency indices are dropped.
    pub fn parse_plan(&self, text: &str, category: Option<&str>) -> FleetResult<TaskGraph> {
        let body = self.extract_json(text);
        let value: Value = serde_json::from_str(body)
            .map_err(|e| FleetError::DecompositionFailure(format!("unparsable plan: {e}")))?;
        let items = match &value {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get("subtasks")
                .or_else(|| map.get("tasks"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            _ => &[],
        };
        if items.is_empty() {
            return Err(FleetError::DecompositionFailure(
                "plan contains no subtasks".into(),
            ));
        }
        let items = &items[..items.len().min(self.config.max_subtasks.max(1))];
        let ids: Vec<Uuid> = items.iter().map(|_| Uuid::new_v4()).collect();

        let mut graph = TaskGraph::new();
        for (i, item) in items.iter().enumerate() {
            let text_field = |keys: &[&str]| {
                keys.iter()
                    .find_map(|k| item.get(*k).and_then(Value::as_str))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            let title = text_field(&["title", "name"]).unwrap_or_else(|| format!("Subtask {}", i + 1));
            let description = text_field(&["description", "desc"]).unwrap_or_else(|| title.clone());
            let sub_category = text_field(&["category"]).or_else(|| category.map(str::to_string));
            let duration = ["estimated_duration_min", "duration"]
                .iter()
                .find_map(|k| item.get(*k).and_then(Value::as_u64))
                .filter(|d| *d > 0)
                .map(|d| d.min(600) as u32)
                .unwrap_or_else(|| estimate_duration(&description, sub_category.as_deref()));

            let mut subtask = SubTask::new(description, duration).with_title(title);
            subtask.id = ids[i];
            subtask.category = sub_category;
            for dep in item
                .get("dependencies")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_u64)
            {
                let dep = dep as usize;
                if dep != i && dep < ids.len() {
                    subtask = subtask.depends_on(ids[dep]);
                }
            }
            graph.add(subtask);
        }
        graph.validate()?;
        Ok(graph)
    }

    fn extract_json<'a>(&self, text: &'a str) -> &'a str {
        let text = text.trim();
        if let Some(inner) = self.fence.captures(text).and_then(|c| c.get(1)) {
            return inner.as_str().trim();
        }
        match (text.find(['{', '[']), text.rfind(['}', ']'])) {
            (Some(start), Some(end)) if end > start => &text[start..=end],
            _ => text,
        }
    }

    /// Deterministic split. A bulleted list becomes parallel subtasks after
    /// its introduction; otherwise paragraphs, sentences or connectives form
    /// a chain.
    pub fn heuristic(&self, goal: &str, category: Option<&str>) -> TaskGraph {
        let goal = goal.trim();
        let mut graph = TaskGraph::new();

        let (intro, items) = self.split_list(goal);
        if items.len() >= 2 {
            let intro_id = (intro.chars().count() >= self.config.min_fragment_chars)
                .then(|| graph.add(self.subtask(&intro, category)));
            let items = self.cap(items.into_iter().map(|i| i.to_string()).collect());
            for item in items {
                let mut subtask = self.subtask(&item, category);
                if let Some(id) = intro_id {
                    subtask = subtask.depends_on(id);
                }
                graph.add(subtask);
            }
            return graph;
        }

        let mut previous = None;
        for fragment in self.cap(self.merge_short(self.split_fragments(goal))) {
            let mut subtask = self.subtask(&fragment, category);
            if let Some(id) = previous {
                subtask = subtask.depends_on(id);
            }
            previous = Some(graph.add(subtask));
        }
        if graph.is_empty() {
            graph.add(self.subtask(goal, category));
        }
        graph
    }

    fn subtask(&self, text: &str, category: Option<&str>) -> SubTask {
        let mut subtask = SubTask::new(text.trim(), estimate_duration(text, category));
        subtask.category = category.map(str::to_string);
        subtask
    }

    fn split_list<'a>(&self, goal: &'a str) -> (String, Vec<&'a str>) {
        let mut intro = Vec::new();
        let mut items = Vec::new();
        for line in goal.lines() {
            match self.list_item.captures(line).and_then(|c| c.get(1)) {
                Some(item) => items.push(item.as_str().trim()),
                None if items.is_empty() => intro.push(line.trim()),
                // Trailing prose after the list belongs to the last item.
                None => {}
            }
        }
        (intro.join(" ").trim().to_string(), items)
    }

    fn split_fragments(&self, goal: &str) -> Vec<String> {
        let paragraphs: Vec<String> = goal
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if paragraphs.len() >= 2 {
            return paragraphs;
        }
        let sentences: Vec<String> = self
            .sentence_end
            .split(goal)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if sentences.len() >= 2 {
            return sentences;
        }
        self.connective
            .split(goal)
            .map(|s| s.trim().trim_end_matches([',', '.']).trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Folds fragments shorter than the minimum into their predecessor (or
    /// successor, for the first one).
    fn merge_short(&self, fragments: Vec<String>) -> Vec<String> {
        let min = self.config.min_fragment_chars;
        let mut merged: Vec<String> = Vec::new();
        let mut carry = String::new();
        for fragment in fragments {
            let fragment = if carry.is_empty() {
                fragment
            } else {
                format!("{} {fragment}", std::mem::take(&mut carry))
            };
            if fragment.chars().count() >= min {
                merged.push(fragment);
            } else if let Some(last) = merged.last_mut() {
                last.push(' ');
                last.push_str(&fragment);
            } else {
                carry = fragment;
            }
        }
        if !carry.is_empty() {
            merged.push(carry);
        }
        merged
    }

    /// Joins everything past the subtask limit into the last subtask.
    fn cap(&self, mut fragments: Vec<String>) -> Vec<String> {
        let max = self.config.max_subtasks.max(1);
        if fragments.len() > max {
            let tail = fragments.split_off(max - 1).join(" ");
            fragments.push(tail);
        }
        fragments
    }
}
