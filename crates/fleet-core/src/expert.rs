use crate::model::BackendId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

fn default_max_concurrent_tasks() -> u32 {
    3
}

/// A logical worker identity with a specialization profile.
///
/// Experts are provisioned from configuration. The matching engine only
/// reads proficiency and load; it never mutates an expert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expert {
    /// Stable id. Derived from the name when omitted in configuration.
    #[serde(default = "Uuid::nil")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub department: String,
    /// Category → proficiency in `0.0..=1.0`.
    #[serde(default)]
    pub specializations: HashMap<String, f64>,
    /// Models this expert works with, best first. Empty means any model.
    #[serde(default)]
    pub preferred_models: Vec<String>,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: u32,
}

impl Expert {
    /// Expert with a stable id derived from its name.
    pub fn new(name: impl Into<String>, department: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Self::id_for_name(&name),
            name,
            department: department.into(),
            specializations: HashMap::new(),
            preferred_models: Vec::new(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }

    /// Deterministic id for an expert name, so restarts keep assignments valid.
    pub fn id_for_name(name: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("fleet-expert:{name}").as_bytes())
    }

    /// Adds a category with a proficiency in `0.0..=1.0`.
    pub fn with_specialization(mut self, category: impl Into<String>, proficiency: f64) -> Self {
        self.specializations
            .insert(category.into(), proficiency.clamp(0.0, 1.0));
        self
    }

    /// Appends a preferred model, best first.
    pub fn with_preferred_model(mut self, model: impl Into<String>) -> Self {
        self.preferred_models.push(model.into());
        self
    }

    /// Caps concurrent assigned tasks.
    pub fn with_max_concurrent_tasks(mut self, max: u32) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Proficiency for a category, if the expert is specialized in it.
    pub fn proficiency(&self, category: &str) -> Option<f64> {
        self.specializations.get(category).copied()
    }

    /// Fills a missing id from the name.
    pub fn ensure_id(&mut self) {
        if self.id.is_nil() {
            self.id = Self::id_for_name(&self.name);
        }
    }
}

/// Output of matching, written onto the task row by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub expert_id: Uuid,
    pub backend_hint: Option<BackendId>,
    pub model_hint: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_expert_id_is_stable() {
        let a = Expert::new("Ada", "engineering");
        let b = Expert::new("Ada", "research");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, Expert::new("Grace", "engineering").id);
    }

    #[test]
    fn test_proficiency_clamped() {
        let e = Expert::new("Ada", "engineering").with_specialization("coding", 1.7);
        assert_eq!(e.proficiency("coding"), Some(1.0));
        assert_eq!(e.proficiency("writing"), None);
    }

    #[test]
    fn test_deserialize_without_id() {
        let mut e: Expert = toml::from_str(
            r#"
name = "Linus"
department = "engineering"
specializations = { coding = 0.9 }
"#,
        )
        .unwrap();
        assert!(e.id.is_nil());
        e.ensure_id();
        assert_eq!(e.id, Expert::id_for_name("Linus"));
        assert_eq!(e.max_concurrent_tasks, 3);
    }
}
