//! Goal complexity classification.
//!
//! Four lexical signals, each in `0.0..=1.0`, are combined with configurable
//! weights into one score. Thresholds and weights live in
//! [`AnalyzerConfig`] and can be swapped at runtime.

use fleet_core::config::AnalyzerConfig;
use fleet_core::{FleetResult, Priority};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Category used when no domain keyword matches.
pub const GENERAL_CATEGORY: &str = "general";

/// Coarse routing class of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityClass {
    Simple,
    Complex,
    MultiDomain,
}

impl std::fmt::Display for ComplexityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComplexityClass::Simple => write!(f, "simple"),
            ComplexityClass::Complex => write!(f, "complex"),
            ComplexityClass::MultiDomain => write!(f, "multi_domain"),
        }
    }
}

/// Raw signal values before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Signals {
    pub length: f64,
    pub connectives: f64,
    pub domains: f64,
    pub deliverables: f64,
}

/// Classification result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Complexity {
    pub class: ComplexityClass,
    pub score: f64,
    /// Matched categories, most keyword hits first.
    pub domains: Vec<String>,
    pub signals: Signals,
}

impl Complexity {
    /// Complex and multi-domain goals are split.
    pub fn needs_decomposition(&self) -> bool {
        self.class != ComplexityClass::Simple
    }

    /// Widens matching across departments.
    pub fn is_multi_domain(&self) -> bool {
        self.class == ComplexityClass::MultiDomain
    }

    /// Dominant category, or [`GENERAL_CATEGORY`].
    pub fn primary_category(&self) -> &str {
        self.domains
            .first()
            .map(String::as_str)
            .unwrap_or(GENERAL_CATEGORY)
    }
}

/// Lowercases and keeps only alphanumeric words, padded with spaces so
/// phrases can be matched on word boundaries.
fn normalize(text: &str) -> String {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    format!(" {} ", words.join(" "))
}

fn contains_phrase(normalized: &str, phrase: &str) -> bool {
    let phrase = normalize(phrase);
    !phrase.trim().is_empty() && normalized.contains(&phrase)
}

/// Lines that look like list items: `- x`, `* x`, `1. x`, `2) x`.
fn count_list_items(goal: &str) -> usize {
    goal.lines()
        .map(str::trim_start)
        .filter(|line| {
            if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("• ") {
                return true;
            }
            let digits = line.chars().take_while(char::is_ascii_digit).count();
            digits > 0
                && matches!(line[digits..].chars().next(), Some('.') | Some(')'))
                && line[digits + 1..].starts_with(' ')
        })
        .count()
}

/// Classifies goals as simple, complex or multi-domain.
pub struct ComplexityAnalyzer {
    config: Arc<RwLock<AnalyzerConfig>>,
}

impl ComplexityAnalyzer {
    /// Analyzer with the given thresholds and keywords.
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the live settings.
    pub fn config(&self) -> AnalyzerConfig {
        self.config.read().clone()
    }

    /// Swaps thresholds and weights in place. Invalid configs are rejected
    /// and the current one stays active.
    pub fn update_config(&self, config: AnalyzerConfig) -> FleetResult<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Scores `goal` and picks its class.
    pub fn classify(&self, goal: &str) -> Complexity {
        let config = self.config.read();
        let normalized = normalize(goal);

        let length = (goal.chars().count() as f64 / config.long_goal_chars.max(1) as f64).min(1.0);

        let connective_hits = config
            .connectives
            .iter()
            .filter(|c| contains_phrase(&normalized, c))
            .count();
        let connectives = (connective_hits as f64 / 3.0).min(1.0);

        let domain_hits = self.domain_hits(&config.domain_keywords, &normalized);
        let domains_signal = (domain_hits.len().saturating_sub(1) as f64 / 2.0).min(1.0);

        let deliverables = (count_list_items(goal) as f64 / 3.0).min(1.0);

        let score = (config.length_weight * length
            + config.connective_weight * connectives
            + config.domain_weight * domains_signal
            + config.deliverable_weight * deliverables)
            .clamp(0.0, 1.0);

        let class = if score >= config.multi_domain_threshold {
            ComplexityClass::MultiDomain
        } else if score >= config.complex_threshold {
            ComplexityClass::Complex
        } else {
            ComplexityClass::Simple
        };

        Complexity {
            class,
            score,
            domains: domain_hits.into_iter().map(|(c, _)| c).collect(),
            signals: Signals {
                length,
                connectives,
                domains: domains_signal,
                deliverables,
            },
        }
    }

    /// Category with the most keyword hits, or [`GENERAL_CATEGORY`].
    pub fn infer_category(&self, goal: &str) -> String {
        let config = self.config.read();
        self.domain_hits(&config.domain_keywords, &normalize(goal))
            .into_iter()
            .next()
            .map(|(c, _)| c)
            .unwrap_or_else(|| GENERAL_CATEGORY.to_string())
    }

    /// Categories with at least one keyword present, most hits first, then
    /// by name.
    fn domain_hits(
        &self,
        keywords: &BTreeMap<String, Vec<String>>,
        normalized: &str,
    ) -> Vec<(String, usize)> {
        let mut hits: Vec<(String, usize)> = keywords
            .iter()
            .map(|(category, words)| {
                let count = words
                    .iter()
                    .filter(|w| contains_phrase(normalized, w))
                    .count();
                (category.clone(), count)
            })
            .filter(|(_, count)| *count > 0)
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits
    }
}

/// Priority implied by wording such as "urgent" or "low priority".
pub fn priority_hint(goal: &str) -> Option<Priority> {
    let normalized = normalize(goal);
    const HIGH: [&str; 5] = ["urgent", "asap", "critical", "immediately", "high priority"];
    const LOW: [&str; 4] = ["low priority", "whenever", "no rush", "when you have time"];
    if HIGH.iter().any(|k| contains_phrase(&normalized, k)) {
        Some(Priority::High)
    } else if LOW.iter().any(|k| contains_phrase(&normalized, k)) {
        Some(Priority::Low)
    } else {
        None
    }
}
