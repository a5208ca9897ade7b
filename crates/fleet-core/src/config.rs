//! Typed configuration for every runtime-tunable knob of the fleet.
//!
//! The whole tree deserializes from TOML with defaults on every field, so an
//! empty file is a valid configuration. [`FleetConfig::validate`] rejects
//! values that would make the scheduler misbehave.

use crate::expert::Expert;
use crate::model::BackendId;
use crate::{FleetError, FleetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub decomposer: DecomposerConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub experts: Vec<Expert>,
}

impl FleetConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> FleetResult<Self> {
        let mut config: FleetConfig = toml::from_str(content)
            .map_err(|e| FleetError::Config(format!("Failed to parse config: {e}")))?;
        for expert in &mut config.experts {
            expert.ensure_id();
        }
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> FleetResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> FleetResult<()> {
        self.backends.validate()?;
        self.circuit_breaker.validate()?;
        self.router.validate()?;
        self.analyzer.validate()?;
        self.matching.validate()?;
        self.orchestrator.validate()?;
        self.worker.validate()?;
        if self.registry.ttl_secs == 0 {
            return Err(FleetError::Config("registry.ttl_secs must be > 0".into()));
        }
        let mut names = std::collections::HashSet::new();
        for expert in &self.experts {
            if !names.insert(expert.name.as_str()) {
                return Err(FleetError::Config(format!(
                    "duplicate expert name '{}'",
                    expert.name
                )));
            }
            if expert.max_concurrent_tasks == 0 {
                return Err(FleetError::Config(format!(
                    "expert '{}' has max_concurrent_tasks = 0",
                    expert.name
                )));
            }
        }
        Ok(())
    }
}

fn check_unit(name: &str, value: f64) -> FleetResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(FleetError::Config(format!(
            "{name} must be within 0.0..=1.0 (got {value})"
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> FleetResult<()> {
    if value == 0 {
        return Err(FleetError::Config(format!("{name} must be > 0")));
    }
    Ok(())
}

// --- Backends ---

/// Connection and capacity settings for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// Concurrent in-flight calls the backend can really take.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Requests allowed to wait in the admission queue.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    /// Deadline applied to queued requests that carry none.
    #[serde(default = "default_deadline_secs")]
    pub default_deadline_secs: u64,
    /// Model used when no category list matches.
    #[serde(default)]
    pub generic_model: Option<String>,
    /// Category → model names, best first.
    #[serde(default)]
    pub categories: BTreeMap<String, Vec<String>>,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_queue() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_list_timeout_secs() -> u64 {
    5
}

fn default_deadline_secs() -> u64 {
    300
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }

    fn validate(&self, id: BackendId) -> FleetResult<()> {
        if self.base_url.trim().is_empty() {
            return Err(FleetError::Config(format!("backends.{id}.base_url is empty")));
        }
        check_positive(&format!("backends.{id}.max_concurrent"), self.max_concurrent as u64)?;
        check_positive(&format!("backends.{id}.request_timeout_secs"), self.request_timeout_secs)?;
        check_positive(&format!("backends.{id}.default_deadline_secs"), self.default_deadline_secs)
    }
}

fn categories(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(category, models)| {
            (
                (*category).to_string(),
                models.iter().map(|m| (*m).to_string()).collect(),
            )
        })
        .collect()
}

fn default_fast_backend() -> BackendConfig {
    let light: &[&str] = &["phi3.5:3.8b", "qwen2.5:3b", "tinyllama:1.1b-chat"];
    BackendConfig {
        base_url: "http://127.0.0.1:11435".into(),
        max_concurrent: 5,
        max_queue: default_max_queue(),
        request_timeout_secs: 120,
        list_timeout_secs: default_list_timeout_secs(),
        default_deadline_secs: default_deadline_secs(),
        generic_model: Some("qwen2.5:3b".into()),
        categories: categories(&[
            ("fast", light),
            ("general", light),
            ("coding", light),
            ("reasoning", light),
        ]),
    }
}

fn default_batch_backend() -> BackendConfig {
    BackendConfig {
        base_url: "http://127.0.0.1:11434".into(),
        max_concurrent: 2,
        max_queue: default_max_queue(),
        request_timeout_secs: default_request_timeout_secs(),
        list_timeout_secs: 15,
        default_deadline_secs: default_deadline_secs(),
        generic_model: Some("qwen2.5-coder:32b".into()),
        categories: categories(&[
            ("fast", &["deepseek-r1:14b", "qwen2.5-coder:32b", "tinyllama:1.1b-chat"]),
            ("general", &["qwen2.5-coder:32b", "glm-4.7-flash:q8_0", "deepseek-r1:14b"]),
            ("coding", &["qwen2.5-coder:32b", "qwq:32b", "qwen3-coder:30b"]),
            ("reasoning", &["deepseek-r1:32b", "qwq:32b", "glm-4.7-flash:q8_0"]),
            ("complex", &["deepseek-r1:32b", "qwen2.5-coder:32b", "qwq:32b"]),
            ("vision", &["moondream:latest", "llava:7b"]),
        ]),
    }
}

fn default_fallback_order() -> Vec<BackendId> {
    BackendId::ALL.to_vec()
}

/// Both backends plus the fixed fallback order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "default_fast_backend")]
    pub fast: BackendConfig,
    #[serde(default = "default_batch_backend")]
    pub batch: BackendConfig,
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<BackendId>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_backend(),
            batch: default_batch_backend(),
            fallback_order: default_fallback_order(),
        }
    }
}

impl BackendsConfig {
    /// Settings of backend `id`.
    pub fn get(&self, id: BackendId) -> &BackendConfig {
        match id {
            BackendId::Fast => &self.fast,
            BackendId::Batch => &self.batch,
        }
    }

    fn validate(&self) -> FleetResult<()> {
        self.fast.validate(BackendId::Fast)?;
        self.batch.validate(BackendId::Batch)?;
        if self.fallback_order.is_empty() {
            return Err(FleetError::Config(
                "backends.fallback_order must name at least one backend".into(),
            ));
        }
        let mut seen = Vec::new();
        for id in &self.fallback_order {
            if seen.contains(id) {
                return Err(FleetError::Config(format!(
                    "backends.fallback_order lists '{id}' twice"
                )));
            }
            seen.push(*id);
        }
        Ok(())
    }
}

// --- Registry ---

/// Model registry scan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_registry_ttl_secs() -> u64 {
    120
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_registry_ttl_secs(),
        }
    }
}

impl RegistryConfig {
    /// Listing cache lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// --- Circuit breaker ---

/// Thresholds shared by every backend's circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (F) that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown (C) before a probe is allowed.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Cooldown multiplier after a failed probe. 1.0 disables backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_cooldown_secs() -> u64 {
    600
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Base open window.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Ceiling for the backed-off open window.
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs.max(self.cooldown_secs))
    }

    fn validate(&self) -> FleetResult<()> {
        check_positive("circuit_breaker.failure_threshold", u64::from(self.failure_threshold))?;
        if self.backoff_multiplier < 1.0 {
            return Err(FleetError::Config(
                "circuit_breaker.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

// --- Router ---

/// Response memo settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_memo_ttl_secs")]
    pub memo_ttl_secs: u64,
    /// Prompts longer than this are never memoized.
    #[serde(default = "default_memo_max_prompt_chars")]
    pub memo_max_prompt_chars: usize,
    /// Responses longer than this are never stored.
    #[serde(default = "default_memo_max_response_chars")]
    pub memo_max_response_chars: usize,
    #[serde(default = "default_memo_capacity")]
    pub memo_capacity: usize,
}

fn default_memo_ttl_secs() -> u64 {
    1800
}

fn default_memo_max_prompt_chars() -> usize {
    1000
}

fn default_memo_max_response_chars() -> usize {
    5000
}

fn default_memo_capacity() -> usize {
    500
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            memo_ttl_secs: default_memo_ttl_secs(),
            memo_max_prompt_chars: default_memo_max_prompt_chars(),
            memo_max_response_chars: default_memo_max_response_chars(),
            memo_capacity: default_memo_capacity(),
        }
    }
}

impl RouterConfig {
    /// Memo entry lifetime.
    pub fn memo_ttl(&self) -> Duration {
        Duration::from_secs(self.memo_ttl_secs)
    }

    fn validate(&self) -> FleetResult<()> {
        if self.memo_capacity > 0 && self.memo_ttl_secs == 0 {
            return Err(FleetError::Config(
                "router.memo_ttl_secs must be > 0 when the memo is enabled".into(),
            ));
        }
        Ok(())
    }
}

// --- Analyzer ---

/// Complexity thresholds and signal weights. Hot-reloadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Scores at or above this go through decomposition.
    #[serde(default = "default_complex_threshold")]
    pub complex_threshold: f64,
    /// Scores at or above this are flagged multi-domain.
    #[serde(default = "default_multi_domain_threshold")]
    pub multi_domain_threshold: f64,
    #[serde(default = "default_length_weight")]
    pub length_weight: f64,
    #[serde(default = "default_connective_weight")]
    pub connective_weight: f64,
    #[serde(default = "default_domain_weight")]
    pub domain_weight: f64,
    #[serde(default = "default_deliverable_weight")]
    pub deliverable_weight: f64,
    /// Goal length (chars) at which the length signal saturates.
    #[serde(default = "default_long_goal_chars")]
    pub long_goal_chars: usize,
    /// Words and phrases that signal a multi-step goal.
    #[serde(default = "default_connectives")]
    pub connectives: Vec<String>,
    /// Category → keywords that reveal the category.
    #[serde(default = "default_domain_keywords")]
    pub domain_keywords: BTreeMap<String, Vec<String>>,
}

fn default_complex_threshold() -> f64 {
    0.6
}

fn default_multi_domain_threshold() -> f64 {
    0.85
}

fn default_length_weight() -> f64 {
    0.25
}

fn default_connective_weight() -> f64 {
    0.3
}

fn default_domain_weight() -> f64 {
    0.3
}

fn default_deliverable_weight() -> f64 {
    0.15
}

fn default_long_goal_chars() -> usize {
    600
}

fn default_connectives() -> Vec<String> {
    [
        "then",
        "after that",
        "afterwards",
        "finally",
        "first",
        "next",
        "followed by",
        "once",
        "before",
        "and also",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_domain_keywords() -> BTreeMap<String, Vec<String>> {
    categories(&[
        (
            "coding",
            &["code", "implement", "refactor", "function", "bug", "compile", "api", "endpoint"],
        ),
        (
            "data",
            &["sql", "database", "query", "dataset", "schema", "migration", "etl"],
        ),
        (
            "reasoning",
            &["analyze", "analyse", "evaluate", "compare", "prove", "plan", "strategy"],
        ),
        (
            "research",
            &["research", "investigate", "survey", "sources", "literature"],
        ),
        (
            "writing",
            &["write", "document", "report", "summary", "summarize", "article", "email"],
        ),
        (
            "ops",
            &["deploy", "docker", "server", "monitor", "kubernetes", "backup", "infrastructure"],
        ),
    ])
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            complex_threshold: default_complex_threshold(),
            multi_domain_threshold: default_multi_domain_threshold(),
            length_weight: default_length_weight(),
            connective_weight: default_connective_weight(),
            domain_weight: default_domain_weight(),
            deliverable_weight: default_deliverable_weight(),
            long_goal_chars: default_long_goal_chars(),
            connectives: default_connectives(),
            domain_keywords: default_domain_keywords(),
        }
    }
}

impl AnalyzerConfig {
    /// Rejects values outside `0..=1` and thresholds out of order.
    pub fn validate(&self) -> FleetResult<()> {
        check_unit("analyzer.complex_threshold", self.complex_threshold)?;
        check_unit("analyzer.multi_domain_threshold", self.multi_domain_threshold)?;
        if self.multi_domain_threshold < self.complex_threshold {
            return Err(FleetError::Config(format!(
                "analyzer.multi_domain_threshold ({}) is below complex_threshold ({})",
                self.multi_domain_threshold, self.complex_threshold
            )));
        }
        for (name, weight) in [
            ("analyzer.length_weight", self.length_weight),
            ("analyzer.connective_weight", self.connective_weight),
            ("analyzer.domain_weight", self.domain_weight),
            ("analyzer.deliverable_weight", self.deliverable_weight),
        ] {
            check_unit(name, weight)?;
        }
        check_positive("analyzer.long_goal_chars", self.long_goal_chars as u64)
    }
}

// --- Decomposer ---

/// Decomposition limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposerConfig {
    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,
    /// Heuristic fragments shorter than this merge into their neighbour.
    #[serde(default = "default_min_fragment_chars")]
    pub min_fragment_chars: usize,
    /// Skip the language-model path entirely.
    #[serde(default)]
    pub heuristic_only: bool,
}

fn default_max_subtasks() -> usize {
    6
}

fn default_min_fragment_chars() -> usize {
    20
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_subtasks: default_max_subtasks(),
            min_fragment_chars: default_min_fragment_chars(),
            heuristic_only: false,
        }
    }
}

// --- Matching ---

/// Expert ranking weights. Hot-reloadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_proficiency_weight")]
    pub proficiency_weight: f64,
    #[serde(default = "default_load_weight")]
    pub load_weight: f64,
    #[serde(default = "default_success_weight")]
    pub success_weight: f64,
    /// Proficiency assumed for department-level candidates.
    #[serde(default = "default_fallback_proficiency")]
    pub fallback_proficiency: f64,
    /// Proficiency difference still counted as equal fit when rebalancing.
    #[serde(default = "default_fit_tolerance")]
    pub fit_tolerance: f64,
    /// Consider every expert when neither specialization nor department matches.
    #[serde(default = "default_true")]
    pub allow_any_expert: bool,
    /// Success rate assumed for experts without history.
    #[serde(default = "default_success_rate")]
    pub default_success_rate: f64,
}

fn default_proficiency_weight() -> f64 {
    0.6
}

fn default_load_weight() -> f64 {
    0.25
}

fn default_success_weight() -> f64 {
    0.15
}

fn default_fallback_proficiency() -> f64 {
    0.3
}

fn default_fit_tolerance() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_success_rate() -> f64 {
    1.0
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            proficiency_weight: default_proficiency_weight(),
            load_weight: default_load_weight(),
            success_weight: default_success_weight(),
            fallback_proficiency: default_fallback_proficiency(),
            fit_tolerance: default_fit_tolerance(),
            allow_any_expert: true,
            default_success_rate: default_success_rate(),
        }
    }
}

impl MatchingConfig {
    /// Rejects values outside `0..=1` and all-zero weights.
    pub fn validate(&self) -> FleetResult<()> {
        for (name, value) in [
            ("matching.proficiency_weight", self.proficiency_weight),
            ("matching.load_weight", self.load_weight),
            ("matching.success_weight", self.success_weight),
            ("matching.fallback_proficiency", self.fallback_proficiency),
            ("matching.fit_tolerance", self.fit_tolerance),
            ("matching.default_success_rate", self.default_success_rate),
        ] {
            check_unit(name, value)?;
        }
        if self.proficiency_weight + self.load_weight + self.success_weight <= 0.0 {
            return Err(FleetError::Config(
                "matching weights must not all be zero".into(),
            ));
        }
        Ok(())
    }
}

// --- Orchestrator ---

/// Control loop cadence and rebalancing thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Shorter sleep used while unassigned tasks remain.
    #[serde(default = "default_quick_poll_secs")]
    pub quick_poll_secs: u64,
    /// Unassigned tasks processed per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Rebalance every N cycles. 0 disables rebalancing.
    #[serde(default = "default_rebalance_every")]
    pub rebalance_every: u64,
    /// Load above which an expert sheds unstarted tasks.
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: f64,
    /// Load below which an expert may receive shed tasks.
    #[serde(default = "default_underload_threshold")]
    pub underload_threshold: f64,
    /// Decomposition depth limit. Children at this depth are never split.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_quick_poll_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    50
}

fn default_rebalance_every() -> u64 {
    5
}

fn default_overload_threshold() -> f64 {
    1.0
}

fn default_underload_threshold() -> f64 {
    0.5
}

fn default_max_depth() -> u32 {
    1
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            quick_poll_secs: default_quick_poll_secs(),
            batch_size: default_batch_size(),
            rebalance_every: default_rebalance_every(),
            overload_threshold: default_overload_threshold(),
            underload_threshold: default_underload_threshold(),
            max_depth: default_max_depth(),
        }
    }
}

impl OrchestratorConfig {
    /// Sleep between cycles when nothing is waiting.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Sleep between cycles while unassigned tasks remain.
    pub fn quick_poll(&self) -> Duration {
        Duration::from_secs(self.quick_poll_secs)
    }

    fn validate(&self) -> FleetResult<()> {
        check_positive("orchestrator.interval_secs", self.interval_secs)?;
        check_positive("orchestrator.batch_size", self.batch_size as u64)?;
        if self.underload_threshold >= self.overload_threshold {
            return Err(FleetError::Config(
                "orchestrator.underload_threshold must be below overload_threshold".into(),
            ));
        }
        Ok(())
    }
}

// --- Worker ---

/// Worker pool concurrency, leases and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Pool-wide in-flight task limit.
    #[serde(default = "default_worker_concurrency")]
    pub max_concurrent: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Leases older than this are reclaimed by the reaper.
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Failed attempts after which a task is marked failed.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Deadline for one task's backend call, fallbacks included.
    #[serde(default = "default_call_deadline_secs")]
    pub call_deadline_secs: u64,
    #[serde(default = "default_min_result_chars")]
    pub min_result_chars: usize,
    /// Characters of each dependency result passed as context.
    #[serde(default = "default_dependency_context_chars")]
    pub dependency_context_chars: usize,
}

fn default_worker_concurrency() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_secs() -> u64 {
    20
}

fn default_stuck_threshold_secs() -> u64 {
    3600
}

fn default_reaper_interval_secs() -> u64 {
    300
}

fn default_retry_limit() -> u32 {
    3
}

fn default_call_deadline_secs() -> u64 {
    600
}

fn default_min_result_chars() -> usize {
    1
}

fn default_dependency_context_chars() -> usize {
    2000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_worker_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            retry_limit: default_retry_limit(),
            call_deadline_secs: default_call_deadline_secs(),
            min_result_chars: default_min_result_chars(),
            dependency_context_chars: default_dependency_context_chars(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Lease age after which the reaper reclaims a task.
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    /// Upper bound on one backend call, queueing included.
    pub fn call_deadline(&self) -> Duration {
        Duration::from_secs(self.call_deadline_secs)
    }

    fn validate(&self) -> FleetResult<()> {
        check_positive("worker.max_concurrent", self.max_concurrent as u64)?;
        check_positive("worker.retry_limit", u64::from(self.retry_limit))?;
        check_positive("worker.heartbeat_secs", self.heartbeat_secs)?;
        check_positive("worker.call_deadline_secs", self.call_deadline_secs)?;
        if self.heartbeat_secs >= self.stuck_threshold_secs {
            return Err(FleetError::Config(format!(
                "worker.heartbeat_secs ({}) must be shorter than stuck_threshold_secs ({})",
                self.heartbeat_secs, self.stuck_threshold_secs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown(), Duration::from_secs(60));
        assert_eq!(config.backends.fast.max_concurrent, 5);
        assert_eq!(config.backends.batch.max_concurrent, 2);
        assert_eq!(config.backends.fallback_order, vec![BackendId::Fast, BackendId::Batch]);
        assert_eq!(config.router.memo_max_prompt_chars, 1000);
        assert_eq!(config.worker.retry_limit, 3);
        assert!((config.analyzer.complex_threshold - 0.6).abs() < f64::EPSILON);
        assert!(config.experts.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let config = FleetConfig::from_toml_str(
            r#"
[backends]
fallback_order = ["batch", "fast"]

[backends.fast]
base_url = "http://fast.local:9000"
max_concurrent = 8

[analyzer]
complex_threshold = 0.5

[[experts]]
name = "Ada"
department = "engineering"
specializations = { coding = 0.9 }
preferred_models = ["qwen2.5-coder:32b"]
"#,
        )
        .unwrap();
        assert_eq!(config.backends.fast.base_url, "http://fast.local:9000");
        assert_eq!(config.backends.fast.max_concurrent, 8);
        assert_eq!(config.backends.fast.max_queue, 50);
        assert!(config.backends.fast.categories.is_empty());
        assert_eq!(config.backends.batch.max_concurrent, 2);
        assert_eq!(config.backends.fallback_order[0], BackendId::Batch);
        assert!((config.analyzer.multi_domain_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.experts.len(), 1);
        assert!(!config.experts[0].id.is_nil());
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = FleetConfig::from_toml_str(
            r#"
[analyzer]
complex_threshold = 0.9
multi_domain_threshold = 0.7
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("multi_domain_threshold"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = FleetConfig::from_toml_str(
            r#"
[backends.batch]
base_url = "http://batch.local"
max_concurrent = 0
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn test_rejects_duplicate_fallback() {
        let err = FleetConfig::from_toml_str(
            r#"
[backends]
fallback_order = ["fast", "fast"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_rejects_heartbeat_longer_than_lease() {
        let err = FleetConfig::from_toml_str(
            r#"
[worker]
heartbeat_secs = 120
stuck_threshold_secs = 60
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "[worker]\nretry_limit = 5").unwrap();
        let config = FleetConfig::load(tmp.path()).unwrap();
        assert_eq!(config.worker.retry_limit, 5);
    }

    #[test]
    fn test_load_missing_file() {
        let err = FleetConfig::load(Path::new("/nonexistent/fleet.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_invalid_toml() {
        let err = FleetConfig::from_toml_str("[worker\nretry_limit = ").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
