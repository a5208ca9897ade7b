//! Model registry: which models each backend serves right now.
//!
//! The registry periodically lists both backends and keeps one
//! [`ModelDescriptor`] per (backend, model). A backend whose listing fails
//! keeps its previous descriptors, marked unavailable, so one dead backend
//! never empties the whole registry.

use crate::backends::InferenceBackend;
use fleet_core::config::{BackendsConfig, RegistryConfig};
use fleet_core::{BackendId, FleetError, FleetResult, ModelDescriptor};
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Snapshot {
    descriptors: Vec<ModelDescriptor>,
    refreshed_at: Option<Instant>,
    errors: HashMap<BackendId, String>,
}

/// Serializable registry view for the CLI and monitors.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryReport {
    pub models: Vec<ModelDescriptor>,
    pub errors: HashMap<BackendId, String>,
    pub refreshed_ms_ago: Option<u64>,
}

/// Shared service object; construct once per process and pass by `Arc`.
pub struct ModelRegistry {
    backends: Vec<Arc<dyn InferenceBackend>>,
    config: BackendsConfig,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    scan_lock: tokio::sync::Mutex<()>,
}

/// Approximate cost from a parameter-size tag such as `32b` or `3.8b`.
pub fn estimate_cost(model: &str) -> f64 {
    model
        .split([':', '-', '_', '/'])
        .filter_map(|token| {
            let token = token.to_ascii_lowercase();
            let digits = token.strip_suffix('b')?;
            digits.parse::<f64>().ok().filter(|v| *v > 0.0)
        })
        .next()
        .unwrap_or(1.0)
}

/// A listed name matches a preference entry exactly, or by family when the
/// preference carries no tag (`llava` matches `llava:7b`).
fn model_matches(preferred: &str, listed: &str) -> bool {
    let preferred = preferred.to_ascii_lowercase();
    let listed = listed.to_ascii_lowercase();
    if preferred == listed {
        return true;
    }
    !preferred.contains(':') && listed.split(':').next() == Some(preferred.as_str())
}

impl ModelRegistry {
    /// Backends are kept in the configured fallback order.
    pub fn new(
        backends: Vec<Arc<dyn InferenceBackend>>,
        config: &BackendsConfig,
        registry: &RegistryConfig,
    ) -> Self {
        let mut ordered: Vec<Arc<dyn InferenceBackend>> = Vec::with_capacity(backends.len());
        for id in &config.fallback_order {
            if let Some(b) = backends.iter().find(|b| b.id() == *id) {
                ordered.push(Arc::clone(b));
            }
        }
        for b in backends {
            if !ordered.iter().any(|o| o.id() == b.id()) {
                ordered.push(b);
            }
        }
        Self {
            backends: ordered,
            config: config.clone(),
            ttl: registry.ttl(),
            snapshot: RwLock::new(Snapshot::default()),
            scan_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backend ids in fallback order.
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.backends.iter().map(|b| b.id()).collect()
    }

    /// Whether the last refresh is younger than the TTL.
    pub fn is_fresh(&self) -> bool {
        self.snapshot
            .read()
            .refreshed_at
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Rescans every backend unless the cache is still within its TTL.
    /// `force` bypasses the TTL. Never fails: a failing backend only has its
    /// descriptors marked unavailable.
    pub async fn refresh(&self, force: bool) {
        let _scan = self.scan_lock.lock().await;
        if !force && self.is_fresh() {
            return;
        }

        let results = join_all(self.backends.iter().map(|backend| async move {
            (backend.id(), backend.list_models().await)
        }))
        .await;

        let previous = self.snapshot.read().descriptors.clone();
        let mut descriptors = Vec::new();
        let mut errors = HashMap::new();
        for (id, result) in results {
            match result {
                Ok(names) => {
                    debug!(backend = %id, models = names.len(), "Backend listing ok");
                    for name in names {
                        descriptors.push(self.describe(id, name));
                    }
                }
                Err(e) => {
                    warn!(backend = %id, error = %e, "Backend listing failed, marking its models unavailable");
                    descriptors.extend(previous.iter().filter(|d| d.backend == id).map(|d| {
                        ModelDescriptor {
                            available: false,
                            ..d.clone()
                        }
                    }));
                    errors.insert(id, e.to_string());
                }
            }
        }

        let available = descriptors.iter().filter(|d| d.available).count();
        let mut snapshot = self.snapshot.write();
        snapshot.descriptors = descriptors;
        snapshot.errors = errors;
        snapshot.refreshed_at = Some(Instant::now());
        info!(available, total = snapshot.descriptors.len(), "Model registry refreshed");
    }

    fn describe(&self, backend: BackendId, name: String) -> ModelDescriptor {
        let categories = self
            .config
            .get(backend)
            .categories
            .iter()
            .filter(|(_, models)| models.iter().any(|m| model_matches(m, &name)))
            .map(|(category, _)| category.clone())
            .collect();
        ModelDescriptor {
            backend,
            cost: estimate_cost(&name),
            name,
            categories,
            available: true,
        }
    }

    fn find_available(&self, backend: BackendId, preferred: &str) -> Option<ModelDescriptor> {
        self.snapshot
            .read()
            .descriptors
            .iter()
            .find(|d| d.backend == backend && d.available && model_matches(preferred, &d.name))
            .cloned()
    }

    /// Best available model for a category across backends, walking the
    /// fallback order and each backend's preference list.
    ///
    /// `NoModelForCategory` means "use a generic default", not a hard error.
    pub fn best_model(&self, category: &str) -> FleetResult<ModelDescriptor> {
        for id in self.backend_ids() {
            let Some(preferred) = self.config.get(id).categories.get(category) else {
                continue;
            };
            if let Some(found) = preferred.iter().find_map(|m| self.find_available(id, m)) {
                return Ok(found);
            }
        }
        Err(FleetError::NoModelForCategory(category.to_string()))
    }

    /// Model to use on one specific backend: its category list, then its
    /// generic model, then anything it serves.
    pub fn best_model_on(&self, backend: BackendId, category: &str) -> Option<ModelDescriptor> {
        let config = self.config.get(backend);
        if let Some(found) = config
            .categories
            .get(category)
            .and_then(|preferred| preferred.iter().find_map(|m| self.find_available(backend, m)))
        {
            return Some(found);
        }
        if let Some(found) = config
            .generic_model
            .as_deref()
            .and_then(|m| self.find_available(backend, m))
        {
            return Some(found);
        }
        self.snapshot
            .read()
            .descriptors
            .iter()
            .filter(|d| d.backend == backend && d.available)
            .min_by(|a, b| a.cost.total_cmp(&b.cost))
            .cloned()
    }

    /// Configured fallback model of `backend`.
    pub fn generic_model(&self, backend: BackendId) -> Option<String> {
        self.config.get(backend).generic_model.clone()
    }

    /// Whether `backend` currently serves `model`.
    pub fn is_available(&self, backend: BackendId, model: &str) -> bool {
        self.find_available(backend, model).is_some()
    }

    /// First backend (in fallback order) currently serving `model`.
    pub fn backend_for_model(&self, model: &str) -> Option<BackendId> {
        self.backend_ids()
            .into_iter()
            .find(|id| self.is_available(*id, model))
    }

    /// Descriptor of the first available model matching `model`, in
    /// fallback order. Family names resolve to the listed tag.
    pub fn lookup(&self, model: &str) -> Option<ModelDescriptor> {
        self.backend_ids()
            .into_iter()
            .find_map(|id| self.find_available(id, model))
    }

    /// Whether any backend reported at least one model.
    pub fn has_available_models(&self) -> bool {
        self.snapshot.read().descriptors.iter().any(|d| d.available)
    }

    /// Every known descriptor, available or not.
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.snapshot.read().descriptors.clone()
    }

    /// Per-backend listing for operators.
    pub fn report(&self) -> RegistryReport {
        let snapshot = self.snapshot.read();
        RegistryReport {
            models: snapshot.descriptors.clone(),
            errors: snapshot.errors.clone(),
            refreshed_ms_ago: snapshot
                .refreshed_at
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }

    /// Rescans every TTL in the background. Abort the handle to stop.
    pub fn spawn_refresh(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.refresh(true).await;
                tokio::time::sleep(self.ttl).await;
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::backends::{GenerateRequest, GenerateResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ListingBackend {
        id: BackendId,
        models: Vec<String>,
        down: AtomicBool,
        listings: AtomicU32,
    }

    impl ListingBackend {
        fn new(id: BackendId, models: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                id,
                models: models.iter().map(|m| (*m).to_string()).collect(),
                down: AtomicBool::new(false),
                listings: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for ListingBackend {
        fn id(&self) -> BackendId {
            self.id
        }

        async fn list_models(&self) -> FleetResult<Vec<String>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(FleetError::Backend {
                    backend: self.id,
                    message: "connection refused".into(),
                });
            }
            Ok(self.models.clone())
        }

        async fn generate(&self, request: &GenerateRequest) -> FleetResult<GenerateResponse> {
            Ok(GenerateResponse {
                text: request.prompt.clone(),
                model_used: request.model.clone(),
            })
        }
    }

    fn registry(fast: Arc<ListingBackend>, batch: Arc<ListingBackend>) -> ModelRegistry {
        ModelRegistry::new(
            vec![batch, fast],
            &BackendsConfig::default(),
            &RegistryConfig { ttl_secs: 120 },
        )
    }

    #[test]
    fn test_estimate_cost() {
        assert_eq!(estimate_cost("qwen2.5-coder:32b"), 32.0);
        assert_eq!(estimate_cost("phi3.5:3.8b"), 3.8);
        assert_eq!(estimate_cost("tinyllama:1.1b-chat"), 1.1);
        assert_eq!(estimate_cost("moondream:latest"), 1.0);
    }

    #[test]
    fn test_model_matches_family() {
        assert!(model_matches("llava", "llava:7b"));
        assert!(model_matches("QWQ:32b", "qwq:32b"));
        assert!(!model_matches("llava:13b", "llava:7b"));
    }

    #[tokio::test]
    async fn test_best_model_follows_fallback_order() {
        let fast = ListingBackend::new(BackendId::Fast, &["qwen2.5:3b", "tinyllama:1.1b-chat"]);
        let batch = ListingBackend::new(BackendId::Batch, &["qwen2.5-coder:32b", "qwq:32b"]);
        let reg = registry(fast, batch);
        assert_eq!(reg.backend_ids(), vec![BackendId::Fast, BackendId::Batch]);

        reg.refresh(false).await;
        let best = reg.best_model("coding").unwrap();
        assert_eq!(best.backend, BackendId::Fast);
        assert_eq!(best.name, "qwen2.5:3b");
        assert!(best.serves("coding"));

        // Only the batch backend lists a "complex" category.
        let best = reg.best_model("complex").unwrap();
        assert_eq!(best.backend, BackendId::Batch);
        assert_eq!(best.name, "qwen2.5-coder:32b");
        assert!((best.cost - 32.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_lookup_resolves_family_to_listed_tag() {
        let fast = ListingBackend::new(BackendId::Fast, &["qwen2.5:3b"]);
        let batch = ListingBackend::new(BackendId::Batch, &["llava:7b"]);
        let reg = registry(fast, batch);
        reg.refresh(true).await;
        let found = reg.lookup("llava").unwrap();
        assert_eq!(found.backend, BackendId::Batch);
        assert_eq!(found.name, "llava:7b");
        assert!(reg.lookup("mistral").is_none());
    }

    #[tokio::test]
    async fn test_no_model_for_category() {
        let fast = ListingBackend::new(BackendId::Fast, &["qwen2.5:3b"]);
        let batch = ListingBackend::new(BackendId::Batch, &["qwq:32b"]);
        let reg = registry(fast, batch);
        reg.refresh(true).await;
        assert!(matches!(
            reg.best_model("vision"),
            Err(FleetError::NoModelForCategory(c)) if c == "vision"
        ));
        assert!(matches!(reg.best_model("astrology"), Err(FleetError::NoModelForCategory(_))));
    }

    #[tokio::test]
    async fn test_failed_listing_marks_backend_unavailable() {
        let fast = ListingBackend::new(BackendId::Fast, &["qwen2.5:3b"]);
        let batch = ListingBackend::new(BackendId::Batch, &["qwq:32b"]);
        let reg = registry(fast.clone(), batch.clone());
        reg.refresh(true).await;
        assert!(reg.is_available(BackendId::Fast, "qwen2.5:3b"));

        fast.down.store(true, Ordering::SeqCst);
        reg.refresh(true).await;
        assert!(!reg.is_available(BackendId::Fast, "qwen2.5:3b"));
        assert!(reg.is_available(BackendId::Batch, "qwq:32b"));
        let report = reg.report();
        assert_eq!(report.models.len(), 2);
        assert!(report.errors.contains_key(&BackendId::Fast));
        assert_eq!(reg.backend_for_model("qwq:32b"), Some(BackendId::Batch));
        assert_eq!(reg.backend_for_model("qwen2.5:3b"), None);
    }

    #[tokio::test]
    async fn test_ttl_skips_rescan_unless_forced() {
        let fast = ListingBackend::new(BackendId::Fast, &["qwen2.5:3b"]);
        let batch = ListingBackend::new(BackendId::Batch, &[]);
        let reg = registry(fast.clone(), batch);
        reg.refresh(false).await;
        reg.refresh(false).await;
        assert_eq!(fast.listings.load(Ordering::SeqCst), 1);
        reg.refresh(true).await;
        assert_eq!(fast.listings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_best_model_on_falls_back_to_generic_then_cheapest() {
        let fast = ListingBackend::new(BackendId::Fast, &["qwen2.5:3b"]);
        let batch = ListingBackend::new(BackendId::Batch, &["llava:7b", "deepseek-r1:70b"]);
        let reg = registry(fast, batch);
        reg.refresh(true).await;

        // "vision" list on batch names llava:7b.
        assert_eq!(reg.best_model_on(BackendId::Batch, "vision").unwrap().name, "llava:7b");
        // Generic model for fast is qwen2.5:3b.
        assert_eq!(reg.best_model_on(BackendId::Fast, "astrology").unwrap().name, "qwen2.5:3b");
        // Batch generic (qwen2.5-coder:32b) is missing: cheapest listed wins.
        assert_eq!(reg.best_model_on(BackendId::Batch, "astrology").unwrap().name, "llava:7b");
    }
}
