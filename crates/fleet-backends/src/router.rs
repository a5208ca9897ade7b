//! Backend router: memo, candidate chain, and per-backend queue + breaker.

use crate::admission::{AdmissionQueue, AdmissionStats, OverflowPolicy};
use crate::backends::{GenerateRequest, InferenceBackend};
use crate::chain::{Candidate, CandidateChain};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::memo::{MemoHit, MemoStats, ResponseMemo};
use crate::registry::ModelRegistry;
use async_trait::async_trait;
use fleet_core::{BackendId, FleetConfig, FleetError, FleetResult, Priority};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One inference call as seen by the router.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub category: String,
    pub preferred_backend: Option<BackendId>,
    pub model: Option<String>,
    pub images: Vec<String>,
    pub priority: Priority,
    /// Per-attempt deadline; the backend default applies when `None`.
    pub deadline: Option<Duration>,
    pub policy: OverflowPolicy,
    pub correlation_id: Option<Uuid>,
}

impl RouteRequest {
    /// Medium priority, blocking admission, no preferred backend.
    pub fn new(prompt: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            category: category.into(),
            preferred_backend: None,
            model: None,
            images: Vec::new(),
            priority: Priority::Medium,
            deadline: None,
            policy: OverflowPolicy::Block,
            correlation_id: None,
        }
    }

    /// Sets the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Backend to try first when its breaker is not open.
    pub fn with_preferred_backend(mut self, backend: Option<BackendId>) -> Self {
        self.preferred_backend = backend;
        self
    }

    /// Model to request on the preferred backend.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    /// Attaches images; such requests are never memoized.
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    /// Admission priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// How long the request may wait for a queue slot.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// What to do when a backend queue is full.
    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Correlation id carried into logs.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// A routed answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteResponse {
    pub text: String,
    pub model_used: String,
    pub backend: BackendId,
    /// Served from the memo without touching a backend.
    pub memoized: bool,
    /// Candidates tried, including the successful one.
    pub attempts: usize,
}

/// Anything that can serve an inference call. Implemented by
/// [`BackendRouter`]; orchestration code depends only on this trait.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn call(&self, request: RouteRequest) -> FleetResult<RouteResponse>;

    /// Backend and model the request would most likely land on, used to
    /// group work. Defaults to the request's own hints.
    fn resolve_target(&self, request: &RouteRequest) -> Option<Candidate> {
        request.preferred_backend.map(|backend| Candidate {
            backend,
            model: request.model.clone(),
        })
    }
}

struct BackendLane {
    backend: Arc<dyn InferenceBackend>,
    breaker: Arc<CircuitBreaker>,
    queue: AdmissionQueue,
    default_deadline: Duration,
}

/// Health of every lane plus memo counters.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub breakers: Vec<CircuitBreakerState>,
    pub queues: BTreeMap<BackendId, AdmissionStats>,
    pub memo: MemoStats,
}

/// Picks a backend and model for each call and walks the fallback chain.
pub struct BackendRouter {
    registry: Arc<ModelRegistry>,
    lanes: BTreeMap<BackendId, BackendLane>,
    fallback_order: Vec<BackendId>,
    memo: ResponseMemo,
}

impl BackendRouter {
    /// Builds one breaker and one queue per configured backend.
    pub fn new(
        registry: Arc<ModelRegistry>,
        backends: Vec<Arc<dyn InferenceBackend>>,
        config: &FleetConfig,
    ) -> Self {
        let lanes = backends
            .into_iter()
            .map(|backend| {
                let id = backend.id();
                let backend_config = config.backends.get(id);
                let lane = BackendLane {
                    breaker: Arc::new(CircuitBreaker::new(id, config.circuit_breaker.clone())),
                    queue: AdmissionQueue::new(
                        id,
                        backend_config.max_concurrent,
                        backend_config.max_queue,
                    ),
                    default_deadline: backend_config.default_deadline(),
                    backend,
                };
                (id, lane)
            })
            .collect();
        Self {
            registry,
            lanes,
            fallback_order: config.backends.fallback_order.clone(),
            memo: ResponseMemo::new(&config.router),
        }
    }

    /// The registry used to resolve models.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Circuit breaker of `backend`.
    pub fn breaker(&self, backend: BackendId) -> Option<&Arc<CircuitBreaker>> {
        self.lanes.get(&backend).map(|lane| &lane.breaker)
    }

    /// Admission queue of `backend`.
    pub fn queue(&self, backend: BackendId) -> Option<&AdmissionQueue> {
        self.lanes.get(&backend).map(|lane| &lane.queue)
    }

    /// The response memo.
    pub fn memo(&self) -> &ResponseMemo {
        &self.memo
    }

    fn is_open(&self, backend: BackendId) -> bool {
        self.lanes
            .get(&backend)
            .map(|lane| !lane.breaker.allows_calls())
            .unwrap_or(true)
    }

    /// Registry pick for the request: an explicit model wherever it is
    /// served, otherwise the category's best model.
    fn registry_best(&self, request: &RouteRequest) -> Option<(BackendId, String)> {
        if let Some(model) = &request.model {
            if let Some(backend) = self.registry.backend_for_model(model) {
                return Some((backend, model.clone()));
            }
        }
        match self.registry.best_model(&request.category) {
            Ok(descriptor) => Some((descriptor.backend, descriptor.name)),
            Err(e) => {
                debug!(category = %request.category, error = %e, "Falling back to generic models");
                None
            }
        }
    }

    /// Fallback chain for a request, given current breaker states.
    pub fn candidates(&self, request: &RouteRequest) -> CandidateChain {
        CandidateChain::build(
            request.preferred_backend,
            self.registry_best(request),
            &self.fallback_order,
            |backend| self.is_open(backend),
        )
    }

    fn resolve_model(&self, candidate: &Candidate, request: &RouteRequest) -> Option<String> {
        if let Some(model) = &candidate.model {
            return Some(model.clone());
        }
        if let Some(model) = &request.model {
            if self.registry.is_available(candidate.backend, model) {
                return Some(model.clone());
            }
        }
        self.registry
            .best_model_on(candidate.backend, &request.category)
            .map(|d| d.name)
            .or_else(|| self.registry.generic_model(candidate.backend))
    }

    fn memo_key(&self, request: &RouteRequest) -> Option<String> {
        if !self.memo.is_eligible(&request.prompt, !request.images.is_empty()) {
            return None;
        }
        let model = request
            .model
            .clone()
            .or_else(|| self.registry_best(request).map(|(_, m)| m))
            .unwrap_or_else(|| "auto".to_string());
        Some(ResponseMemo::key(&request.prompt, &request.category, &model))
    }

    /// Serves one call: memo, then each candidate through its breaker and
    /// admission queue, until one succeeds.
    pub async fn route(&self, request: RouteRequest) -> FleetResult<RouteResponse> {
        self.registry.refresh(false).await;
        let correlation_id = request
            .correlation_id
            .map(|id| id.to_string())
            .unwrap_or_default();

        let memo_key = self.memo_key(&request);
        if let Some(key) = &memo_key {
            if let Some(hit) = self.memo.get(key) {
                debug!(correlation_id = %correlation_id, backend = %hit.backend, "Memo hit");
                return Ok(RouteResponse {
                    text: hit.text,
                    model_used: hit.model_used,
                    backend: hit.backend,
                    memoized: true,
                    attempts: 0,
                });
            }
        }

        let chain = self.candidates(&request);
        let mut attempts = 0;
        let mut last_backend = None;
        let mut last_error = String::from("no candidate backend available");

        for candidate in &chain {
            let Some(lane) = self.lanes.get(&candidate.backend) else {
                continue;
            };
            let Some(model) = self.resolve_model(candidate, &request) else {
                last_error = format!("no model known for backend {}", candidate.backend);
                continue;
            };
            attempts += 1;
            last_backend = Some(candidate.backend);

            let permit = match lane.breaker.try_acquire() {
                Ok(permit) => permit,
                Err(e) => {
                    debug!(correlation_id = %correlation_id, backend = %candidate.backend, "Circuit refused call, advancing");
                    last_error = e.to_string();
                    continue;
                }
            };

            let generate = GenerateRequest {
                model: model.clone(),
                prompt: request.prompt.clone(),
                system: request.system.clone(),
                images: request.images.clone(),
            };
            let deadline = request.deadline.unwrap_or(lane.default_deadline);
            debug!(
                correlation_id = %correlation_id,
                backend = %candidate.backend,
                model = %model,
                priority = %request.priority,
                "Dispatching to backend"
            );
            let outcome = lane
                .queue
                .enqueue(request.priority, deadline, request.policy, || {
                    lane.backend.generate(&generate)
                })
                .await;

            match outcome {
                Ok(response) => {
                    permit.succeed();
                    if let Some(key) = memo_key {
                        self.memo.put(
                            key,
                            MemoHit {
                                text: response.text.clone(),
                                model_used: response.model_used.clone(),
                                backend: candidate.backend,
                            },
                        );
                    }
                    if attempts > 1 {
                        info!(correlation_id = %correlation_id, backend = %candidate.backend, attempts, "Served by fallback backend");
                    }
                    return Ok(RouteResponse {
                        text: response.text,
                        model_used: response.model_used,
                        backend: candidate.backend,
                        memoized: false,
                        attempts,
                    });
                }
                Err(e) => {
                    if e.is_backend_failure() {
                        permit.fail();
                    } else {
                        permit.release();
                    }
                    warn!(correlation_id = %correlation_id, backend = %candidate.backend, error = %e, "Backend attempt failed, advancing");
                    last_error = e.to_string();
                }
            }
        }

        Err(FleetError::AllBackendsExhausted {
            last_backend,
            attempts,
            last_error,
        })
    }

    /// Breaker, queue and memo state for operators.
    pub fn status(&self) -> RouterStatus {
        RouterStatus {
            breakers: self.lanes.values().map(|l| l.breaker.snapshot()).collect(),
            queues: self
                .lanes
                .iter()
                .map(|(id, l)| (*id, l.queue.stats()))
                .collect(),
            memo: self.memo.stats(),
        }
    }
}

#[async_trait]
impl ModelGateway for BackendRouter {
    async fn call(&self, request: RouteRequest) -> FleetResult<RouteResponse> {
        self.route(request).await
    }

    fn resolve_target(&self, request: &RouteRequest) -> Option<Candidate> {
        let chain = self.candidates(request);
        let first = chain.first()?;
        Some(Candidate {
            backend: first.backend,
            model: self.resolve_model(first, request),
        })
    }
}
