//! Inference backend plumbing for the fleet.
//!
//! Everything between "this prompt needs an answer" and an HTTP call to a
//! model server lives here: the backend trait and its HTTP implementation,
//! the model registry, per-backend circuit breakers and admission queues,
//! the response memo, and the router that ties them into one ordered
//! fallback chain.
//!
//! # Main types
//!
//! - [`InferenceBackend`] — Trait every backend implements.
//! - [`ModelRegistry`] — Which models each backend currently serves.
//! - [`CircuitBreaker`] — Per-backend closed/open/half-open guard.
//! - [`AdmissionQueue`] — Per-backend bounded priority dispatcher.
//! - [`BackendRouter`] — Memo + candidate chain + queue + breaker.
//! - [`ModelGateway`] — The narrow trait orchestration code calls.

/// Per-backend bounded priority admission queue.
pub mod admission;
/// Backend trait and the HTTP model-server client.
pub mod backends;
/// Ordered fallback chain of candidate targets.
pub mod chain;
/// Per-backend circuit breaker state machine.
pub mod circuit_breaker;
/// Short-lived response memo.
pub mod memo;
/// Model registry with TTL-cached listings.
pub mod registry;
/// Backend router tying memo, chain, queue and breaker together.
pub mod router;

pub use admission::{AdmissionQueue, AdmissionStats, OverflowPolicy};
pub use backends::{GenerateRequest, GenerateResponse, HttpBackend, InferenceBackend};
pub use chain::{Candidate, CandidateChain};
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerState};
pub use memo::{MemoHit, MemoStats, ResponseMemo};
pub use registry::{ModelRegistry, RegistryReport};
pub use router::{BackendRouter, ModelGateway, RouteRequest, RouteResponse, RouterStatus};

use fleet_core::FleetConfig;
use std::sync::Arc;

/// Builds HTTP backends for both configured backend classes, in fallback order.
pub fn http_backends(config: &FleetConfig) -> Vec<Arc<dyn InferenceBackend>> {
    config
        .backends
        .fallback_order
        .iter()
        .map(|id| {
            Arc::new(HttpBackend::new(*id, config.backends.get(*id))) as Arc<dyn InferenceBackend>
        })
        .collect()
}
