/// HTTP client for Ollama-style model servers.
pub mod http;

pub use http::HttpBackend;

use async_trait::async_trait;
use fleet_core::{BackendId, FleetResult};
use serde::{Deserialize, Serialize};

/// One generation request as sent to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Base64-encoded images. Requests with images are never memoized.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

/// A backend's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub model_used: String,
}

/// Trait for inference backends.
///
/// Each backend class (fast single-request, high-capacity batch) implements
/// this trait. The router never talks to a backend except through its
/// circuit breaker and admission queue.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Which backend class this is.
    fn id(&self) -> BackendId;

    /// Names of the models the backend currently serves.
    async fn list_models(&self) -> FleetResult<Vec<String>>;

    /// Runs one generation.
    async fn generate(&self, request: &GenerateRequest) -> FleetResult<GenerateResponse>;
}
