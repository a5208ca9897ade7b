//! Shared fixtures for unit tests.

use async_trait::async_trait;
use fleet_backends::{GenerateRequest, GenerateResponse, InferenceBackend, ModelRegistry};
use fleet_core::config::RegistryConfig;
use fleet_core::events::{FleetEvent, EVENT_TARGET};
use fleet_core::{BackendId, FleetConfig, FleetResult};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// Backend that lists a fixed set of models and echoes prompts.
pub struct StaticBackend {
    pub id: BackendId,
    pub models: Vec<String>,
}

#[async_trait]
impl InferenceBackend for StaticBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    async fn list_models(&self) -> FleetResult<Vec<String>> {
        Ok(self.models.clone())
    }

    async fn generate(&self, request: &GenerateRequest) -> FleetResult<GenerateResponse> {
        Ok(GenerateResponse {
            text: format!("done: {}", request.prompt),
            model_used: request.model.clone(),
        })
    }
}

/// Refreshed registry over two static backends.
pub async fn registry_with(fast: &[&str], batch: &[&str]) -> Arc<ModelRegistry> {
    let backends: Vec<Arc<dyn InferenceBackend>> = vec![
        Arc::new(StaticBackend {
            id: BackendId::Fast,
            models: fast.iter().map(|m| (*m).to_string()).collect(),
        }),
        Arc::new(StaticBackend {
            id: BackendId::Batch,
            models: batch.iter().map(|m| (*m).to_string()).collect(),
        }),
    ];
    let config = FleetConfig::default();
    let registry = Arc::new(ModelRegistry::new(
        backends,
        &config.backends,
        &RegistryConfig { ttl_secs: 3600 },
    ));
    registry.refresh(true).await;
    registry
}

/// Collects fleet events emitted on the current thread while installed.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<FleetEvent>>>,
}

impl EventRecorder {
    /// Routes this thread's tracing output into the recorder until the
    /// guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<FleetEvent> {
        self.events.lock().clone()
    }
}

struct PayloadVisitor(Option<String>);

impl Visit for PayloadVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "payload" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for EventRecorder {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != EVENT_TARGET {
            return;
        }
        let mut visitor = PayloadVisitor(None);
        event.record(&mut visitor);
        if let Some(parsed) = visitor
            .0
            .and_then(|payload| serde_json::from_str::<FleetEvent>(&payload).ok())
        {
            self.events.lock().push(parsed);
        }
    }
}
