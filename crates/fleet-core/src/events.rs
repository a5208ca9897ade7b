use crate::model::{BackendId, CircuitState};
use crate::task::TaskStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Log target used for every fleet event.
pub const EVENT_TARGET: &str = "fleet::events";

/// Structured events emitted along a task's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A task received an expert.
    Assigned {
        task_id: Uuid,
        correlation_id: Uuid,
        expert_id: Uuid,
        backend_hint: Option<BackendId>,
    },
    /// A goal was split into subtasks.
    Decomposed {
        task_id: Uuid,
        correlation_id: Uuid,
        subtasks: usize,
        levels: usize,
        heuristic: bool,
    },
    /// A worker claimed a task and sent it to a backend.
    Dispatched {
        task_id: Uuid,
        correlation_id: Uuid,
        backend: Option<BackendId>,
        model: Option<String>,
    },
    /// A circuit breaker changed state.
    CircuitTransition {
        backend: BackendId,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
    },
    /// The reaper reset a task whose lease expired.
    StuckRecovered {
        task_id: Uuid,
        correlation_id: Uuid,
        lease_age_secs: i64,
    },
    /// Rebalancing moved an unstarted task between experts.
    Reassigned {
        task_id: Uuid,
        correlation_id: Uuid,
        from_expert: Uuid,
        to_expert: Uuid,
    },
    /// A task reached a terminal state or went back for a retry.
    Outcome {
        task_id: Uuid,
        correlation_id: Uuid,
        status: TaskStatus,
        attempts: u32,
        backend: Option<BackendId>,
        error: Option<String>,
    },
}

impl FleetEvent {
    /// Short event name, identical to the serialized tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Assigned { .. } => "assigned",
            Self::Decomposed { .. } => "decomposed",
            Self::Dispatched { .. } => "dispatched",
            Self::CircuitTransition { .. } => "circuit_transition",
            Self::StuckRecovered { .. } => "stuck_recovered",
            Self::Reassigned { .. } => "reassigned",
            Self::Outcome { .. } => "outcome",
        }
    }

    /// Correlation id, absent for backend-scoped events.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::Assigned { correlation_id, .. }
            | Self::Decomposed { correlation_id, .. }
            | Self::Dispatched { correlation_id, .. }
            | Self::StuckRecovered { correlation_id, .. }
            | Self::Reassigned { correlation_id, .. }
            | Self::Outcome { correlation_id, .. } => Some(*correlation_id),
            Self::CircuitTransition { .. } => None,
        }
    }
}

/// Logs an event on [`EVENT_TARGET`] with its JSON payload.
pub fn emit(event: &FleetEvent) {
    let payload = serde_json::to_string(event).unwrap_or_default();
    let correlation_id = event
        .correlation_id()
        .map(|id| id.to_string())
        .unwrap_or_default();
    match event {
        FleetEvent::CircuitTransition { .. } | FleetEvent::StuckRecovered { .. } => {
            tracing::warn!(target: EVENT_TARGET, kind = event.kind(), correlation_id = %correlation_id, payload = %payload, "fleet event");
        }
        FleetEvent::Outcome {
            status: TaskStatus::Failed,
            ..
        } => {
            tracing::error!(target: EVENT_TARGET, kind = event.kind(), correlation_id = %correlation_id, payload = %payload, "fleet event");
        }
        _ => {
            tracing::info!(target: EVENT_TARGET, kind = event.kind(), correlation_id = %correlation_id, payload = %payload, "fleet event");
        }
    }
}
