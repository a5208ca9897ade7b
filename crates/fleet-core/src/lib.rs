//! Core types and error definitions for the fleet orchestration core.
//!
//! This crate provides the foundational types shared across all fleet crates,
//! including error handling, the task/expert data model, model descriptors
//! and the typed configuration surface.
//!
//! # Main types
//!
//! - [`FleetError`] — Unified error enum for all fleet subsystems.
//! - [`FleetResult`] — Convenience alias for `Result<T, FleetError>`.
//! - [`Task`] / [`TaskStatus`] / [`Dependency`] — Rows owned by the task store.
//! - [`Expert`] / [`Assignment`] — Worker identities and the orchestrator's output.
//! - [`BackendId`] / [`ModelDescriptor`] / [`Priority`] — Inference routing vocabulary.
//! - [`FleetConfig`] — Typed, validated configuration loaded from TOML.

/// Typed configuration with defaults and validation.
pub mod config;
/// Structured fleet events carrying correlation ids.
pub mod events;
/// Expert identities and assignments.
pub mod expert;
/// Backend and model vocabulary.
pub mod model;
/// Task rows and dependency edges.
pub mod task;

pub use config::FleetConfig;
pub use events::FleetEvent;
pub use expert::{Assignment, Expert};
pub use model::{BackendId, CircuitState, ModelDescriptor, Priority};
pub use task::{Dependency, DependencyKind, Task, TaskStatus};

use std::time::Duration;
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the fleet core.
///
/// Routing and decomposition errors are mostly recovered locally; only
/// [`FleetError::AllBackendsExhausted`] and final task failures are meant to
/// reach a submitter.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// The registry has no available model for a category. Callers fall back
    /// to a generic model.
    #[error("No model available for category '{0}'")]
    NoModelForCategory(String),

    /// The backend's circuit is open or its half-open probe is in flight.
    #[error("Backend {backend} is unavailable (circuit open)")]
    BackendUnavailable {
        /// Backend that refused the call.
        backend: BackendId,
    },

    /// The backend's admission queue is full.
    #[error("Backend {backend} is over capacity")]
    OverCapacity {
        /// Backend whose queue rejected the request.
        backend: BackendId,
    },

    /// A call or a queued request exceeded its deadline.
    #[error("Call to {backend} timed out after {after:?}")]
    Timeout {
        /// Backend the call was bound to.
        backend: BackendId,
        /// Deadline that elapsed.
        after: Duration,
    },

    /// The primary decomposition path failed; the heuristic split is used instead.
    #[error("Decomposition failed: {0}")]
    DecompositionFailure(String),

    /// Every candidate backend failed for one call.
    #[error("All backends exhausted after {attempts} attempt(s); last backend: {}; last error: {last_error}", last_backend.map(|b| b.to_string()).unwrap_or_else(|| "none".into()))]
    AllBackendsExhausted {
        /// Last backend that was actually tried, if any.
        last_backend: Option<BackendId>,
        /// Number of candidates attempted.
        attempts: usize,
        /// Description of the last failure.
        last_error: String,
    },

    /// A task's lease expired while in progress.
    #[error("Task {task_id} is stuck (lease expired)")]
    StuckTask {
        /// The stuck task.
        task_id: Uuid,
    },

    /// No expert qualifies for a task.
    #[error("No expert available for category '{category}'")]
    NoExpertAvailable {
        /// Category that could not be matched.
        category: String,
    },

    /// An error reported by one backend (HTTP status, bad payload, transport).
    #[error("Backend {backend} error: {message}")]
    Backend {
        /// Backend that failed.
        backend: BackendId,
        /// Human-readable failure description.
        message: String,
    },

    /// A backend result failed the worker's sanity check.
    #[error("Invalid result: {0}")]
    InvalidResult(String),

    /// A submission was malformed before any work started.
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// The credential check refused a submission.
    #[error("Submission rejected: {0}")]
    Unauthorized(String),

    /// An error from the task store.
    #[error("Store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether this error should count against the circuit breaker of the
    /// backend that produced it.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Timeout { .. })
    }

    /// The backend this error is attributed to, when there is one.
    pub fn backend(&self) -> Option<BackendId> {
        match self {
            Self::BackendUnavailable { backend }
            | Self::OverCapacity { backend }
            | Self::Timeout { backend, .. }
            | Self::Backend { backend, .. } => Some(*backend),
            Self::AllBackendsExhausted { last_backend, .. } => *last_backend,
            _ => None,
        }
    }
}

/// A convenience `Result` alias using [`FleetError`].
pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(FleetError::Backend {
            backend: BackendId::Fast,
            message: "500".into()
        }
        .is_backend_failure());
        assert!(FleetError::Timeout {
            backend: BackendId::Batch,
            after: Duration::from_secs(1)
        }
        .is_backend_failure());
        assert!(!FleetError::OverCapacity {
            backend: BackendId::Fast
        }
        .is_backend_failure());
        assert!(!FleetError::BackendUnavailable {
            backend: BackendId::Fast
        }
        .is_backend_failure());
    }

    #[test]
    fn test_exhausted_message_carries_context() {
        let err = FleetError::AllBackendsExhausted {
            last_backend: Some(BackendId::Batch),
            attempts: 2,
            last_error: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2 attempt"));
        assert!(msg.contains("batch"));
        assert!(msg.contains("connection refused"));
        assert_eq!(err.backend(), Some(BackendId::Batch));
    }

    #[test]
    fn test_exhausted_without_backend() {
        let err = FleetError::AllBackendsExhausted {
            last_backend: None,
            attempts: 0,
            last_error: "no candidates".into(),
        };
        assert!(err.to_string().contains("last backend: none"));
    }
}
