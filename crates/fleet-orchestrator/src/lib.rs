//! Orchestration layer for the fleet.
//!
//! Turns submitted goals into assigned, dependency-ordered tasks and drives
//! them through the backend router. The orchestrator never executes work
//! itself; it only writes assignment fields. Execution belongs to the worker
//! pool, which owns status transitions through leases.
//!
//! # Main types
//!
//! - [`ComplexityAnalyzer`] — Scores goals as simple, complex or multi-domain.
//! - [`TaskGraph`] — Subtask DAG with execution levels and parallel estimates.
//! - [`TaskDecomposer`] — Model-backed goal splitting with a heuristic fallback.
//! - [`ExpertMatchingEngine`] — Picks the best qualified expert per task.
//! - [`TaskStore`] / [`InMemoryTaskStore`] — Optimistic task persistence.
//! - [`Orchestrator`] — The idempotent assignment loop.
//! - [`WorkerPool`] — Claims, executes, retries and reaps tasks.
//! - [`Submitter`] — Entry point for chat and API layers.

/// Goal complexity scoring and category inference.
pub mod analyzer;
/// Model-backed goal decomposition with a heuristic fallback.
pub mod decomposer;
/// The orchestrator control loop.
pub mod engine;
/// Subtask DAG, execution levels and parallel estimates.
pub mod graph;
/// Expert matching, load balance and overload detection.
pub mod matching;
/// Per-expert worker metrics.
pub mod monitor;
/// Task store trait and the in-memory implementation.
pub mod store;
/// Submission facade for chat and API layers.
pub mod submit;
/// Worker pool, leases, retries and the stuck-task reaper.
pub mod worker;

#[cfg(test)]
mod test_support;

pub use analyzer::{Complexity, ComplexityAnalyzer, ComplexityClass};
pub use decomposer::{Decomposition, TaskDecomposer};
pub use engine::{CycleReport, Orchestrator};
pub use graph::{ParallelEstimate, SubTask, TaskGraph};
pub use matching::{ExpertDirectory, ExpertMatchingEngine, InMemoryExpertDirectory, MatchedExpert};
pub use monitor::{ExecutionMetrics, PoolMonitor};
pub use store::{Expect, InMemoryTaskStore, StoreSnapshot, TaskFilter, TaskPatch, TaskStore};
pub use submit::{AllowAll, CredentialCheck, SubmitOutcome, Submission, Submitter, TaskProgress};
pub use worker::{ExecutionOutcome, PollReport, WorkerPool};
