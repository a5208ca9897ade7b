//! Submission facade: the entry point chat and API layers call.
//!
//! Simple goals are answered on the spot through the router at interactive
//! priority. Everything else, and every simple goal the router could not
//! serve right away, is queued as a task whose id the caller polls.

use crate::analyzer::{priority_hint, ComplexityAnalyzer};
use crate::store::{TaskFilter, TaskStore};
use crate::worker::validate_result;
use async_trait::async_trait;
use chrono::Utc;
use fleet_backends::{ModelGateway, OverflowPolicy, RouteRequest};
use fleet_core::events::{emit, FleetEvent};
use fleet_core::{BackendId, FleetError, FleetResult, Priority, Task, TaskStatus};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Decides whether a caller may submit work. The fleet treats the
/// credential as opaque.
#[async_trait]
pub trait CredentialCheck: Send + Sync {
    async fn check(&self, credential: Option<&str>) -> FleetResult<()>;
}

/// Accepts every submission.
pub struct AllowAll;

#[async_trait]
impl CredentialCheck for AllowAll {
    async fn check(&self, _credential: Option<&str>) -> FleetResult<()> {
        Ok(())
    }
}

/// A goal plus the caller's optional hints.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub goal: String,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub credential: Option<String>,
}

impl Submission {
    /// Submission with inferred category and priority.
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    /// Overrides the inferred category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Overrides the inferred priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Credential handed to the [`CredentialCheck`].
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Answered {
        task_id: Uuid,
        correlation_id: Uuid,
        text: String,
        backend: BackendId,
        model: String,
    },
    Queued {
        task_id: Uuid,
        correlation_id: Uuid,
    },
}

impl SubmitOutcome {
    /// Id of the task row created for the submission.
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Answered { task_id, .. } | Self::Queued { task_id, .. } => *task_id,
        }
    }
}

/// Polling view of a submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub attempts: u32,
    pub result: Option<String>,
    pub error: Option<String>,
    pub subtasks_total: usize,
    pub subtasks_completed: usize,
}

/// Accepts goals and reports their progress.
pub struct Submitter {
    store: Arc<dyn TaskStore>,
    analyzer: Arc<ComplexityAnalyzer>,
    gateway: Arc<dyn ModelGateway>,
    credentials: Arc<dyn CredentialCheck>,
}

impl Submitter {
    /// Facade over a store, an analyzer, a gateway and a credential check.
    pub fn new(
        store: Arc<dyn TaskStore>,
        analyzer: Arc<ComplexityAnalyzer>,
        gateway: Arc<dyn ModelGateway>,
        credentials: Arc<dyn CredentialCheck>,
    ) -> Self {
        Self {
            store,
            analyzer,
            gateway,
            credentials,
        }
    }

    /// Answers simple goals immediately and queues everything else.
    pub async fn submit(&self, submission: Submission) -> FleetResult<SubmitOutcome> {
        self.credentials
            .check(submission.credential.as_deref())
            .await?;

        let goal = submission.goal.trim();
        if goal.is_empty() {
            return Err(FleetError::InvalidSubmission("goal is empty".into()));
        }
        let category = submission
            .category
            .clone()
            .unwrap_or_else(|| self.analyzer.infer_category(goal));
        let priority = submission
            .priority
            .or_else(|| priority_hint(goal))
            .unwrap_or_default();
        let mut task = Task::new(goal)
            .with_category(category.clone())
            .with_priority(priority);
        let complexity = self.analyzer.classify(goal);

        if !complexity.needs_decomposition() {
            let request = RouteRequest::new(goal, category.as_str())
                .with_priority(Priority::High)
                .with_policy(OverflowPolicy::FailFast)
                .with_correlation_id(task.correlation_id);
            match self.gateway.call(request).await {
                Ok(response) if validate_result(&response.text, 1).is_ok() => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(response.text.clone());
                    task.updated_at = Utc::now();
                    let outcome = SubmitOutcome::Answered {
                        task_id: task.id,
                        correlation_id: task.correlation_id,
                        text: response.text,
                        backend: response.backend,
                        model: response.model_used,
                    };
                    let (task_id, correlation_id, attempts) =
                        (task.id, task.correlation_id, task.attempts);
                    self.store.insert(task).await?;
                    info!(
                        task_id = %task_id,
                        correlation_id = %correlation_id,
                        backend = %response.backend,
                        "Task answered immediately"
                    );
                    emit(&FleetEvent::Outcome {
                        task_id,
                        correlation_id,
                        status: TaskStatus::Completed,
                        attempts,
                        backend: Some(response.backend),
                        error: None,
                    });
                    return Ok(outcome);
                }
                Ok(_) => {
                    debug!(correlation_id = %task.correlation_id, "Immediate answer rejected, queueing");
                }
                Err(e) => {
                    debug!(
                        correlation_id = %task.correlation_id,
                        error = %e,
                        "Immediate answer unavailable, queueing"
                    );
                }
            }
        }

        let outcome = SubmitOutcome::Queued {
            task_id: task.id,
            correlation_id: task.correlation_id,
        };
        info!(
            task_id = %task.id,
            correlation_id = %task.correlation_id,
            category = %category,
            priority = %priority,
            complexity = %complexity.class,
            "Task queued"
        );
        self.store.insert(task).await?;
        Ok(outcome)
    }

    /// Progress of a submitted task, `None` if unknown.
    pub async fn status(&self, task_id: Uuid) -> FleetResult<Option<TaskProgress>> {
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(None);
        };
        let children = self.store.list(&TaskFilter::children_of(task_id)).await?;
        Ok(Some(TaskProgress {
            task_id,
            status: task.status,
            attempts: task.attempts,
            result: task.result,
            error: task.last_error,
            subtasks_total: children.len(),
            subtasks_completed: children
                .iter()
                .filter(|c| c.status == TaskStatus::Completed)
                .count(),
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;
    use crate::test_support::EventRecorder;
    use fleet_backends::RouteResponse;
    use fleet_core::config::AnalyzerConfig;
    use parking_lot::Mutex;

    struct RecordingGateway {
        fail: bool,
        requests: Mutex<Vec<RouteRequest>>,
    }

    impl RecordingGateway {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModelGateway for RecordingGateway {
        async fn call(&self, request: RouteRequest) -> FleetResult<RouteResponse> {
            self.requests.lock().push(request.clone());
            if self.fail {
                return Err(FleetError::OverCapacity {
                    backend: BackendId::Fast,
                });
            }
            Ok(RouteResponse {
                text: "4".into(),
                model_used: "qwen3:8b".into(),
                backend: BackendId::Fast,
                memoized: false,
                attempts: 1,
            })
        }
    }

    struct DenyAll;

    #[async_trait]
    impl CredentialCheck for DenyAll {
        async fn check(&self, _credential: Option<&str>) -> FleetResult<()> {
            Err(FleetError::Unauthorized("no credential".into()))
        }
    }

    fn submitter(
        store: &Arc<InMemoryTaskStore>,
        gateway: Arc<RecordingGateway>,
        credentials: Arc<dyn CredentialCheck>,
    ) -> Submitter {
        Submitter::new(
            Arc::clone(store) as Arc<dyn TaskStore>,
            Arc::new(ComplexityAnalyzer::new(AnalyzerConfig::default())),
            gateway,
            credentials,
        )
    }

    #[tokio::test]
    async fn test_simple_goal_answered_immediately() {
        let store = Arc::new(InMemoryTaskStore::new());
        let gateway = RecordingGateway::new(false);
        let submitter = submitter(&store, Arc::clone(&gateway), Arc::new(AllowAll));

        let outcome = submitter.submit(Submission::new("What is 2+2?")).await.unwrap();
        let SubmitOutcome::Answered { text, backend, .. } = &outcome else {
            panic!("expected an immediate answer, got {outcome:?}");
        };
        assert_eq!(text, "4");
        assert_eq!(*backend, BackendId::Fast);

        let request = gateway.requests.lock()[0].clone();
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.policy, OverflowPolicy::FailFast);

        let progress = submitter.status(outcome.task_id()).await.unwrap().unwrap();
        assert_eq!(progress.status, TaskStatus::Completed);
        assert_eq!(progress.result.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_immediate_answer_emits_outcome() {
        let recorder = EventRecorder::default();
        let _guard = recorder.install();
        let store = Arc::new(InMemoryTaskStore::new());
        let submitter = submitter(&store, RecordingGateway::new(false), Arc::new(AllowAll));

        let outcome = submitter.submit(Submission::new("What is 2+2?")).await.unwrap();
        let SubmitOutcome::Answered { correlation_id, .. } = &outcome else {
            panic!("expected an immediate answer, got {outcome:?}");
        };

        let outcomes: Vec<FleetEvent> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, FleetEvent::Outcome { .. }))
            .collect();
        assert_eq!(
            outcomes,
            vec![FleetEvent::Outcome {
                task_id: outcome.task_id(),
                correlation_id: *correlation_id,
                status: TaskStatus::Completed,
                attempts: 0,
                backend: Some(BackendId::Fast),
                error: None,
            }]
        );
    }

    #[tokio::test]
    async fn test_simple_goal_queued_when_router_busy() {
        let store = Arc::new(InMemoryTaskStore::new());
        let submitter = submitter(&store, RecordingGateway::new(true), Arc::new(AllowAll));

        let outcome = submitter.submit(Submission::new("What is 2+2?")).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        let task = store.get(outcome.task_id()).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.is_unassigned());
    }

    #[tokio::test]
    async fn test_complex_goal_is_queued_without_calling() {
        let store = Arc::new(InMemoryTaskStore::new());
        let gateway = RecordingGateway::new(false);
        let submitter = submitter(&store, Arc::clone(&gateway), Arc::new(AllowAll));
        let goal = "First design the database schema, then implement the API endpoint, \
                    and finally write a report for the team.";

        let outcome = submitter
            .submit(Submission::new(goal).with_priority(Priority::Low))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert!(gateway.requests.lock().is_empty());
        let task = store.get(outcome.task_id()).await.unwrap().unwrap();
        assert_eq!(task.priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_priority_keywords_and_explicit_category() {
        let store = Arc::new(InMemoryTaskStore::new());
        let submitter = submitter(&store, RecordingGateway::new(true), Arc::new(AllowAll));

        let outcome = submitter
            .submit(Submission::new("Urgent: restart the billing job").with_category("ops"))
            .await
            .unwrap();
        let task = store.get(outcome.task_id()).await.unwrap().unwrap();
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.category.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn test_credential_check_gates_submission() {
        let store = Arc::new(InMemoryTaskStore::new());
        let submitter = submitter(&store, RecordingGateway::new(false), Arc::new(DenyAll));

        let err = submitter
            .submit(Submission::new("What is 2+2?").with_credential("token"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Unauthorized(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_goal_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let submitter = submitter(&store, RecordingGateway::new(false), Arc::new(AllowAll));
        let err = submitter.submit(Submission::new("   ")).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidSubmission(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_status_of_unknown_task() {
        let store = Arc::new(InMemoryTaskStore::new());
        let submitter = submitter(&store, RecordingGateway::new(false), Arc::new(AllowAll));
        assert!(submitter.status(Uuid::new_v4()).await.unwrap().is_none());
    }
}
