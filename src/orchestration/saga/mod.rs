//! Saga orchestration with rollback by compensation.
//!
//! A saga is an ordered list of steps. Each step receives the accumulated
//! context and returns a partial update that is merged into it. If a step
//! fails, forward execution stops and the compensations of every step that
//! already completed run in strict reverse order.
//!
//! Compensation is best-effort: a failing compensation is recorded and the
//! remaining compensations still run.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::bus::Payload;
use crate::observer::{BoxError, Notification, NotificationKind, Observers};
use crate::utils::ids;

/// Accumulated saga data.
pub type SagaContext = Payload;

/// Error recorded when a step or compensation panics.
pub const STEP_PANICKED: &str = "step panicked";

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;

/// Errors that can occur during saga orchestration.
///
/// Step failures are not errors: they are reported through the
/// [`SagaExecution`] and trigger compensation.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("Invalid saga status transition: {from} -> {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },
}

// ============================================================================
// Steps
// ============================================================================

/// Forward action of a saga step. Returns the context update.
pub trait SagaAction: Send + Sync {
    fn run(&self, context: SagaContext) -> BoxFuture<'static, std::result::Result<SagaContext, BoxError>>;
}

impl<F, Fut> SagaAction for F
where
    F: Fn(SagaContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<SagaContext, BoxError>> + Send + 'static,
{
    fn run(&self, context: SagaContext) -> BoxFuture<'static, std::result::Result<SagaContext, BoxError>> {
        Box::pin(self(context))
    }
}

/// Undo action of a saga step.
pub trait Compensation: Send + Sync {
    fn compensate(&self, context: SagaContext) -> BoxFuture<'static, std::result::Result<(), BoxError>>;
}

impl<F, Fut> Compensation for F
where
    F: Fn(SagaContext) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    fn compensate(&self, context: SagaContext) -> BoxFuture<'static, std::result::Result<(), BoxError>> {
        Box::pin(self(context))
    }
}

/// One named step: an action plus an optional compensation.
#[derive(Clone)]
pub struct SagaStep {
    name: String,
    action: Arc<dyn SagaAction>,
    compensation: Option<Arc<dyn Compensation>>,
}

impl SagaStep {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<SagaContext, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Arc::new(action),
            compensation: None,
        }
    }

    pub fn with_compensation<F, Fut>(mut self, compensation: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.compensation = Some(Arc::new(compensation));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_compensation(&self) -> bool {
        self.compensation.is_some()
    }
}

impl std::fmt::Debug for SagaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaStep")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .finish()
    }
}

// ============================================================================
// Execution record
// ============================================================================

/// Saga lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Running,
    Completed,
    Compensated,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Compensated => "COMPENSATED",
        }
    }

    pub fn can_transition_to(&self, to: SagaStatus) -> bool {
        matches!(
            (self, to),
            (SagaStatus::Running, SagaStatus::Completed)
                | (SagaStatus::Running, SagaStatus::Compensated)
        )
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compensation that itself failed during rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub error: String,
}

/// Record of one saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub saga_id: String,
    pub saga_name: String,
    pub status: SagaStatus,
    pub context: SagaContext,
    /// Completed steps, in execution order.
    pub log: Vec<String>,
    /// Steps whose compensation succeeded, in the order they ran.
    pub compensated: Vec<String>,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub compensation_failures: Vec<CompensationFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaExecution {
    fn start(saga_name: &str, context: SagaContext) -> Self {
        Self {
            saga_id: ids::saga_id(),
            saga_name: saga_name.to_string(),
            status: SagaStatus::Running,
            context,
            log: Vec::new(),
            compensated: Vec::new(),
            failed_step: None,
            error: None,
            compensation_failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn finish(&mut self, to: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == SagaStatus::Completed
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs an ordered list of [`SagaStep`]s.
///
/// The orchestrator holds no per-run state; `execute` may be called
/// repeatedly and concurrently.
pub struct SagaOrchestrator {
    name: String,
    steps: Vec<SagaStep>,
    step_timeout: Option<Duration>,
    observers: Observers<Notification>,
}

impl SagaOrchestrator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            step_timeout: None,
            observers: Observers::new("saga"),
        }
    }

    /// Fail any step or compensation that runs longer than `timeout`.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn add_step(&mut self, step: SagaStep) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    /// Register an observer for saga lifecycle notifications.
    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&Notification) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.observers.register(Arc::new(observer));
    }

    fn emit(&self, kind: NotificationKind, data: serde_json::Value) {
        self.observers.notify_all(&Notification::new(kind, data));
    }

    async fn bounded<T>(
        &self,
        future: BoxFuture<'static, std::result::Result<T, BoxError>>,
    ) -> std::result::Result<T, String> {
        let future = AssertUnwindSafe(future)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|_| Err(STEP_PANICKED.into())));
        match self.step_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, future).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", timeout)),
            },
            None => future.await.map_err(|e| e.to_string()),
        }
    }

    /// Run every step in order, compensating on the first failure.
    ///
    /// Returns the execution record with status `Completed` or
    /// `Compensated`.
    #[tracing::instrument(name = "saga.execute", skip_all, fields(saga = %self.name))]
    pub async fn execute(&self, initial_context: SagaContext) -> Result<SagaExecution> {
        let mut execution = SagaExecution::start(&self.name, initial_context);
        let saga_id = execution.saga_id.clone();

        info!(saga_id = %saga_id, steps = self.steps.len(), "Saga started");
        self.emit(
            NotificationKind::SagaStarted,
            json!({ "saga_id": saga_id, "saga_name": self.name, "steps": self.steps.len() }),
        );

        let mut completed: Vec<&SagaStep> = Vec::new();
        for step in &self.steps {
            self.emit(
                NotificationKind::StepStarted,
                json!({ "saga_id": saga_id, "step": step.name }),
            );

            let outcome = self.bounded(step.action.run(execution.context.clone())).await;
            match outcome {
                Ok(update) => {
                    execution.context.extend(update);
                    execution.log.push(step.name.clone());
                    completed.push(step);
                    debug!(saga_id = %saga_id, step = %step.name, "Step completed");
                    self.emit(
                        NotificationKind::StepCompleted,
                        json!({ "saga_id": saga_id, "step": step.name }),
                    );
                }
                Err(error) => {
                    warn!(saga_id = %saga_id, step = %step.name, error = %error, "Step failed");
                    self.emit(
                        NotificationKind::StepFailed,
                        json!({ "saga_id": saga_id, "step": step.name, "error": error }),
                    );
                    execution.failed_step = Some(step.name.clone());
                    execution.error = Some(error);

                    self.compensate(&mut execution, &completed).await;
                    execution.finish(SagaStatus::Compensated)?;

                    info!(
                        saga_id = %saga_id,
                        compensated = execution.compensated.len(),
                        compensation_failures = execution.compensation_failures.len(),
                        "Saga compensated"
                    );
                    self.emit(
                        NotificationKind::SagaCompensated,
                        json!({
                            "saga_id": saga_id,
                            "failed_step": execution.failed_step,
                            "error": execution.error,
                            "compensated": execution.compensated,
                        }),
                    );
                    return Ok(execution);
                }
            }
        }

        execution.finish(SagaStatus::Completed)?;
        info!(saga_id = %saga_id, "Saga completed");
        self.emit(
            NotificationKind::SagaCompleted,
            json!({ "saga_id": saga_id, "context": execution.context }),
        );
        Ok(execution)
    }

    /// Undo `completed` steps, last first, with the context as of the failure.
    async fn compensate(&self, execution: &mut SagaExecution, completed: &[&SagaStep]) {
        let saga_id = execution.saga_id.clone();
        self.emit(
            NotificationKind::CompensationStarted,
            json!({ "saga_id": saga_id, "steps": execution.log }),
        );

        for step in completed.iter().rev() {
            let Some(compensation) = &step.compensation else {
                debug!(saga_id = %saga_id, step = %step.name, "No compensation, skipping");
                continue;
            };

            match self
                .bounded(compensation.compensate(execution.context.clone()))
                .await
            {
                Ok(()) => {
                    execution.compensated.push(step.name.clone());
                    debug!(saga_id = %saga_id, step = %step.name, "Step compensated");
                    self.emit(
                        NotificationKind::StepCompensated,
                        json!({ "saga_id": saga_id, "step": step.name }),
                    );
                }
                Err(error) => {
                    error!(saga_id = %saga_id, step = %step.name, error = %error, "Compensation failed");
                    self.emit(
                        NotificationKind::CompensationFailed,
                        json!({ "saga_id": saga_id, "step": step.name, "error": error }),
                    );
                    execution.compensation_failures.push(CompensationFailure {
                        step: step.name.clone(),
                        error,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("step_timeout", &self.step_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests;
