//! Step-driving workflow executor.
//!
//! [`WorkflowExecutor::work`] processes one queued step invocation:
//!
//! 1. Resolve the workflow; an unknown name cancels the job.
//! 2. Resolve the step (empty means the first step, persisting `running`).
//! 3. Run the step handler under the step's deadline.
//! 4. On error or timeout, apply the retry/skip policy.
//! 5. On success, merge the step data into the context, persist it, and
//!    either enqueue the next step or mark the workflow completed.
//!
//! The executor never sleeps or spawns: suspension between steps is the job
//! queue's business. Retries are requested by returning
//! [`WorkError::Retry`]; the queue redelivers the same job. A job the queue
//! gives up on is reported through [`JobWorker::discarded`], which fails the
//! execution so its dedup slot is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use stepline_types::context::WorkflowContext;
use stepline_types::error::{RepositoryError, StepError};
use stepline_types::workflow::{WorkflowArgs, WorkflowStatus};
use tokio_util::sync::CancellationToken;

use super::definition::{Step, Workflow};
use super::handler::StepInvocation;
use super::registry::WorkflowRegistry;
use super::retry::{FailureAction, RetryHandler};
use crate::queue::{InsertOpts, Job, JobQueue, JobWorker, WorkError, DEFAULT_QUEUE};
use crate::repository::workflow_store::WorkflowStore;

/// Added to the step deadline for the queue's outer deadline, which also
/// covers the store and queue writes around the step.
const QUEUE_DEADLINE_SLACK: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Runs workflow steps delivered by a job queue.
///
/// Generic over the store and the queue so it works with any backend
/// (SQLite, in-memory, a test double). The registry is immutable and shared.
pub struct WorkflowExecutor<S: WorkflowStore, Q: JobQueue> {
    pub(crate) registry: Arc<WorkflowRegistry>,
    pub(crate) store: S,
    pub(crate) queue: Q,
    default_timeout: Option<Duration>,
}

impl<S: WorkflowStore, Q: JobQueue> WorkflowExecutor<S, Q> {
    pub fn new(registry: Arc<WorkflowRegistry>, store: S, queue: Q) -> Self {
        Self {
            registry,
            store,
            queue,
            default_timeout: None,
        }
    }

    /// Timeout reported for steps that do not configure one.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Process one delivery of a step job.
    pub async fn work(&self, job: &Job, cancel: CancellationToken) -> Result<(), WorkError> {
        let args = &job.args;

        let Some(workflow) = self.registry.get(&args.workflow_name) else {
            tracing::error!(
                workflow_id = %args.workflow_id,
                workflow = args.workflow_name.as_str(),
                "unknown workflow, cancelling job"
            );
            return Err(WorkError::Permanent(format!(
                "unknown workflow: {}",
                args.workflow_name
            )));
        };

        let existing = match self.store.get_workflow_status(&args.workflow_id).await {
            Ok(status) => Some(status),
            Err(RepositoryError::NotFound) => None,
            Err(e) => return Err(persistence_error(e)),
        };

        if let Some(status) = &existing {
            if status.is_terminal() {
                tracing::debug!(
                    workflow_id = %args.workflow_id,
                    status = %status.status,
                    "workflow already finished, acknowledging duplicate delivery"
                );
                return Ok(());
            }
        }

        let started_at = existing
            .as_ref()
            .map(|s| s.started_at)
            .unwrap_or_else(Utc::now);

        let step_name = if args.current_step.is_empty() {
            let first = workflow.first_step().to_string();
            if existing.is_none() {
                let status = WorkflowStatus::running(args, &first, started_at);
                match self.store.save_workflow_status(&status).await {
                    Ok(()) => {}
                    Err(RepositoryError::Conflict(msg)) => {
                        tracing::warn!(
                            workflow_id = %args.workflow_id,
                            workflow = workflow.name(),
                            "duplicate execution for the same input, cancelling: {msg}"
                        );
                        return Err(WorkError::Permanent(format!("duplicate execution: {msg}")));
                    }
                    Err(e) => return Err(persistence_error(e)),
                }
                tracing::info!(
                    workflow_id = %args.workflow_id,
                    workflow = workflow.name(),
                    step = first.as_str(),
                    "workflow running"
                );
            }
            first
        } else {
            args.current_step.clone()
        };

        let Some(step) = workflow.step(&step_name) else {
            let message = format!("unknown step '{step_name}' in workflow '{}'", workflow.name());
            tracing::error!(workflow_id = %args.workflow_id, "{message}");
            match self.store.mark_workflow_failed(&args.workflow_id, &message).await {
                Ok(()) | Err(RepositoryError::NotFound) => {}
                Err(e) => return Err(persistence_error(e)),
            }
            return Err(WorkError::Permanent(message));
        };

        let attempt = RetryHandler::effective_attempt(args.attempt_count, job.attempt);
        let invocation = StepInvocation {
            workflow_id: args.workflow_id,
            workflow_name: args.workflow_name.clone(),
            step_name: step_name.clone(),
            attempt,
            input: args.input.clone(),
            context: args.context.clone(),
            cancel,
        };

        tracing::debug!(
            workflow_id = %args.workflow_id,
            step = step_name.as_str(),
            attempt,
            "executing step"
        );

        let run = step.handler().run(invocation);
        let outcome = match self.step_deadline(step) {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::transient(format!(
                    "step timed out after {}ms",
                    deadline.as_millis()
                ))),
            },
            None => run.await,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => return self.handle_step_error(workflow, step, args, attempt, err).await,
        };

        let mut context = args.context.clone();
        context.merge(result.data);

        let mut status = WorkflowStatus::running(args, &step_name, started_at);
        status.context = context.clone();
        self.store
            .save_workflow_status(&status)
            .await
            .map_err(persistence_error)?;

        tracing::info!(
            workflow_id = %args.workflow_id,
            step = step_name.as_str(),
            "step completed"
        );

        let next = result
            .next_step
            .filter(|next| !next.is_empty())
            .or_else(|| workflow.next_step(&step_name).map(str::to_string));

        match next {
            Some(next) => self.schedule_next_step(workflow, args, &next, context).await,
            None => self.complete(args, context, started_at).await,
        }
    }

    fn step_deadline(&self, step: &Step) -> Option<Duration> {
        step.timeout.or(self.default_timeout)
    }

    /// Step a job is about to run: its `current_step`, or the first step.
    fn job_step<'a>(&'a self, args: &'a WorkflowArgs) -> Option<&'a Step> {
        let workflow = self.registry.get(&args.workflow_name)?;
        if args.current_step.is_empty() {
            workflow.step(workflow.first_step())
        } else {
            workflow.step(&args.current_step)
        }
    }

    /// Fail the execution of a job the queue will no longer deliver.
    pub async fn abandon(&self, job: &Job, reason: &str) {
        let args = &job.args;
        let step = self
            .job_step(args)
            .map(|s| s.name.as_str())
            .unwrap_or(args.current_step.as_str());
        let message = format!(
            "step '{step}' abandoned after {} deliveries: {reason}",
            job.attempt
        );

        match self.store.mark_workflow_failed(&args.workflow_id, &message).await {
            Ok(()) => tracing::error!(
                workflow_id = %args.workflow_id,
                step,
                attempt = job.attempt,
                "workflow failed: {message}"
            ),
            Err(RepositoryError::NotFound) => tracing::debug!(
                workflow_id = %args.workflow_id,
                "abandoned job has no execution record"
            ),
            Err(e) => tracing::error!(
                workflow_id = %args.workflow_id,
                "could not mark abandoned execution failed: {e}"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    async fn handle_step_error(
        &self,
        workflow: &Workflow,
        step: &Step,
        args: &WorkflowArgs,
        attempt: u32,
        err: StepError,
    ) -> Result<(), WorkError> {
        match RetryHandler::decide(step, attempt, &err) {
            FailureAction::Retry { delay } => {
                tracing::warn!(
                    workflow_id = %args.workflow_id,
                    step = step.name.as_str(),
                    attempt,
                    max_retries = step.max_retries,
                    "step failed, will retry: {err}"
                );
                Err(WorkError::Retry {
                    message: format!(
                        "step '{}' failed (attempt {} of {}): {err}",
                        step.name,
                        attempt + 1,
                        step.max_retries + 1
                    ),
                    delay,
                })
            }
            FailureAction::Skip => {
                tracing::warn!(
                    workflow_id = %args.workflow_id,
                    step = step.name.as_str(),
                    attempt,
                    "optional step failed, skipping: {err}"
                );
                let context = args.context.clone();
                match workflow.next_step(&step.name) {
                    Some(next) => self.schedule_next_step(workflow, args, next, context).await,
                    None => {
                        let started_at = self.started_at(args).await?;
                        self.complete(args, context, started_at).await
                    }
                }
            }
            FailureAction::Fail => {
                let message = format!(
                    "step '{}' failed after {} attempt(s): {err}",
                    step.name,
                    attempt + 1
                );
                tracing::error!(
                    workflow_id = %args.workflow_id,
                    step = step.name.as_str(),
                    "workflow failed: {message}"
                );
                self.store
                    .mark_workflow_failed(&args.workflow_id, &message)
                    .await
                    .map_err(persistence_error)?;
                Err(WorkError::Permanent(message))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn schedule_next_step(
        &self,
        workflow: &Workflow,
        args: &WorkflowArgs,
        next: &str,
        context: WorkflowContext,
    ) -> Result<(), WorkError> {
        let queue = workflow
            .step(next)
            .map(|s| s.queue.as_str())
            .unwrap_or(DEFAULT_QUEUE);
        let next_args = args.next_step(next, context);

        let handle = self
            .queue
            .insert(next_args, InsertOpts::new(queue))
            .await
            .map_err(|e| WorkError::Retry {
                message: format!("failed to schedule step '{next}': {e}"),
                delay: Duration::ZERO,
            })?;

        tracing::debug!(
            workflow_id = %args.workflow_id,
            next_step = next,
            job_id = handle.job_id,
            queue = handle.queue.as_str(),
            "scheduled next step"
        );
        Ok(())
    }

    async fn complete(
        &self,
        args: &WorkflowArgs,
        context: WorkflowContext,
        started_at: DateTime<Utc>,
    ) -> Result<(), WorkError> {
        self.store
            .mark_workflow_completed(&args.workflow_id, &context)
            .await
            .map_err(persistence_error)?;

        let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
        tracing::info!(
            workflow_id = %args.workflow_id,
            workflow = args.workflow_name.as_str(),
            elapsed_ms,
            "workflow completed"
        );
        Ok(())
    }

    async fn started_at(&self, args: &WorkflowArgs) -> Result<DateTime<Utc>, WorkError> {
        match self.store.get_workflow_status(&args.workflow_id).await {
            Ok(status) => Ok(status.started_at),
            Err(RepositoryError::NotFound) => Ok(Utc::now()),
            Err(e) => Err(persistence_error(e)),
        }
    }
}

fn persistence_error(err: RepositoryError) -> WorkError {
    WorkError::Retry {
        message: format!("persistence error: {err}"),
        delay: Duration::ZERO,
    }
}

impl<S: WorkflowStore, Q: JobQueue> JobWorker for WorkflowExecutor<S, Q> {
    fn timeout(&self, job: &Job) -> Option<Duration> {
        let deadline = match self.job_step(&job.args) {
            Some(step) => self.step_deadline(step),
            None => self.default_timeout,
        };
        deadline.map(|d| d + QUEUE_DEADLINE_SLACK)
    }

    async fn work(&self, job: &Job, cancel: CancellationToken) -> Result<(), WorkError> {
        WorkflowExecutor::work(self, job, cancel).await
    }

    async fn discarded(&self, job: &Job, reason: &str) {
        self.abandon(job, reason).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
