//! Starting, inspecting and resuming workflow executions.
//!
//! `start_workflow` deduplicates on the (name, input) hash in two layers:
//! a fast lookup of a running record, then a durable claim. The claim is a
//! running record saved before the first job is enqueued; the store rejects
//! a second running record with the same hash, and that conflict resolves
//! to the execution that won.

use chrono::Utc;
use serde_json::Value;
use stepline_types::error::{RepositoryError, WorkflowError};
use stepline_types::workflow::{StartWorkflowResult, WorkflowArgs, WorkflowStatus};
use uuid::Uuid;

use super::executor::WorkflowExecutor;
use crate::hash::generate_input_hash;
use crate::queue::{InsertOpts, JobQueue, DEFAULT_QUEUE};
use crate::repository::workflow_store::WorkflowStore;

impl<S: WorkflowStore, Q: JobQueue> WorkflowExecutor<S, Q> {
    /// Start `workflow_name` with `input`, or return the execution already
    /// running for the same input.
    pub async fn start_workflow(
        &self,
        workflow_name: &str,
        input: Value,
    ) -> Result<StartWorkflowResult, WorkflowError> {
        let workflow = self
            .registry
            .get(workflow_name)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_name.to_string()))?;

        workflow
            .validate_input(&input)
            .map_err(WorkflowError::Validation)?;

        let input_hash = generate_input_hash(workflow_name, &input)
            .map_err(|e| WorkflowError::Hash(e.to_string()))?;

        if let Some(existing) = self
            .store
            .get_running_workflow_by_hash(workflow_name, &input_hash)
            .await?
        {
            return Ok(existing_result(existing));
        }

        let workflow_id = Uuid::new_v4();
        let args = WorkflowArgs::first(workflow_id, workflow_name, input, input_hash);
        let claim = WorkflowStatus::running(&args, workflow.first_step(), Utc::now());

        match self.store.save_workflow_status(&claim).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(msg)) => {
                tracing::debug!(
                    workflow = workflow_name,
                    "lost start race, resolving to existing execution: {msg}"
                );
                return match self
                    .store
                    .get_running_workflow_by_hash(workflow_name, &args.input_hash)
                    .await?
                {
                    Some(existing) => Ok(existing_result(existing)),
                    None => Err(RepositoryError::Conflict(msg).into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        let queue = workflow
            .step(workflow.first_step())
            .map(|s| s.queue.clone())
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

        if let Err(e) = self.queue.insert(args, InsertOpts::new(queue)).await {
            let message = format!("failed to enqueue first step: {e}");
            if let Err(mark_err) = self.store.mark_workflow_failed(&workflow_id, &message).await {
                tracing::warn!(
                    workflow_id = %workflow_id,
                    "could not release claim after enqueue failure: {mark_err}"
                );
            }
            return Err(e.into());
        }

        tracing::info!(
            workflow_id = %workflow_id,
            workflow = workflow_name,
            "workflow started"
        );

        Ok(StartWorkflowResult {
            workflow_id,
            is_new_workflow: true,
            existing_status: None,
        })
    }

    /// Current persisted record of an execution.
    pub async fn get_workflow_status(&self, workflow_id: &Uuid) -> Result<WorkflowStatus, WorkflowError> {
        self.store
            .get_workflow_status(workflow_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => WorkflowError::NotFound(*workflow_id),
                other => WorkflowError::Repository(other),
            })
    }

    /// Re-enqueue every running execution that has no live job, at its
    /// persisted step.
    ///
    /// Used at worker start-up to pick up executions whose job never made it
    /// into the queue (a process exiting between the claim and the insert)
    /// or was dropped. The recorded step may run again, so steps must be
    /// idempotent. Returns the number of executions re-enqueued.
    pub async fn resume_running(&self) -> Result<usize, WorkflowError> {
        let running = self.store.list_running_workflows().await?;
        let mut resumed = 0;

        for status in running {
            if self.queue.has_live_job(&status.workflow_id).await? {
                continue;
            }
            let Some(workflow) = self.registry.get(&status.workflow_name) else {
                tracing::warn!(
                    workflow_id = %status.workflow_id,
                    workflow = status.workflow_name.as_str(),
                    "not resuming execution of unregistered workflow"
                );
                continue;
            };

            let queue = workflow
                .step(&status.current_step)
                .map(|s| s.queue.clone())
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string());

            let args = WorkflowArgs {
                workflow_id: status.workflow_id,
                workflow_name: status.workflow_name,
                current_step: status.current_step,
                input: status.input,
                context: status.context,
                attempt_count: 0,
                input_hash: status.input_hash,
            };

            tracing::info!(
                workflow_id = %args.workflow_id,
                step = args.current_step.as_str(),
                "resuming workflow"
            );
            self.queue.insert(args, InsertOpts::new(queue)).await?;
            resumed += 1;
        }

        Ok(resumed)
    }
}

fn existing_result(existing: WorkflowStatus) -> StartWorkflowResult {
    tracing::debug!(
        workflow_id = %existing.workflow_id,
        workflow = existing.workflow_name.as_str(),
        "workflow already running for this input"
    );
    StartWorkflowResult {
        workflow_id: existing.workflow_id,
        is_new_workflow: false,
        existing_status: Some(existing),
    }
}
