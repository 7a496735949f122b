use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Errors from repository operations (used by trait definitions in stepline-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Error returned by a step handler.
#[derive(Debug, Error)]
pub enum StepError {
    /// Retried up to the step's `max_retries`.
    #[error("{0}")]
    Transient(String),

    /// Skips any remaining retries and escalates immediately.
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    pub fn transient(err: impl fmt::Display) -> Self {
        StepError::Transient(err.to_string())
    }

    pub fn fatal(err: impl fmt::Display) -> Self {
        StepError::Fatal(err.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StepError::Fatal(_))
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Transient(format!("serialization error: {err}"))
    }
}

/// Errors from the job queue collaborator.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,

    #[error("failed to insert job: {0}")]
    Insert(String),

    #[error("job storage error: {0}")]
    Storage(String),
}

/// Problems with a workflow definition or the registry built from them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("workflow '{workflow}' defines step '{step}' more than once")]
    DuplicateStep { workflow: String, step: String },

    #[error("workflow '{workflow}' first step '{step}' is not defined")]
    UnknownFirstStep { workflow: String, step: String },

    #[error("workflow '{workflow}' flow references unknown step '{step}'")]
    UnknownFlowStep { workflow: String, step: String },

    #[error("workflow '{0}' is registered more than once")]
    DuplicateWorkflow(String),
}

/// Errors surfaced to callers starting or inspecting workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("input validation failed: {0}")]
    Validation(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("workflow {0} not found")]
    NotFound(Uuid),

    #[error("failed to hash input: {0}")]
    Hash(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
