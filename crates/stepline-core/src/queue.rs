//! Job queue seam between the executor and a queue technology.
//!
//! The executor produces work through [`JobQueue::insert`] and consumes it
//! by implementing [`JobWorker`]. A queue implementation (see
//! `stepline-infra::queue`) owns delivery, redelivery and timeouts.

use std::time::Duration;

use stepline_types::error::QueueError;
use stepline_types::workflow::WorkflowArgs;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Queue name used when a step does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Options for a single insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOpts {
    pub queue: String,
}

impl InsertOpts {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }
}

impl Default for InsertOpts {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE)
    }
}

/// Handle for an inserted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: u64,
    pub queue: String,
}

/// One delivery of a queued step invocation.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub queue: String,
    /// Delivery count, starting at 1 and incremented on every redelivery.
    pub attempt: u32,
    pub args: WorkflowArgs,
}

impl Job {
    pub fn kind(&self) -> &'static str {
        WorkflowArgs::KIND
    }
}

/// Producer side of a job queue.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobQueue: Send + Sync {
    /// Schedule one step invocation.
    fn insert(
        &self,
        args: WorkflowArgs,
        opts: InsertOpts,
    ) -> impl std::future::Future<Output = Result<JobHandle, QueueError>> + Send;

    /// Whether a job for `workflow_id` is waiting or being worked on.
    fn has_live_job(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;
}

/// How a worker reports a failed delivery back to the queue.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkError {
    /// Redeliver the same job after `delay`.
    #[error("{message}")]
    Retry { message: String, delay: Duration },

    /// Never redeliver this job.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl WorkError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, WorkError::Permanent(_))
    }
}

/// Consumer side of a job queue.
pub trait JobWorker: Send + Sync {
    /// Deadline the queue enforces around [`JobWorker::work`] for this job.
    fn timeout(&self, job: &Job) -> Option<Duration>;

    /// Process one delivery. `Ok` acknowledges the job.
    fn work(
        &self,
        job: &Job,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<(), WorkError>> + Send;

    /// Called once when the queue gives up on a job after its last
    /// allowed delivery failed with [`WorkError::Retry`].
    fn discarded(&self, job: &Job, reason: &str) -> impl std::future::Future<Output = ()> + Send;
}
