//! Worker pool polling the durable job queue.
//!
//! `WorkerPool` runs N workers that claim jobs from a [`SqliteJobQueue`] and
//! hand them to a `JobWorker` (the workflow executor). Each delivery runs
//! under the worker-reported deadline; a retryable failure makes the job
//! available again after its requested delay, and the last allowed delivery
//! discards it and tells the worker through `JobWorker::discarded`.

use std::sync::Arc;
use std::time::Duration;

use stepline_core::queue::{Job, JobWorker, WorkError};
use stepline_types::config::EngineConfig;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::sqlite::SqliteJobQueue;

/// Sizing and limits for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Deliveries of one job before it is discarded.
    pub max_delivery_attempts: u32,
    /// Used when the worker reports no timeout for a job.
    pub default_timeout: Duration,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            max_delivery_attempts: config.max_delivery_attempts.max(1),
            default_timeout: config.default_step_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Running set of workers consuming a [`SqliteJobQueue`].
pub struct WorkerPool {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers.
    pub fn start<W: JobWorker + 'static>(
        worker: Arc<W>,
        queue: SqliteJobQueue,
        config: WorkerPoolConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for worker_index in 0..config.workers.max(1) {
            let worker = worker.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            let config = config.clone();

            tasks.spawn(async move {
                tracing::debug!(worker_index, "worker started");
                while !cancel.is_cancelled() {
                    // Claims are not raced against cancellation: a claim
                    // dropped mid-statement would strand the job until rescue.
                    match queue.fetch_next().await {
                        Ok(Some(job)) => {
                            process(worker.as_ref(), &queue, job, &config, &cancel).await;
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(worker_index, "failed to fetch job: {e}"),
                    }

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.poll_interval) => {}
                    }
                }
                tracing::debug!(worker_index, "worker stopped");
            });
        }

        tracing::info!(workers = config.workers, "worker pool started");
        Self { cancel, tasks }
    }

    /// Stop claiming jobs and wait up to `grace` for in-flight ones.
    ///
    /// Jobs still running when the grace period ends stay claimed and are
    /// rescued by a later worker once their claim is old enough.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();

        let drained = tokio::time::timeout(grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "workers still busy after grace period, aborting");
            self.tasks.abort_all();
        }
        tracing::info!("worker pool stopped");
    }
}

async fn process<W: JobWorker>(
    worker: &W,
    queue: &SqliteJobQueue,
    job: Job,
    config: &WorkerPoolConfig,
    cancel: &CancellationToken,
) {
    let timeout = worker.timeout(&job).unwrap_or(config.default_timeout);
    let job_cancel = cancel.child_token();

    let outcome = match tokio::time::timeout(timeout, worker.work(&job, job_cancel.clone())).await {
        Ok(outcome) => outcome,
        Err(_) => {
            job_cancel.cancel();
            Err(WorkError::Retry {
                message: format!("job timed out after {}ms", timeout.as_millis()),
                delay: Duration::ZERO,
            })
        }
    };

    let recorded = match outcome {
        Ok(()) => {
            tracing::debug!(job_id = job.id, kind = job.kind(), attempt = job.attempt, "job completed");
            queue.complete(&job).await
        }
        Err(WorkError::Permanent(message)) => {
            tracing::warn!(job_id = job.id, attempt = job.attempt, "job cancelled: {message}");
            queue.cancel(&job, &message).await
        }
        Err(WorkError::Retry { message, .. }) if job.attempt >= config.max_delivery_attempts => {
            tracing::error!(
                job_id = job.id,
                workflow_id = %job.args.workflow_id,
                attempt = job.attempt,
                "job discarded after max delivery attempts: {message}"
            );
            worker.discarded(&job, &message).await;
            queue.discard(&job, &message).await
        }
        Err(WorkError::Retry { message, delay }) => {
            tracing::info!(
                job_id = job.id,
                attempt = job.attempt,
                delay_ms = delay.as_millis() as u64,
                "job will be retried: {message}"
            );
            queue.retry(&job, delay, &message).await
        }
    };

    match recorded {
        Ok(true) => {}
        Ok(false) => tracing::warn!(
            job_id = job.id,
            attempt = job.attempt,
            "job was reclaimed by another worker, outcome dropped"
        ),
        Err(e) => tracing::error!(job_id = job.id, "failed to record job outcome: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
