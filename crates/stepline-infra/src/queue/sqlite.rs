//! Durable job queue over the `step_jobs` table.
//!
//! Every process that opens the same database shares this queue: a job
//! inserted by `stepline start` is claimed by whichever `stepline worker`
//! polls next. A claim is a single `UPDATE ... RETURNING` statement on the
//! writer connection, so one delivery goes to one worker. A job left
//! `running` longer than the rescue window is treated as abandoned by a dead
//! worker and becomes claimable again with its delivery attempt incremented.
//!
//! Outcomes are recorded against the (id, attempt) pair that was claimed; a
//! late outcome for a delivery that has since been rescued is ignored.
//! Completed jobs are deleted. Discarded and cancelled jobs stay for
//! inspection.

use std::time::Duration;

use chrono::Utc;
use sqlx::Row;
use stepline_core::queue::{InsertOpts, Job, JobHandle, JobQueue};
use stepline_types::error::QueueError;
use stepline_types::workflow::WorkflowArgs;
use uuid::Uuid;

use crate::sqlite::pool::DatabasePool;
use crate::sqlite::workflow_store::format_datetime;

const DEFAULT_RESCUE_AFTER: Duration = Duration::from_secs(900);

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub available: usize,
    pub running: usize,
    pub discarded: usize,
    pub cancelled: usize,
}

impl JobCounts {
    /// Jobs that will still be delivered.
    pub fn pending(&self) -> usize {
        self.available + self.running
    }
}

/// `JobQueue` backed by SQLite. Cheap to clone.
#[derive(Clone)]
pub struct SqliteJobQueue {
    pool: DatabasePool,
    rescue_after: Duration,
}

impl SqliteJobQueue {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            pool,
            rescue_after: DEFAULT_RESCUE_AFTER,
        }
    }

    /// How long a claimed job may stay `running` before another worker may take it.
    pub fn with_rescue_after(mut self, rescue_after: Duration) -> Self {
        self.rescue_after = rescue_after;
        self
    }

    /// Claim the next due job, if any, incrementing its delivery attempt.
    pub async fn fetch_next(&self) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let rescue_before = now - delta(self.rescue_after);

        let row = sqlx::query(
            r#"UPDATE step_jobs
               SET state = 'running', attempt = attempt + 1, attempted_at = ?1
               WHERE id = (
                   SELECT id FROM step_jobs
                   WHERE kind = ?2
                     AND ((state = 'available' AND scheduled_at <= ?1)
                       OR (state = 'running' AND attempted_at < ?3))
                   ORDER BY scheduled_at, id
                   LIMIT 1
               )
               RETURNING id, queue, attempt, args"#,
        )
        .bind(format_datetime(&now))
        .bind(WorkflowArgs::KIND)
        .bind(format_datetime(&rescue_before))
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| storage_error(e, QueueError::Storage))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row.get("id");
        let attempt: i64 = row.get("attempt");
        let queue: String = row.get("queue");
        let payload: String = row.get("args");

        let job_id = id as u64;
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);

        match serde_json::from_str::<WorkflowArgs>(&payload) {
            Ok(args) => {
                tracing::debug!(job_id, attempt, queue = queue.as_str(), "job claimed");
                Ok(Some(Job {
                    id: job_id,
                    queue,
                    attempt,
                    args,
                }))
            }
            Err(e) => {
                let message = format!("undecodable job args: {e}");
                self.finalize(job_id, attempt, "discarded", &message).await?;
                Err(QueueError::Storage(format!("job {job_id}: {message}")))
            }
        }
    }

    /// Acknowledge a delivery. Returns false if the job was reclaimed meanwhile.
    pub async fn complete(&self, job: &Job) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "DELETE FROM step_jobs WHERE id = ? AND attempt = ? AND state = 'running'",
        )
        .bind(job.id as i64)
        .bind(i64::from(job.attempt))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| storage_error(e, QueueError::Storage))?;
        Ok(result.rows_affected() == 1)
    }

    /// Make the job available again once `delay` has passed.
    pub async fn retry(&self, job: &Job, delay: Duration, message: &str) -> Result<bool, QueueError> {
        let scheduled_at = Utc::now() + delta(delay);
        let result = sqlx::query(
            r#"UPDATE step_jobs
               SET state = 'available', scheduled_at = ?, last_error = ?
               WHERE id = ? AND attempt = ? AND state = 'running'"#,
        )
        .bind(format_datetime(&scheduled_at))
        .bind(message)
        .bind(job.id as i64)
        .bind(i64::from(job.attempt))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| storage_error(e, QueueError::Storage))?;
        Ok(result.rows_affected() == 1)
    }

    /// Stop delivering a job whose retryable failures ran out of deliveries.
    pub async fn discard(&self, job: &Job, message: &str) -> Result<bool, QueueError> {
        self.finalize(job.id, job.attempt, "discarded", message).await
    }

    /// Stop delivering a job that failed permanently.
    pub async fn cancel(&self, job: &Job, message: &str) -> Result<bool, QueueError> {
        self.finalize(job.id, job.attempt, "cancelled", message).await
    }

    async fn finalize(&self, id: u64, attempt: u32, state: &str, message: &str) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"UPDATE step_jobs
               SET state = ?, finalized_at = ?, last_error = ?
               WHERE id = ? AND attempt = ? AND state = 'running'"#,
        )
        .bind(state)
        .bind(format_datetime(&Utc::now()))
        .bind(message)
        .bind(id as i64)
        .bind(i64::from(attempt))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| storage_error(e, QueueError::Storage))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn counts(&self) -> Result<JobCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM step_jobs GROUP BY state")
            .fetch_all(&self.pool.writer)
            .await
            .map_err(|e| storage_error(e, QueueError::Storage))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.get("state");
            let n = row.get::<i64, _>("n") as usize;
            match state.as_str() {
                "available" => counts.available = n,
                "running" => counts.running = n,
                "discarded" => counts.discarded = n,
                "cancelled" => counts.cancelled = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    /// Poll every `interval` until no job is available or running.
    pub async fn wait_idle(&self, interval: Duration) -> Result<(), QueueError> {
        while self.counts().await?.pending() > 0 {
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }
}

impl JobQueue for SqliteJobQueue {
    async fn insert(&self, args: WorkflowArgs, opts: InsertOpts) -> Result<JobHandle, QueueError> {
        let payload = serde_json::to_string(&args)
            .map_err(|e| QueueError::Insert(format!("serialize args: {e}")))?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"INSERT INTO step_jobs (kind, queue, workflow_id, args, scheduled_at, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(WorkflowArgs::KIND)
        .bind(&opts.queue)
        .bind(args.workflow_id.to_string())
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| storage_error(e, QueueError::Insert))?;

        let job_id = result.last_insert_rowid() as u64;
        tracing::debug!(
            job_id,
            workflow_id = %args.workflow_id,
            step = args.current_step.as_str(),
            queue = opts.queue.as_str(),
            kind = WorkflowArgs::KIND,
            "job inserted"
        );
        Ok(JobHandle {
            job_id,
            queue: opts.queue,
        })
    }

    async fn has_live_job(&self, workflow_id: &Uuid) -> Result<bool, QueueError> {
        let row = sqlx::query(
            "SELECT 1 FROM step_jobs WHERE workflow_id = ? AND state IN ('available', 'running') LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| storage_error(e, QueueError::Storage))?;
        Ok(row.is_some())
    }
}

fn delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn storage_error(err: sqlx::Error, wrap: fn(String) -> QueueError) -> QueueError {
    match err {
        sqlx::Error::PoolClosed => QueueError::Closed,
        other => wrap(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::sqlite::pool::test_pool;

    fn args() -> WorkflowArgs {
        WorkflowArgs::first(Uuid::new_v4(), "signup", json!({"email": "u@x.com"}), "hash")
    }

    #[tokio::test]
    async fn test_insert_assigns_ids_and_queue() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let first = queue.insert(args(), InsertOpts::new("external")).await.unwrap();
        let second = queue.insert(args(), InsertOpts::default()).await.unwrap();

        assert_eq!(first.queue, "external");
        assert_eq!(second.queue, "default");
        assert!(second.job_id > first.job_id);
        assert_eq!(queue.counts().await.unwrap().available, 2);
    }

    #[tokio::test]
    async fn test_job_is_claimed_once() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let args = args();
        let handle = queue.insert(args.clone(), InsertOpts::new("fast")).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(job.id, handle.job_id);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.queue, "fast");
        assert_eq!(job.args, args);
        assert_eq!(job.kind(), "workflow_execution");

        assert!(queue.fetch_next().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn test_complete_removes_job() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let args = args();
        queue.insert(args.clone(), InsertOpts::default()).await.unwrap();
        assert!(queue.has_live_job(&args.workflow_id).await.unwrap());

        let job = queue.fetch_next().await.unwrap().unwrap();
        assert!(queue.complete(&job).await.unwrap());

        assert_eq!(queue.counts().await.unwrap(), JobCounts::default());
        assert!(!queue.has_live_job(&args.workflow_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_waits_for_delay_and_increments_attempt() {
        let queue = SqliteJobQueue::new(test_pool().await);
        queue.insert(args(), InsertOpts::default()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        assert!(queue.retry(&job, Duration::from_secs(60), "busy").await.unwrap());
        assert!(queue.fetch_next().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().available, 1);

        queue.insert(args(), InsertOpts::default()).await.unwrap();
        let other = queue.fetch_next().await.unwrap().unwrap();
        assert!(queue.retry(&other, Duration::ZERO, "busy").await.unwrap());
        let again = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(again.id, other.id);
        assert_eq!(again.attempt, 2);
    }

    #[tokio::test]
    async fn test_discard_and_cancel_are_kept_but_not_live() {
        let queue = SqliteJobQueue::new(test_pool().await);
        let discarded = args();
        let cancelled = args();
        queue.insert(discarded.clone(), InsertOpts::default()).await.unwrap();
        queue.insert(cancelled.clone(), InsertOpts::default()).await.unwrap();

        let job = queue.fetch_next().await.unwrap().unwrap();
        assert!(queue.discard(&job, "out of deliveries").await.unwrap());
        let job = queue.fetch_next().await.unwrap().unwrap();
        assert!(queue.cancel(&job, "unknown workflow").await.unwrap());

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.discarded, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.pending(), 0);
        assert!(!queue.has_live_job(&discarded.workflow_id).await.unwrap());
        assert!(!queue.has_live_job(&cancelled.workflow_id).await.unwrap());
        assert!(queue.fetch_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_rescued() {
        let queue = SqliteJobQueue::new(test_pool().await).with_rescue_after(Duration::ZERO);
        queue.insert(args(), InsertOpts::default()).await.unwrap();

        let first = queue.fetch_next().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let rescued = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(rescued.id, first.id);
        assert_eq!(rescued.attempt, 2);

        // The first worker's late outcome no longer applies.
        assert!(!queue.complete(&first).await.unwrap());
        assert!(queue.complete(&rescued).await.unwrap());
    }

    #[tokio::test]
    async fn test_jobs_are_shared_between_pools_on_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let producer = SqliteJobQueue::new(DatabasePool::open(&path).await.unwrap());
        let consumer = SqliteJobQueue::new(DatabasePool::open(&path).await.unwrap());

        let args = args();
        producer.insert(args.clone(), InsertOpts::default()).await.unwrap();
        let job = consumer.fetch_next().await.unwrap().unwrap();
        assert_eq!(job.args.workflow_id, args.workflow_id);
    }

    #[tokio::test]
    async fn test_closed_pool_reports_closed() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        pool.writer.close().await;

        let err = queue.insert(args(), InsertOpts::default()).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
