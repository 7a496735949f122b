//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `stepline-core` using sqlx with split
//! read/write pools. One row per execution in `workflow_executions`; the
//! partial unique index on `(workflow_type, args_hash) WHERE status =
//! 'running'` is what guarantees a single running execution per input.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepline_core::repository::workflow_store::WorkflowStore;
use stepline_types::context::WorkflowContext;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::{ExecutionStatus, WorkflowStatus};
use uuid::Uuid;

use super::pool::DatabasePool;

const SELECT_COLUMNS: &str = "workflow_id, workflow_type, status, current_step, input, context, \
     started_at, completed_at, org_id, user_id, error_message, args_hash";

/// SQLite-backed implementation of `WorkflowStore`.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, workflow_id: &Uuid) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 FROM workflow_executions WHERE workflow_id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_query_error)?;
        Ok(row.is_some())
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct ExecutionRow {
    workflow_id: String,
    workflow_type: String,
    status: String,
    current_step: String,
    input: String,
    context: String,
    started_at: String,
    completed_at: Option<String>,
    org_id: Option<String>,
    user_id: Option<String>,
    error_message: Option<String>,
    args_hash: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_id: row.try_get("workflow_id")?,
            workflow_type: row.try_get("workflow_type")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            input: row.try_get("input")?,
            context: row.try_get("context")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            org_id: row.try_get("org_id")?,
            user_id: row.try_get("user_id")?,
            error_message: row.try_get("error_message")?,
            args_hash: row.try_get("args_hash")?,
        })
    }

    fn into_status(self) -> Result<WorkflowStatus, RepositoryError> {
        let workflow_id = self
            .workflow_id
            .parse::<Uuid>()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?;
        let status: ExecutionStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let input = serde_json::from_str(&self.input)
            .map_err(|e| RepositoryError::Query(format!("invalid input JSON: {e}")))?;
        let context: WorkflowContext = serde_json::from_str(&self.context)
            .map_err(|e| RepositoryError::Query(format!("invalid context JSON: {e}")))?;
        let started_at = parse_datetime(&self.started_at)?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;

        Ok(WorkflowStatus {
            workflow_id,
            workflow_name: self.workflow_type,
            status,
            current_step: self.current_step,
            input,
            context,
            started_at,
            completed_at,
            error_message: self.error_message,
            input_hash: self.args_hash,
            org_id: self.org_id,
            user_id: self.user_id,
        })
    }
}

fn rows_to_statuses(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<WorkflowStatus>, RepositoryError> {
    rows.iter()
        .map(|row| {
            ExecutionRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_status()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn map_query_error(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            tracing::warn!("database unavailable: {err}");
            RepositoryError::Connection
        }
        _ => RepositoryError::Query(err.to_string()),
    }
}

fn map_write_error(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => RepositoryError::Conflict(
            "another execution is already running for this input".to_string(),
        ),
        _ => map_query_error(err),
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_workflow_status(&self, status: &WorkflowStatus) -> Result<(), RepositoryError> {
        let input_json = to_json(&status.input, "input")?;
        let context_json = to_json(&status.context, "context")?;
        let now = format_datetime(&Utc::now());

        // started_at and the identity columns are written on insert only;
        // the WHERE clause keeps terminal rows from being reopened.
        sqlx::query(
            r#"INSERT INTO workflow_executions
                 (workflow_id, workflow_type, status, current_step, input, context,
                  started_at, completed_at, org_id, user_id, error_message, args_hash,
                  created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id) DO UPDATE SET
                 status = excluded.status,
                 current_step = excluded.current_step,
                 context = excluded.context,
                 completed_at = COALESCE(workflow_executions.completed_at, excluded.completed_at),
                 error_message = excluded.error_message,
                 updated_at = excluded.updated_at
               WHERE workflow_executions.status = 'running'"#,
        )
        .bind(status.workflow_id.to_string())
        .bind(&status.workflow_name)
        .bind(status.status.as_str())
        .bind(&status.current_step)
        .bind(&input_json)
        .bind(&context_json)
        .bind(format_datetime(&status.started_at))
        .bind(status.completed_at.as_ref().map(format_datetime))
        .bind(&status.org_id)
        .bind(&status.user_id)
        .bind(&status.error_message)
        .bind(&status.input_hash)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(map_write_error)?;

        tracing::debug!(
            workflow_id = %status.workflow_id,
            status = %status.status,
            step = status.current_step.as_str(),
            "saved workflow status"
        );
        Ok(())
    }

    async fn get_workflow_status(&self, workflow_id: &Uuid) -> Result<WorkflowStatus, RepositoryError> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM workflow_executions WHERE workflow_id = ?");
        let row = sqlx::query(&sql)
            .bind(workflow_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(map_query_error)?
            .ok_or(RepositoryError::NotFound)?;

        ExecutionRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_status()
    }

    async fn get_running_workflow_by_hash(
        &self,
        workflow_name: &str,
        input_hash: &str,
    ) -> Result<Option<WorkflowStatus>, RepositoryError> {
        // Read from the writer so a claim committed a moment ago is visible
        // to the conflict fallback in `start_workflow`.
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM workflow_executions \
             WHERE workflow_type = ? AND args_hash = ? AND status = 'running' \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(workflow_name)
            .bind(input_hash)
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(map_query_error)?;

        match row {
            Some(row) => {
                let r = ExecutionRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_status()?))
            }
            None => Ok(None),
        }
    }

    async fn mark_workflow_completed(
        &self,
        workflow_id: &Uuid,
        final_context: &WorkflowContext,
    ) -> Result<(), RepositoryError> {
        let context_json = to_json(final_context, "context")?;
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = 'completed', context = ?, completed_at = ?, updated_at = ?
               WHERE workflow_id = ? AND status = 'running'"#,
        )
        .bind(&context_json)
        .bind(&now)
        .bind(&now)
        .bind(workflow_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_query_error)?;

        if result.rows_affected() == 0 && !self.exists(workflow_id).await? {
            return Err(RepositoryError::NotFound);
        }

        tracing::debug!(workflow_id = %workflow_id, "marked workflow completed");
        Ok(())
    }

    async fn mark_workflow_failed(
        &self,
        workflow_id: &Uuid,
        error_message: &str,
    ) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());

        let result = sqlx::query(
            r#"UPDATE workflow_executions
               SET status = 'failed', error_message = ?, completed_at = ?, updated_at = ?
               WHERE workflow_id = ? AND status = 'running'"#,
        )
        .bind(error_message)
        .bind(&now)
        .bind(&now)
        .bind(workflow_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(map_query_error)?;

        if result.rows_affected() == 0 && !self.exists(workflow_id).await? {
            return Err(RepositoryError::NotFound);
        }

        tracing::debug!(workflow_id = %workflow_id, error_message, "marked workflow failed");
        Ok(())
    }

    async fn list_running_workflows(&self) -> Result<Vec<WorkflowStatus>, RepositoryError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM workflow_executions \
             WHERE status = 'running' ORDER BY started_at ASC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(map_query_error)?;

        rows_to_statuses(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;
    use stepline_core::workflow::definition::{Step, Workflow};
    use stepline_core::workflow::executor::WorkflowExecutor;
    use stepline_core::workflow::handler::StepInvocation;
    use stepline_core::workflow::registry::WorkflowRegistry;
    use stepline_types::error::StepError;
    use stepline_types::workflow::{StepResult, WorkflowArgs};
    use tokio::task::JoinSet;

    use crate::queue::sqlite::SqliteJobQueue;
    use crate::sqlite::pool::test_pool;

    fn sample_status(hash: &str) -> WorkflowStatus {
        let args = WorkflowArgs::first(
            Uuid::new_v4(),
            "signup",
            json!({"email": "u@x.com", "org_id": "org-1", "user_id": "user-9"}),
            hash,
        );
        WorkflowStatus::running(&args, "validate", Utc::now())
    }

    #[tokio::test]
    async fn test_save_and_get_roundtrip() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let mut status = sample_status("h1");
        status.context.set("validated_email", "u@x.com");

        store.save_workflow_status(&status).await.unwrap();
        let fetched = store.get_workflow_status(&status.workflow_id).await.unwrap();

        assert_eq!(fetched.workflow_id, status.workflow_id);
        assert_eq!(fetched.workflow_name, "signup");
        assert_eq!(fetched.status, ExecutionStatus::Running);
        assert_eq!(fetched.current_step, "validate");
        assert_eq!(fetched.input, status.input);
        assert_eq!(fetched.context, status.context);
        assert_eq!(fetched.org_id.as_deref(), Some("org-1"));
        assert_eq!(fetched.user_id.as_deref(), Some("user-9"));
        assert_eq!(
            fetched.started_at.timestamp_micros(),
            status.started_at.timestamp_micros()
        );
        assert!(fetched.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let err = store.get_workflow_status(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_upsert_updates_context_but_keeps_started_at() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        let mut later = status.clone();
        later.started_at = status.started_at + Duration::minutes(5);
        later.current_step = "create_user".to_string();
        later.context.set("user_id", "user-9");
        store.save_workflow_status(&later).await.unwrap();

        let fetched = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(fetched.current_step, "create_user");
        assert_eq!(fetched.context.get_str("user_id"), Some("user-9"));
        assert_eq!(
            fetched.started_at.timestamp_micros(),
            status.started_at.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_running_by_hash_lifecycle() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        let found = store
            .get_running_workflow_by_hash("signup", "h1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.workflow_id, status.workflow_id);
        assert!(store
            .get_running_workflow_by_hash("other", "h1")
            .await
            .unwrap()
            .is_none());

        let mut ctx = WorkflowContext::new();
        ctx.set("a", 1);
        store
            .mark_workflow_completed(&status.workflow_id, &ctx)
            .await
            .unwrap();

        assert!(store
            .get_running_workflow_by_hash("signup", "h1")
            .await
            .unwrap()
            .is_none());
        let done = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.context, ctx);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_failed_sets_message() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        store
            .mark_workflow_failed(&status.workflow_id, "step 'create_user' failed")
            .await
            .unwrap();

        let failed = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("step 'create_user' failed"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_unknown_is_not_found() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let id = Uuid::new_v4();
        assert!(matches!(
            store.mark_workflow_completed(&id, &WorkflowContext::new()).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(matches!(
            store.mark_workflow_failed(&id, "boom").await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_running_hash_conflicts() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let first = sample_status("h1");
        let second = sample_status("h1");
        store.save_workflow_status(&first).await.unwrap();

        let err = store.save_workflow_status(&second).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        store
            .mark_workflow_failed(&first.workflow_id, "boom")
            .await
            .unwrap();
        store.save_workflow_status(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_rows_are_not_reopened() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();
        store
            .mark_workflow_completed(&status.workflow_id, &WorkflowContext::new())
            .await
            .unwrap();
        let done = store.get_workflow_status(&status.workflow_id).await.unwrap();

        // A stale running save and a late failure both leave the row alone.
        store.save_workflow_status(&status).await.unwrap();
        store
            .mark_workflow_failed(&status.workflow_id, "late")
            .await
            .unwrap();

        let after = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Completed);
        assert_eq!(after.completed_at, done.completed_at);
        assert!(after.error_message.is_none());
    }

    #[tokio::test]
    async fn test_list_running_oldest_first() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let mut older = sample_status("h1");
        older.started_at = Utc::now() - Duration::minutes(10);
        let newer = sample_status("h2");
        let done = sample_status("h3");

        store.save_workflow_status(&newer).await.unwrap();
        store.save_workflow_status(&older).await.unwrap();
        store.save_workflow_status(&done).await.unwrap();
        store
            .mark_workflow_completed(&done.workflow_id, &WorkflowContext::new())
            .await
            .unwrap();

        let ids: Vec<Uuid> = store
            .list_running_workflows()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.workflow_id)
            .collect();
        assert_eq!(ids, vec![older.workflow_id, newer.workflow_id]);
    }

    #[tokio::test]
    async fn test_closed_pool_is_connection_error() {
        let pool = test_pool().await;
        let store = SqliteWorkflowStore::new(pool.clone());
        pool.reader.close().await;
        pool.writer.close().await;

        let err = store.get_workflow_status(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Connection));
        let err = store.save_workflow_status(&sample_status("h1")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Connection));
    }

    // -- start races against the durable store --------------------------------

    async fn noop(_inv: StepInvocation) -> Result<StepResult, StepError> {
        Ok(StepResult::new())
    }

    fn registry() -> Arc<WorkflowRegistry> {
        let workflow = Workflow::builder("signup")
            .step(Step::new("validate", noop))
            .build()
            .unwrap();
        Arc::new(WorkflowRegistry::new([workflow]).unwrap())
    }

    async fn running_rows(pool: &DatabasePool) -> i64 {
        let (n,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workflow_executions WHERE status = 'running'")
                .fetch_one(&pool.writer)
                .await
                .unwrap();
        n
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_claim_one_execution() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let executor = Arc::new(WorkflowExecutor::new(
            registry(),
            SqliteWorkflowStore::new(pool.clone()),
            queue.clone(),
        ));

        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let executor = executor.clone();
            tasks.spawn(async move {
                executor
                    .start_workflow("signup", json!({"email": "race@x.com"}))
                    .await
                    .unwrap()
            });
        }

        let mut ids = HashSet::new();
        let mut new_starts = 0;
        while let Some(result) = tasks.join_next().await {
            let result = result.unwrap();
            if result.is_new_workflow {
                new_starts += 1;
            }
            ids.insert(result.workflow_id);
        }

        assert_eq!(ids.len(), 1);
        assert_eq!(new_starts, 1);
        assert_eq!(queue.counts().await.unwrap().available, 1);
        assert_eq!(running_rows(&pool).await, 1);
    }

    /// Store whose first running-by-hash lookup misses, as when a concurrent
    /// start commits its claim right after the lookup.
    struct LateLookupStore {
        inner: SqliteWorkflowStore,
        missed: AtomicBool,
    }

    impl WorkflowStore for LateLookupStore {
        async fn save_workflow_status(&self, status: &WorkflowStatus) -> Result<(), RepositoryError> {
            self.inner.save_workflow_status(status).await
        }

        async fn get_workflow_status(&self, workflow_id: &Uuid) -> Result<WorkflowStatus, RepositoryError> {
            self.inner.get_workflow_status(workflow_id).await
        }

        async fn get_running_workflow_by_hash(
            &self,
            workflow_name: &str,
            input_hash: &str,
        ) -> Result<Option<WorkflowStatus>, RepositoryError> {
            if !self.missed.swap(true, Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get_running_workflow_by_hash(workflow_name, input_hash).await
        }

        async fn mark_workflow_completed(
            &self,
            workflow_id: &Uuid,
            final_context: &WorkflowContext,
        ) -> Result<(), RepositoryError> {
            self.inner.mark_workflow_completed(workflow_id, final_context).await
        }

        async fn mark_workflow_failed(&self, workflow_id: &Uuid, error_message: &str) -> Result<(), RepositoryError> {
            self.inner.mark_workflow_failed(workflow_id, error_message).await
        }

        async fn list_running_workflows(&self) -> Result<Vec<WorkflowStatus>, RepositoryError> {
            self.inner.list_running_workflows().await
        }
    }

    #[tokio::test]
    async fn test_start_losing_claim_resolves_to_winner() {
        let pool = test_pool().await;
        let queue = SqliteJobQueue::new(pool.clone());
        let input = json!({"email": "race@x.com"});

        let winner = WorkflowExecutor::new(registry(), SqliteWorkflowStore::new(pool.clone()), queue.clone())
            .start_workflow("signup", input.clone())
            .await
            .unwrap();

        let late = WorkflowExecutor::new(
            registry(),
            LateLookupStore {
                inner: SqliteWorkflowStore::new(pool.clone()),
                missed: AtomicBool::new(false),
            },
            queue.clone(),
        );
        let loser = late.start_workflow("signup", input).await.unwrap();

        assert!(!loser.is_new_workflow);
        assert_eq!(loser.workflow_id, winner.workflow_id);
        assert_eq!(
            loser.existing_status.unwrap().status,
            ExecutionStatus::Running
        );
        assert_eq!(queue.counts().await.unwrap().available, 1);
        assert_eq!(running_rows(&pool).await, 1);
    }
}
