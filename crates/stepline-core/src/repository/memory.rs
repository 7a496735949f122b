//! In-memory workflow store.
//!
//! Keeps execution records and the hash index in two maps behind a single
//! async mutex so every read-modify-write runs under one lock. Reads return
//! clones; callers never hold references into shared state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use stepline_types::context::WorkflowContext;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::{ExecutionStatus, WorkflowStatus};

use super::workflow_store::WorkflowStore;

type HashKey = (String, String);

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowStatus>,
    hash_index: HashMap<HashKey, Uuid>,
}

impl Inner {
    fn release_hash(&mut self, status: &WorkflowStatus) {
        let key = (status.workflow_name.clone(), status.input_hash.clone());
        if self.hash_index.get(&key) == Some(&status.workflow_id) {
            self.hash_index.remove(&key);
        }
    }
}

/// Process-local `WorkflowStore`, shared by cloning.
#[derive(Clone, Default)]
pub struct InMemoryWorkflowStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.workflows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_workflow_status(&self, status: &WorkflowStatus) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let mut record = status.clone();

        if let Some(existing) = inner.workflows.get(&status.workflow_id) {
            if existing.is_terminal() {
                tracing::debug!(
                    workflow_id = %status.workflow_id,
                    status = %existing.status,
                    "ignoring save over terminal workflow"
                );
                return Ok(());
            }
            record.started_at = existing.started_at;
        }

        if record.status == ExecutionStatus::Running {
            let key = (record.workflow_name.clone(), record.input_hash.clone());
            if let Some(holder) = inner.hash_index.get(&key) {
                let held = *holder != record.workflow_id
                    && inner
                        .workflows
                        .get(holder)
                        .is_some_and(|w| w.status == ExecutionStatus::Running);
                if held {
                    return Err(RepositoryError::Conflict(format!(
                        "workflow {holder} is already running for this input"
                    )));
                }
            }
            inner.hash_index.insert(key, record.workflow_id);
        }

        inner.workflows.insert(record.workflow_id, record);
        Ok(())
    }

    async fn get_workflow_status(&self, workflow_id: &Uuid) -> Result<WorkflowStatus, RepositoryError> {
        let inner = self.inner.lock().await;
        inner
            .workflows
            .get(workflow_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_running_workflow_by_hash(
        &self,
        workflow_name: &str,
        input_hash: &str,
    ) -> Result<Option<WorkflowStatus>, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let key = (workflow_name.to_string(), input_hash.to_string());

        let Some(id) = inner.hash_index.get(&key).copied() else {
            return Ok(None);
        };

        let running = inner
            .workflows
            .get(&id)
            .filter(|status| status.status == ExecutionStatus::Running)
            .cloned();
        if running.is_none() {
            // Orphaned entry: the record finished or was never stored.
            inner.hash_index.remove(&key);
        }
        Ok(running)
    }

    async fn mark_workflow_completed(
        &self,
        workflow_id: &Uuid,
        final_context: &WorkflowContext,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let status = inner
            .workflows
            .get_mut(workflow_id)
            .ok_or(RepositoryError::NotFound)?;

        if status.is_terminal() {
            return Ok(());
        }
        status.status = ExecutionStatus::Completed;
        status.context = final_context.clone();
        status.completed_at = Some(Utc::now());

        let snapshot = status.clone();
        inner.release_hash(&snapshot);
        Ok(())
    }

    async fn mark_workflow_failed(
        &self,
        workflow_id: &Uuid,
        error_message: &str,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        let status = inner
            .workflows
            .get_mut(workflow_id)
            .ok_or(RepositoryError::NotFound)?;

        if status.is_terminal() {
            return Ok(());
        }
        status.status = ExecutionStatus::Failed;
        status.error_message = Some(error_message.to_string());
        status.completed_at = Some(Utc::now());

        let snapshot = status.clone();
        inner.release_hash(&snapshot);
        Ok(())
    }

    async fn list_running_workflows(&self) -> Result<Vec<WorkflowStatus>, RepositoryError> {
        let inner = self.inner.lock().await;
        let mut running: Vec<WorkflowStatus> = inner
            .workflows
            .values()
            .filter(|w| w.status == ExecutionStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|w| w.started_at);
        Ok(running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use stepline_types::workflow::WorkflowArgs;

    fn sample_status(hash: &str) -> WorkflowStatus {
        let args = WorkflowArgs::first(Uuid::new_v4(), "signup", json!({"email": "u@x.com"}), hash);
        WorkflowStatus::running(&args, "validate", Utc::now())
    }

    #[tokio::test]
    async fn test_save_and_get_returns_copy() {
        let store = InMemoryWorkflowStore::new();
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        let mut fetched = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(fetched, status);

        fetched.context.set("mutated", true);
        let again = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert!(!again.context.contains_key("mutated"));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = InMemoryWorkflowStore::new();
        let err = store.get_workflow_status(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_running_by_hash_found_until_completed() {
        let store = InMemoryWorkflowStore::new();
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        let found = store.get_running_workflow_by_hash("signup", "h1").await.unwrap();
        assert_eq!(found.map(|s| s.workflow_id), Some(status.workflow_id));

        let mut ctx = WorkflowContext::new();
        ctx.set("a", 1);
        store
            .mark_workflow_completed(&status.workflow_id, &ctx)
            .await
            .unwrap();

        assert!(store.get_running_workflow_by_hash("signup", "h1").await.unwrap().is_none());
        let done = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(done.context, ctx);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_mark_failed_records_message_and_releases_hash() {
        let store = InMemoryWorkflowStore::new();
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        store
            .mark_workflow_failed(&status.workflow_id, "step 'create_user' failed")
            .await
            .unwrap();

        let failed = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("step 'create_user' failed"));
        assert!(store.get_running_workflow_by_hash("signup", "h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_unknown_is_not_found() {
        let store = InMemoryWorkflowStore::new();
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
    async fn test_second_running_record_with_same_hash_conflicts() {
        let store = InMemoryWorkflowStore::new();
        let first = sample_status("h1");
        let second = sample_status("h1");
        store.save_workflow_status(&first).await.unwrap();

        let err = store.save_workflow_status(&second).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));

        // Once the first finishes the hash is free again.
        store
            .mark_workflow_completed(&first.workflow_id, &WorkflowContext::new())
            .await
            .unwrap();
        store.save_workflow_status(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_keeps_started_at_and_never_reopens_terminal() {
        let store = InMemoryWorkflowStore::new();
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        let mut later = status.clone();
        later.started_at = status.started_at + Duration::minutes(5);
        later.context.set("a", 1);
        store.save_workflow_status(&later).await.unwrap();

        let fetched = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(fetched.started_at, status.started_at);
        assert_eq!(fetched.context.get("a"), Some(&json!(1)));

        store
            .mark_workflow_failed(&status.workflow_id, "boom")
            .await
            .unwrap();
        store.save_workflow_status(&later).await.unwrap();
        let fetched = store.get_workflow_status(&status.workflow_id).await.unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_completed_at_set_once() {
        let store = InMemoryWorkflowStore::new();
        let status = sample_status("h1");
        store.save_workflow_status(&status).await.unwrap();

        store
            .mark_workflow_completed(&status.workflow_id, &WorkflowContext::new())
            .await
            .unwrap();
        let first = store.get_workflow_status(&status.workflow_id).await.unwrap();

        store
            .mark_workflow_failed(&status.workflow_id, "late failure")
            .await
            .unwrap();
        let second = store.get_workflow_status(&status.workflow_id).await.unwrap();

        assert_eq!(second.status, ExecutionStatus::Completed);
        assert_eq!(second.completed_at, first.completed_at);
        assert!(second.error_message.is_none());
    }

    #[tokio::test]
    async fn test_list_running_oldest_first() {
        let store = InMemoryWorkflowStore::new();
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

        let running = store.list_running_workflows().await.unwrap();
        let ids: Vec<Uuid> = running.iter().map(|s| s.workflow_id).collect();
        assert_eq!(ids, vec![older.workflow_id, newer.workflow_id]);
    }
}
