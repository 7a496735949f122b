//! Workflow store trait definition.
//!
//! Defines the persistence contract for workflow execution records and the
//! deduplication hash index. The infrastructure layer (stepline-infra)
//! implements this trait with SQLite; [`super::memory`] provides an
//! in-process implementation.

use stepline_types::context::WorkflowContext;
use stepline_types::error::RepositoryError;
use stepline_types::workflow::WorkflowStatus;
use uuid::Uuid;

/// Repository trait for workflow execution records.
///
/// Contract shared by every implementation:
/// - At most one record per (workflow name, input hash) is `running`. Saving a
///   running record whose hash is held by a different running record fails
///   with [`RepositoryError::Conflict`].
/// - `started_at` is kept from the first write; later saves never change it.
/// - Terminal records never move back to `running`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// Cancellation is drop-based: callers may drop any returned future.
pub trait WorkflowStore: Send + Sync {
    /// Upsert a record by workflow id.
    fn save_workflow_status(
        &self,
        status: &WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a record by id, or [`RepositoryError::NotFound`].
    fn get_workflow_status(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<WorkflowStatus, RepositoryError>> + Send;

    /// Find the running record for a (workflow name, input hash) pair.
    fn get_running_workflow_by_hash(
        &self,
        workflow_name: &str,
        input_hash: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowStatus>, RepositoryError>> + Send;

    /// Mark a record completed with its final context and release its hash.
    fn mark_workflow_completed(
        &self,
        workflow_id: &Uuid,
        final_context: &WorkflowContext,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark a record failed with an error message and release its hash.
    fn mark_workflow_failed(
        &self,
        workflow_id: &Uuid,
        error_message: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All running records, oldest first.
    fn list_running_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowStatus>, RepositoryError>> + Send;
}
