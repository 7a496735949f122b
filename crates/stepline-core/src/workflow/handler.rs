//! Step handler traits.
//!
//! Follows the same blanket-impl pattern used for other dynamic dispatch in
//! this workspace:
//! 1. `StepHandler` is the ergonomic RPITIT trait (closures implement it)
//! 2. `StepHandlerDyn` is its object-safe twin with boxed futures
//! 3. `BoxStepHandler` wraps `Arc<dyn StepHandlerDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use stepline_types::context::WorkflowContext;
use stepline_types::error::StepError;
use stepline_types::workflow::StepResult;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything a step receives for one execution.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub step_name: String,
    /// Zero-based attempt for this step.
    pub attempt: u32,
    /// Original workflow input.
    pub input: Value,
    /// Context accumulated by the previous steps.
    pub context: WorkflowContext,
    /// Cancelled when the queue shuts down or abandons the job.
    pub cancel: CancellationToken,
}

/// Business logic of one step.
pub trait StepHandler: Send + Sync {
    fn run(
        &self,
        invocation: StepInvocation,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send;
}

impl<F, Fut> StepHandler for F
where
    F: Fn(StepInvocation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepResult, StepError>> + Send,
{
    fn run(
        &self,
        invocation: StepInvocation,
    ) -> impl Future<Output = Result<StepResult, StepError>> + Send {
        (self)(invocation)
    }
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        invocation: StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn run_boxed<'a>(
        &'a self,
        invocation: StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, StepError>> + Send + 'a>> {
        Box::pin(self.run(invocation))
    }
}

/// Type-erased, cheaply cloneable step handler.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn run(&self, invocation: StepInvocation) -> Result<StepResult, StepError> {
        self.inner.run_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxStepHandler")
    }
}
