//! Workflows bundled with the `stepline` binary.

pub mod signup;

use stepline_core::workflow::registry::WorkflowRegistry;
use stepline_types::error::DefinitionError;

/// Registry of every bundled workflow.
pub fn registry() -> Result<WorkflowRegistry, DefinitionError> {
    WorkflowRegistry::new([signup::signup_workflow()?])
}
