//! Immutable workflow registry owned by the executor.

use std::collections::HashMap;
use std::sync::Arc;

use stepline_types::error::DefinitionError;

use super::definition::Workflow;

/// Workflows keyed by name. Built once; read-only afterwards.
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowRegistry {
    /// Build a registry, rejecting duplicate workflow names.
    pub fn new(workflows: impl IntoIterator<Item = Workflow>) -> Result<Self, DefinitionError> {
        let mut map = HashMap::new();
        for workflow in workflows {
            let name = workflow.name().to_string();
            if map.contains_key(&name) {
                return Err(DefinitionError::DuplicateWorkflow(name));
            }
            map.insert(name, Arc::new(workflow));
        }
        Ok(Self { workflows: map })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Workflow>> {
        self.workflows.get(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}
