//! Static workflow and step definitions.
//!
//! A [`Workflow`] is built once at process setup with [`WorkflowBuilder`] and
//! never mutated afterwards. Steps are referenced by name everywhere else;
//! only the definition holds the handler.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepline_types::error::DefinitionError;

use super::handler::{BoxStepHandler, StepHandler};
use crate::queue::DEFAULT_QUEUE;

/// Upfront check of a workflow's input, run before anything is enqueued.
pub type InputValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of business logic with its own retry/optionality/timeout policy.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub is_optional: bool,
    /// Failed attempts tolerated before escalation.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub queue: String,
    /// `None` defers to the queue's default timeout.
    pub timeout: Option<Duration>,
    handler: BoxStepHandler,
}

impl Step {
    pub fn new<H: StepHandler + 'static>(name: impl Into<String>, handler: H) -> Self {
        Self {
            name: name.into(),
            is_optional: false,
            max_retries: 0,
            retry_delay: Duration::ZERO,
            queue: DEFAULT_QUEUE.to_string(),
            timeout: None,
            handler: BoxStepHandler::new(handler),
        }
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handler(&self) -> &BoxStepHandler {
        &self.handler
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("is_optional", &self.is_optional)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("queue", &self.queue)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A named, ordered sequence of steps with a flow graph.
pub struct Workflow {
    name: String,
    steps: Vec<Step>,
    step_flow: HashMap<String, String>,
    first_step: String,
    validator: Option<InputValidator>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            steps: Vec::new(),
            step_flow: HashMap::new(),
            first_step: None,
            validator: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn first_step(&self) -> &str {
        &self.first_step
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Step that follows `current` in the flow, or `None` at the end.
    pub fn next_step(&self, current: &str) -> Option<&str> {
        self.step_flow
            .get(current)
            .map(String::as_str)
            .filter(|next| !next.is_empty())
    }

    /// Run the input validator, if one is configured.
    pub fn validate_input(&self, input: &Value) -> Result<(), String> {
        match &self.validator {
            Some(validate) => validate(input),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("step_flow", &self.step_flow)
            .field("first_step", &self.first_step)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Builder for [`Workflow`]. `build` checks the definition is consistent.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<Step>,
    step_flow: HashMap<String, String>,
    first_step: Option<String>,
    validator: Option<InputValidator>,
}

impl WorkflowBuilder {
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Route `from` to `to` after `from` succeeds. An empty `to` ends the workflow.
    pub fn flow(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.step_flow.insert(from.into(), to.into());
        self
    }

    /// Defaults to the first step added.
    pub fn first_step(mut self, name: impl Into<String>) -> Self {
        self.first_step = Some(name.into());
        self
    }

    pub fn validator<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validate));
        self
    }

    pub fn build(self) -> Result<Workflow, DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.name));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow: self.name.clone(),
                    step: step.name.clone(),
                });
            }
        }

        let first_step = match self.first_step {
            Some(first) => first,
            None => self.steps[0].name.clone(),
        };
        if !names.contains(first_step.as_str()) {
            return Err(DefinitionError::UnknownFirstStep {
                workflow: self.name,
                step: first_step,
            });
        }

        for (from, to) in &self.step_flow {
            let unknown = if !names.contains(from.as_str()) {
                Some(from)
            } else if !to.is_empty() && !names.contains(to.as_str()) {
                Some(to)
            } else {
                None
            };
            if let Some(step) = unknown {
                return Err(DefinitionError::UnknownFlowStep {
                    workflow: self.name.clone(),
                    step: step.clone(),
                });
            }
        }

        Ok(Workflow {
            name: self.name,
            steps: self.steps,
            step_flow: self.step_flow,
            first_step,
            validator: self.validator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepline_types::error::StepError;
    use stepline_types::workflow::StepResult;

    use crate::workflow::handler::StepInvocation;

    async fn noop(_inv: StepInvocation) -> Result<StepResult, StepError> {
        Ok(StepResult::new())
    }

    fn three_steps() -> WorkflowBuilder {
        Workflow::builder("abc")
            .step(Step::new("a", noop))
            .step(Step::new("b", noop).optional().max_retries(2))
            .step(Step::new("c", noop).queue("notifications"))
            .flow("a", "b")
            .flow("b", "c")
            .flow("c", "")
    }

    #[test]
    fn test_build_and_navigate() {
        let wf = three_steps().build().unwrap();
        assert_eq!(wf.name(), "abc");
        assert_eq!(wf.first_step(), "a");
        assert_eq!(wf.next_step("a"), Some("b"));
        assert_eq!(wf.next_step("b"), Some("c"));
        assert_eq!(wf.next_step("c"), None);
        assert_eq!(wf.next_step("unknown"), None);

        let b = wf.step("b").unwrap();
        assert!(b.is_optional);
        assert_eq!(b.max_retries, 2);
        assert_eq!(b.queue, "default");
        assert_eq!(wf.step("c").unwrap().queue, "notifications");
        assert!(wf.step("z").is_none());
    }

    #[test]
    fn test_explicit_first_step() {
        let wf = three_steps().first_step("b").build().unwrap();
        assert_eq!(wf.first_step(), "b");
    }

    #[test]
    fn test_build_rejects_empty_workflow() {
        let err = Workflow::builder("empty").build().unwrap_err();
        assert_eq!(err, DefinitionError::NoSteps("empty".to_string()));
    }

    #[test]
    fn test_build_rejects_duplicate_steps() {
        let err = Workflow::builder("dup")
            .step(Step::new("a", noop))
            .step(Step::new("a", noop))
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::DuplicateStep { .. }));
    }

    #[test]
    fn test_build_rejects_unknown_first_step() {
        let err = three_steps().first_step("zzz").build().unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownFirstStep { .. }));
    }

    #[test]
    fn test_build_rejects_unknown_flow_target() {
        let err = three_steps().flow("c", "ghost").build().unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownFlowStep {
                workflow: "abc".to_string(),
                step: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_validator() {
        let wf = three_steps()
            .validator(|input| match input.get("email").and_then(Value::as_str) {
                Some(email) if !email.is_empty() => Ok(()),
                _ => Err("email is required".to_string()),
            })
            .build()
            .unwrap();

        assert!(wf.validate_input(&json!({"email": "u@x.com"})).is_ok());
        assert_eq!(
            wf.validate_input(&json!({})).unwrap_err(),
            "email is required"
        );
    }
}
