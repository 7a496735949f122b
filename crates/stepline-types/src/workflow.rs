//! Workflow execution types for Stepline.
//!
//! Defines the message carried by each queued step job ([`WorkflowArgs`]),
//! the persisted execution record ([`WorkflowStatus`]), the value a step
//! returns ([`StepResult`]), and the result of starting a workflow.
//!
//! None of these types reference executable code; step handlers live in the
//! registry owned by the executor and are looked up by name.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::WorkflowContext;

// ---------------------------------------------------------------------------
// Step result
// ---------------------------------------------------------------------------

/// Output of a successful step execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Keys merged into the workflow context (overwrite semantics).
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Overrides the workflow's step flow when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

impl StepResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key to the data merged into the context.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Jump to `step` instead of following the step flow.
    pub fn goto(mut self, step: impl Into<String>) -> Self {
        self.next_step = Some(step.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Queued message
// ---------------------------------------------------------------------------

/// The message carried by every queued step invocation.
///
/// This is the only data that crosses the job queue boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowArgs {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    /// Step to run. Empty means "the workflow's first step".
    #[serde(default)]
    pub current_step: String,
    pub input: Value,
    #[serde(default)]
    pub context: WorkflowContext,
    /// Per-step attempt count. Reset to zero whenever a new step is scheduled.
    #[serde(default)]
    pub attempt_count: u32,
    pub input_hash: String,
}

impl WorkflowArgs {
    /// Job kind shared by every step of every workflow.
    pub const KIND: &'static str = "workflow_execution";

    /// Initial message for a freshly started workflow.
    pub fn first(
        workflow_id: Uuid,
        workflow_name: impl Into<String>,
        input: Value,
        input_hash: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            workflow_name: workflow_name.into(),
            current_step: String::new(),
            input,
            context: WorkflowContext::new(),
            attempt_count: 0,
            input_hash: input_hash.into(),
        }
    }

    /// Message for the step after this one, carrying the merged context.
    pub fn next_step(&self, step: impl Into<String>, context: WorkflowContext) -> Self {
        Self {
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name.clone(),
            current_step: step.into(),
            input: self.input.clone(),
            context,
            attempt_count: 0,
            input_hash: self.input_hash.clone(),
        }
    }

    pub fn kind(&self) -> &'static str {
        Self::KIND
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle state of a persisted workflow execution.
///
/// Only moves forward: `Running -> Completed` or `Running -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// Persisted record of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Primary key, immutable once assigned.
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub current_step: String,
    pub input: Value,
    pub context: WorkflowContext,
    /// Set once at or before the first step and never overwritten.
    pub started_at: DateTime<Utc>,
    /// Set once on the transition into a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Deduplication hash of (workflow name, input).
    pub input_hash: String,
    /// Organization id taken from the input, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// User id taken from the input, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl WorkflowStatus {
    /// Build a running record for the given message.
    ///
    /// Organization and user ids are read opportunistically from string
    /// fields of the input object.
    pub fn running(
        args: &WorkflowArgs,
        current_step: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: args.workflow_id,
            workflow_name: args.workflow_name.clone(),
            status: ExecutionStatus::Running,
            current_step: current_step.into(),
            input: args.input.clone(),
            context: args.context.clone(),
            started_at,
            completed_at: None,
            error_message: None,
            input_hash: args.input_hash.clone(),
            org_id: input_string(&args.input, &["org_id", "organization_id"]),
            user_id: input_string(&args.input, &["user_id"]),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

fn input_string(input: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| input.get(key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Outcome of a start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowResult {
    pub workflow_id: Uuid,
    /// `false` when a running execution with the same input was found.
    pub is_new_workflow: bool,
    /// Current record of the existing execution when `is_new_workflow` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_status: Option<WorkflowStatus>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
