//! CLI command definitions for the `stepline` binary.

pub mod workflow;

use clap::{Parser, Subcommand};

/// Run durable step-based workflows.
#[derive(Parser)]
#[command(name = "stepline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow, or attach to the one already running for the same input.
    Start {
        /// Registered workflow name.
        workflow: String,

        /// Workflow input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Show the persisted record of a workflow execution.
    Status {
        /// Workflow execution UUID.
        workflow_id: String,
    },

    /// Start a workflow and process queued steps in this process until it finishes.
    Run {
        /// Registered workflow name.
        workflow: String,

        /// Workflow input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Process queued workflow steps until Ctrl-C.
    ///
    /// Any number of workers, and `run`, may share one data directory; each
    /// job is claimed by one of them. At start-up, running executions that
    /// have no queued job are re-enqueued. Two processes starting at the
    /// same moment may both re-enqueue such an execution, so its next step
    /// can run twice.
    Worker,

    /// List registered workflows and their steps.
    #[command(alias = "ls")]
    Workflows,
}
