//! Workflow command handlers: start, status, run, worker, workflows.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use stepline_types::workflow::{ExecutionStatus, WorkflowStatus};

use crate::state::AppState;

/// How often `run` re-reads the execution record.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn handle_start(state: &AppState, workflow: &str, input: &str, json: bool) -> Result<()> {
    let input = parse_input(input)?;
    let result = state
        .executor
        .start_workflow(workflow, input)
        .await
        .with_context(|| format!("Failed to start workflow '{workflow}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!();
    if result.is_new_workflow {
        println!(
            "  {} Started workflow '{}'",
            style("*").green().bold(),
            style(workflow).cyan()
        );
    } else {
        println!(
            "  {} Workflow '{}' is already running for this input",
            style("*").yellow().bold(),
            style(workflow).cyan()
        );
    }
    println!("  ID: {}", result.workflow_id);
    println!();
    println!(
        "  Process it with: {}",
        style("stepline worker").dim()
    );
    println!(
        "  Check progress: {}",
        style(format!("stepline status {}", result.workflow_id)).dim()
    );
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(state: &AppState, workflow_id: &str, json: bool) -> Result<()> {
    let id: Uuid = workflow_id
        .parse()
        .with_context(|| format!("Invalid workflow ID: '{workflow_id}'"))?;

    let status = state.executor.get_workflow_status(&id).await?;
    print_status(&status, json)
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(state: &AppState, workflow: &str, input: &str, json: bool) -> Result<()> {
    let input = parse_input(input)?;
    let pool = state.start_workers().await?;

    let outcome = async {
        let started = state
            .executor
            .start_workflow(workflow, input)
            .await
            .with_context(|| format!("Failed to start workflow '{workflow}'"))?;
        if !started.is_new_workflow {
            tracing::info!(workflow_id = %started.workflow_id, "attached to running workflow");
        }
        wait_for_terminal(state, started.workflow_id).await
    }
    .await;

    pool.shutdown(state.config.shutdown_grace()).await;

    let status = outcome?;
    print_status(&status, json)?;
    if status.status == ExecutionStatus::Failed {
        bail!("Workflow {} failed", status.workflow_id);
    }
    Ok(())
}

async fn wait_for_terminal(state: &AppState, workflow_id: Uuid) -> Result<WorkflowStatus> {
    loop {
        let status = state.executor.get_workflow_status(&workflow_id).await?;
        if status.is_terminal() {
            return Ok(status);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                bail!("Interrupted while waiting for workflow {workflow_id}; it stays queued for the next worker");
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub async fn handle_worker(state: &AppState) -> Result<()> {
    let pool = state.start_workers().await?;
    let backlog = state.queue.counts().await?;

    println!();
    println!(
        "  {} Worker running with {} worker(s), data in {}",
        style("*").green().bold(),
        state.config.workers,
        style(state.data_dir.display()).cyan()
    );
    if backlog.pending() > 0 {
        println!("  {} job(s) queued", backlog.pending());
    }
    if backlog.discarded > 0 {
        println!(
            "  {}",
            style(format!("{} job(s) discarded after running out of deliveries", backlog.discarded)).yellow()
        );
    }
    println!("  Press Ctrl-C to stop.");
    println!();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("shutting down worker pool");
    pool.shutdown(state.config.shutdown_grace()).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

pub fn handle_workflows(state: &AppState, json: bool) -> Result<()> {
    let registry = state.executor.registry();
    let workflows: Vec<_> = registry
        .names()
        .into_iter()
        .filter_map(|name| registry.get(name))
        .collect();

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|wf| {
                let steps: Vec<_> = wf
                    .steps()
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "name": s.name,
                            "optional": s.is_optional,
                            "max_retries": s.max_retries,
                            "retry_delay_secs": s.retry_delay.as_secs_f64(),
                            "queue": s.queue,
                            "timeout_secs": s.timeout.map(|t| t.as_secs()),
                            "next_step": wf.next_step(&s.name),
                        })
                    })
                    .collect();
                serde_json::json!({
                    "name": wf.name(),
                    "first_step": wf.first_step(),
                    "steps": steps,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for wf in workflows {
        println!();
        println!(
            "  {} {}",
            style("Workflow:").bold(),
            style(wf.name()).cyan()
        );

        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Optional"),
                Cell::new("Retries"),
                Cell::new("Queue"),
                Cell::new("Next"),
            ]);

        for step in wf.steps() {
            table.add_row(vec![
                Cell::new(&step.name),
                Cell::new(if step.is_optional { "yes" } else { "no" }),
                Cell::new(step.max_retries),
                Cell::new(&step.queue),
                Cell::new(wf.next_step(&step.name).unwrap_or("-")),
            ]);
        }
        println!("{table}");
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_input(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("Invalid JSON input")?;
    if !value.is_object() {
        bail!("Workflow input must be a JSON object");
    }
    Ok(value)
}

fn print_status(status: &WorkflowStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new("Field").fg(Color::Cyan), Cell::new("Value")]);

    table.add_row(vec![Cell::new("ID"), Cell::new(status.workflow_id)]);
    table.add_row(vec![Cell::new("Workflow"), Cell::new(&status.workflow_name)]);
    table.add_row(vec![Cell::new("Status"), format_status(status.status)]);
    table.add_row(vec![Cell::new("Current step"), Cell::new(&status.current_step)]);
    table.add_row(vec![
        Cell::new("Started"),
        Cell::new(status.started_at.format("%Y-%m-%d %H:%M:%S")),
    ]);
    if let Some(completed) = status.completed_at {
        table.add_row(vec![
            Cell::new("Completed"),
            Cell::new(completed.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    if let Some(org_id) = &status.org_id {
        table.add_row(vec![Cell::new("Organization"), Cell::new(org_id)]);
    }
    if let Some(user_id) = &status.user_id {
        table.add_row(vec![Cell::new("User"), Cell::new(user_id)]);
    }
    if let Some(err) = &status.error_message {
        table.add_row(vec![Cell::new("Error"), Cell::new(err).fg(Color::Red)]);
    }

    println!();
    println!("{table}");
    if !status.context.is_empty() {
        println!();
        println!("  {}", style("Context:").bold());
        println!("{}", serde_json::to_string_pretty(status.context.as_map())?);
    }
    println!();

    Ok(())
}

fn format_status(status: ExecutionStatus) -> Cell {
    match status {
        ExecutionStatus::Running => Cell::new("running").fg(Color::Blue),
        ExecutionStatus::Completed => Cell::new("completed").fg(Color::Green),
        ExecutionStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}
