//! Stepline CLI entry point.
//!
//! Binary name: `stepline`
//!
//! Parses CLI arguments, opens the engine state in the data directory, then
//! dispatches to the command handler.

mod cli;
mod demo;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;
use stepline_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,sqlx=warn",
        _ => "debug,sqlx=info",
    };
    let tracing_config = TracingConfig {
        json: cli.json,
        enable_otel: cli.otel,
        ..TracingConfig::new(filter)
    };
    init_tracing(&tracing_config).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Start { workflow, input } => {
            cli::workflow::handle_start(&state, &workflow, &input, cli.json).await
        }
        Commands::Status { workflow_id } => {
            cli::workflow::handle_status(&state, &workflow_id, cli.json).await
        }
        Commands::Run { workflow, input } => {
            cli::workflow::handle_run(&state, &workflow, &input, cli.json).await
        }
        Commands::Worker => cli::workflow::handle_worker(&state).await,
        Commands::Workflows => cli::workflow::handle_workflows(&state, cli.json),
    }
}
