//! Hookflow command-line entry point.
//!
//! Binary name: `hookflow`
//!
//! Loads `hookflow.toml` from the data directory, wires the engine to SQLite
//! (or the ephemeral store) and dispatches to the command handlers.

mod cli;
mod demo;
mod local_queue;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = cli::log_filter(cli.verbose, cli.quiet);
    hookflow_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    hookflow_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Run {
            workflow,
            input,
            ephemeral,
        } => {
            let input = cli::parse_input(&input)?;
            cli::run::run_workflow(&state, &workflow, input, ephemeral, cli.json).await
        }
        Commands::Trigger { workflow, input } => {
            let input = cli::parse_input(&input)?;
            cli::run::trigger_remote(&state, &workflow, input, cli.json).await
        }
        Commands::Resume { run_id } => {
            let run_id = cli::parse_run_id(&run_id)?;
            cli::run::resume_run(&state, run_id, cli.json).await
        }
        Commands::Runs { status, limit } => {
            cli::runs::list_runs(&state, status, limit, cli.json).await
        }
        Commands::Steps { run_id } => {
            let run_id = cli::parse_run_id(&run_id)?;
            cli::runs::show_steps(&state, run_id, cli.json).await
        }
        Commands::DeadLetters { run_id } => {
            let run_id = run_id.as_deref().map(cli::parse_run_id).transpose()?;
            cli::runs::list_dead_letters(&state, run_id, cli.json).await
        }
        Commands::Purge => cli::runs::purge(&state, cli.json).await,
    }
}
