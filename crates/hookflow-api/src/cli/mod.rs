//! CLI command definitions for the `hookflow` binary.

pub mod run;
pub mod runs;

use clap::{Parser, Subcommand};
use hookflow_types::run::RunStatus;

/// Run durable workflows.
#[derive(Parser)]
#[command(name = "hookflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through the OpenTelemetry stdout exporter.
    #[arg(long, global = true, env = "HOOKFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow to completion through the in-process delay queue.
    Run {
        /// Registered workflow name.
        workflow: String,

        /// JSON input for the run.
        #[arg(long, default_value = "{}")]
        input: String,

        /// Keep run state in memory only (persistence = "disabled").
        #[arg(long)]
        ephemeral: bool,
    },

    /// Start a run and publish its first callback to the configured queue.
    Trigger {
        /// Registered workflow name.
        workflow: String,

        /// JSON input for the run.
        #[arg(long, default_value = "{}")]
        input: String,
    },

    /// Continue an unfinished run in-process from its recorded steps.
    Resume {
        /// Run UUID.
        run_id: String,
    },

    /// List runs by status.
    #[command(alias = "ls")]
    Runs {
        /// pending, running, completed, failed or dead_lettered.
        #[arg(long, default_value = "pending")]
        status: RunStatus,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the step ledger of a run.
    Steps {
        /// Run UUID.
        run_id: String,
    },

    /// List dead-lettered steps.
    DeadLetters {
        /// Only entries of this run.
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Delete dead letters older than `dead_letter.retention_days`.
    Purge,
}

/// Map `-v` flags to a tracing filter.
pub fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,hookflow_core=debug,hookflow_infra=debug",
        _ => "trace",
    }
}

/// Parse `--input` as JSON.
pub fn parse_input(input: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(input).map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}"))
}

/// Parse a run id argument.
pub fn parse_run_id(run_id: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(run_id).map_err(|_| anyhow::anyhow!("'{run_id}' is not a run UUID"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_maps_to_filters() {
        assert_eq!(log_filter(0, true), "error");
        assert_eq!(log_filter(0, false), "warn");
        assert!(log_filter(1, false).contains("hookflow_core=debug"));
        assert_eq!(log_filter(3, false), "trace");
    }

    #[test]
    fn parses_run_command() {
        let cli = Cli::try_parse_from([
            "hookflow",
            "run",
            "order",
            "--input",
            r#"{"order_id":"1"}"#,
            "--ephemeral",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Run {
                workflow,
                input,
                ephemeral,
            } => {
                assert_eq!(workflow, "order");
                assert!(ephemeral);
                assert_eq!(parse_input(&input).unwrap()["order_id"], "1");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parses_status_filter() {
        let cli = Cli::try_parse_from(["hookflow", "runs", "--status", "dead_lettered"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Runs {
                status: RunStatus::DeadLettered,
                limit: 20
            }
        ));
        assert!(Cli::try_parse_from(["hookflow", "runs", "--status", "bogus"]).is_err());
    }

    #[test]
    fn rejects_bad_input_and_run_ids() {
        assert!(parse_input("{not json").is_err());
        assert!(parse_run_id("nope").is_err());
    }
}
