//! Read-only views of stored runs, step ledgers and dead letters.

use std::sync::Arc;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use hookflow_core::repository::store::WorkflowStore;
use hookflow_types::run::RunStatus;
use hookflow_types::step::StepStatus;
use uuid::Uuid;

use crate::local_queue::LocalQueue;
use crate::state::AppState;

fn require_durable(state: &AppState) -> Result<()> {
    if state.is_ephemeral() {
        bail!("persistence is disabled in hookflow.toml; nothing is stored");
    }
    Ok(())
}

fn format_status(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Pending => Color::Yellow,
        RunStatus::Running => Color::Blue,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed | RunStatus::DeadLettered => Color::Red,
    };
    Cell::new(status.as_str()).fg(color)
}

fn short(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

fn new_table(headers: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(headers);
    table
}

pub async fn list_runs(state: &AppState, status: RunStatus, limit: u32, json: bool) -> Result<()> {
    require_durable(state)?;
    let store = state.store().await?;
    let runs = store.list_runs_by_status(status, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No {status} runs.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Run ID").fg(Color::Cyan),
        Cell::new("Workflow"),
        Cell::new("Status"),
        Cell::new("Created"),
        Cell::new("Updated"),
        Cell::new("Error"),
    ]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(run.run_id),
            Cell::new(&run.workflow_id),
            format_status(run.status),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(run.updated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(run.error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "-".to_string())),
        ]);
    }

    println!();
    println!("  {} runs ({})", style(status).cyan(), runs.len());
    println!();
    println!("{table}");
    if matches!(status, RunStatus::Pending | RunStatus::Running) {
        println!();
        println!(
            "  {}",
            style("Unfinished runs continue with: hookflow resume <run-id>").dim()
        );
    }
    println!();
    Ok(())
}

pub async fn show_steps(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    require_durable(state)?;
    let store = state.store().await?;
    let Some(run) = store.get_run(&run_id).await? else {
        bail!("run {run_id} not found");
    };
    let steps = store.list_steps(&run_id).await?;

    if json {
        let out = serde_json::json!({ "run": run, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("#").fg(Color::Cyan),
        Cell::new("Step"),
        Cell::new("Status"),
        Cell::new("Attempts"),
        Cell::new("Next retry"),
        Cell::new("Last error"),
    ]);
    for step in &steps {
        let status = match step.status {
            StepStatus::Completed => Cell::new("completed").fg(Color::Green),
            StepStatus::Pending => Cell::new("pending").fg(Color::Yellow),
            StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(step.position),
            Cell::new(&step.step_id),
            status,
            Cell::new(step.attempt_count),
            Cell::new(
                step.next_retry_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(
                step.last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }

    println!();
    println!(
        "  Run {} of '{}' is {}",
        style(short(&run.run_id)).cyan(),
        style(&run.workflow_id).bold(),
        run.status
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn list_dead_letters(state: &AppState, run_id: Option<Uuid>, json: bool) -> Result<()> {
    require_durable(state)?;
    let store = state.store().await?;
    let entries = store.list_dead_letters(run_id.as_ref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!("  No dead letters.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Run ID").fg(Color::Cyan),
        Cell::new("Workflow"),
        Cell::new("Step"),
        Cell::new("Failures"),
        Cell::new("Error"),
        Cell::new("Created"),
    ]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(short(&entry.run_id)),
            Cell::new(&entry.workflow_id),
            Cell::new(&entry.step_id),
            Cell::new(entry.failure_count),
            Cell::new(&entry.error.message),
            Cell::new(entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn purge(state: &AppState, json: bool) -> Result<()> {
    require_durable(state)?;
    let Some(days) = state.config.dead_letter.retention_days else {
        bail!("dead_letter.retention_days is not set in hookflow.toml");
    };

    // The engine owns the retention rule; its queue is never used here.
    let (queue, _deliveries) = LocalQueue::new();
    let engine = state.durable_engine(Arc::new(queue)).await?;
    let removed = engine.purge_dead_letters().await?;

    if json {
        println!("{}", serde_json::json!({ "removed": removed, "retention_days": days }));
    } else {
        println!();
        println!("  Removed {removed} dead letter(s) older than {days} day(s).");
        println!();
    }
    Ok(())
}
