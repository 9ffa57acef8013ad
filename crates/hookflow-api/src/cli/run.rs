//! `run`, `resume` and `trigger`: drive workflow runs.
//!
//! `run` and `resume` deliver callbacks through the in-process `LocalQueue`
//! until the run finishes or Ctrl+C is pressed. `trigger` only publishes the
//! first callback to the configured HTTP queue.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use hookflow_core::repository::lock::RunLock;
use hookflow_core::repository::store::WorkflowStore;
use hookflow_core::workflow::dispatcher::{Dispatch, Engine};
use hookflow_infra::queue::publisher::HttpQueuePublisher;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::local_queue::{Delivery, LocalQueue};
use crate::state::AppState;

/// Start a run of `workflow` and deliver its callbacks until it finishes.
pub async fn run_workflow(
    state: &AppState,
    workflow: &str,
    input: Value,
    ephemeral: bool,
    json: bool,
) -> Result<()> {
    let (queue, mut deliveries) = LocalQueue::new();
    let queue = Arc::new(queue);

    if ephemeral || state.is_ephemeral() {
        let engine = state.ephemeral_engine(queue)?;
        let run_id = engine.trigger(workflow, input).await?;
        announce(run_id, workflow, "started (ephemeral)", json);
        drive(&engine, run_id, &mut deliveries, json).await
    } else {
        let engine = state.durable_engine(queue).await?;
        engine.purge_dead_letters().await?;
        let run_id = engine.trigger(workflow, input).await?;
        announce(run_id, workflow, "started", json);
        drive(&engine, run_id, &mut deliveries, json).await
    }
}

/// Continue an unfinished durable run from its step ledger.
pub async fn resume_run(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    if state.is_ephemeral() {
        bail!("persistence is disabled; there are no stored runs to resume");
    }
    let (queue, mut deliveries) = LocalQueue::new();
    let engine = state.durable_engine(Arc::new(queue)).await?;

    match engine.resume(run_id).await? {
        Some(_) => {
            announce(run_id, "", "resumed", json);
            drive(&engine, run_id, &mut deliveries, json).await
        }
        None => {
            if !json {
                println!();
                println!("  Run {} has already finished.", style(run_id).cyan());
                println!();
            }
            Ok(())
        }
    }
}

/// Create a run and hand its first callback to the HTTP queue.
pub async fn trigger_remote(
    state: &AppState,
    workflow: &str,
    input: Value,
    json: bool,
) -> Result<()> {
    let queue_config = state
        .config
        .queue
        .clone()
        .context("no [queue] section in hookflow.toml")?;
    let publisher = Arc::new(HttpQueuePublisher::new(queue_config)?);
    let engine = state.durable_engine(publisher).await?;

    let run_id = engine.trigger(workflow, input).await?;
    announce(run_id, workflow, "published", json);
    Ok(())
}

// ---------------------------------------------------------------------------
// Delivery loop
// ---------------------------------------------------------------------------

async fn next_due(deliveries: &mut UnboundedReceiver<Delivery>) -> Option<Delivery> {
    let delivery = deliveries.recv().await?;
    delivery.wait_until_due().await;
    Some(delivery)
}

async fn drive<S, L>(
    engine: &Engine<S, L, LocalQueue>,
    run_id: Uuid,
    deliveries: &mut UnboundedReceiver<Delivery>,
    json: bool,
) -> Result<()>
where
    S: WorkflowStore,
    L: RunLock,
{
    let mut invocations = 0u32;
    let finished = loop {
        let delivery = tokio::select! {
            delivery = next_due(deliveries) => {
                delivery.context("local queue closed before the run finished")?
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break None;
            }
        };

        invocations += 1;
        tracing::debug!(run_id = %run_id, message_id = %delivery.message_id, "Delivering callback");
        let dispatch = engine.handle_callback(delivery.payload).await?;
        if !json {
            report_invocation(invocations, &dispatch);
        }
        match dispatch {
            Dispatch::Suspended { .. } | Dispatch::InProgress => {}
            other => break Some(other),
        }
    };

    let Some(dispatch) = finished else {
        let drained = engine.shutdown().await;
        tracing::warn!(run_id = %run_id, drained, "Interrupted before the run finished");
        if !json {
            println!();
            println!(
                "  {} Interrupted. Continue with: hookflow resume {run_id}",
                style("!").yellow().bold()
            );
            println!();
        }
        return Ok(());
    };

    if json {
        let out = serde_json::json!({
            "run_id": run_id.to_string(),
            "invocations": invocations,
            "dispatch": dispatch,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    }

    match dispatch {
        Dispatch::Completed { result } => {
            if !json {
                println!();
                println!(
                    "  {} Run {} completed after {invocations} invocation(s)",
                    style("✓").green().bold(),
                    style(run_id).cyan()
                );
                println!("{}", serde_json::to_string_pretty(&result)?);
                println!();
            }
            Ok(())
        }
        Dispatch::Failed {
            error,
            dead_lettered,
        } => {
            let note = if dead_lettered { " (dead-lettered)" } else { "" };
            bail!("run {run_id} failed{note}: {error}")
        }
        Dispatch::Rejected { reason } => bail!("run {run_id} rejected: {reason}"),
        Dispatch::Suspended { .. } | Dispatch::InProgress => Ok(()),
    }
}

fn announce(run_id: Uuid, workflow: &str, what: &str, json: bool) {
    if json {
        return;
    }
    println!();
    if workflow.is_empty() {
        println!("  {} Run {} {what}", style("▶").bold(), style(run_id).cyan());
    } else {
        println!(
            "  {} Run {} of '{}' {what}",
            style("▶").bold(),
            style(run_id).cyan(),
            style(workflow).bold()
        );
    }
}

fn report_invocation(n: u32, dispatch: &Dispatch) {
    match dispatch {
        Dispatch::Suspended {
            step_id,
            not_before: Some(at),
            ..
        } => println!(
            "  {n:>3}. {} {step_id}, next callback at {}",
            style("suspended").yellow(),
            at.format("%H:%M:%S")
        ),
        Dispatch::Suspended { step_id, .. } => {
            println!("  {n:>3}. {} {step_id}", style("suspended").yellow())
        }
        Dispatch::InProgress => println!("  {n:>3}. {}", style("in progress").dim()),
        Dispatch::Completed { .. } => println!("  {n:>3}. {}", style("completed").green()),
        Dispatch::Failed { .. } => println!("  {n:>3}. {}", style("failed").red()),
        Dispatch::Rejected { reason } => {
            println!("  {n:>3}. {} {reason}", style("rejected").red())
        }
    }
}
