//! Workflows registered by the `hookflow` binary.
//!
//! `order` validates, sleeps, charges and fulfills an order, optionally
//! notifying a webhook. `payment` fails its charge a configurable number of
//! times to show backoff and dead-lettering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hookflow_core::workflow::context::WorkflowContext;
use hookflow_core::workflow::error::StepError;
use hookflow_core::workflow::outbound::OutboundRequest;
use hookflow_core::workflow::registry::{
    RegistryError, Workflow, WorkflowFuture, WorkflowRegistry,
};
use serde_json::{Value, json};
use uuid::Uuid;

pub fn registry() -> Result<WorkflowRegistry, RegistryError> {
    let mut registry = WorkflowRegistry::new();
    registry.register_fn("order", order)?;
    registry.register(Arc::new(FlakyPayment::default()))?;
    Ok(registry)
}

fn order(ctx: &mut WorkflowContext, input: Value) -> WorkflowFuture<'_> {
    Box::pin(async move {
        let order_id = input["order_id"].as_str().unwrap_or("unknown").to_string();
        let delay = Duration::from_secs(input["delay_secs"].as_u64().unwrap_or(2));

        let items = input["items"].as_u64().unwrap_or(1);
        let valid: bool = ctx
            .run("validate", move || async move {
                if items == 0 {
                    return Err(StepError::permanent("order has no items"));
                }
                Ok(true)
            })
            .await?;

        ctx.sleep("wait-for-stock", delay)?;

        let charge_id = ctx.idempotency_key("charge");
        let charge_id: String = ctx
            .run("charge", move || async move { Ok(format!("ch_{charge_id}")) })
            .await?;

        let notified = match input["notify_url"].as_str() {
            Some(url) => {
                let request = OutboundRequest::post(
                    url,
                    json!({"order_id": order_id, "charge_id": charge_id}),
                );
                let response = ctx.call("notify", request).await?;
                Some(response.status)
            }
            None => None,
        };

        let shipped: bool = ctx.run("fulfill", || async { Ok(true) }).await?;

        Ok(json!({
            "order_id": order_id,
            "valid": valid,
            "charge_id": charge_id,
            "notify_status": notified,
            "shipped": shipped,
        }))
    })
}

/// Charge that fails `fail_times` times per run before succeeding.
#[derive(Default)]
struct FlakyPayment {
    failures: Mutex<HashMap<Uuid, u64>>,
}

impl FlakyPayment {
    fn attempt(&self, run_id: Uuid, fail_times: u64) -> Result<String, StepError> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| StepError::transient("failure counter poisoned"))?;
        let seen = failures.entry(run_id).or_insert(0);
        if *seen < fail_times {
            *seen += 1;
            return Err(StepError::transient(format!(
                "payment gateway unavailable ({} of {fail_times})",
                *seen
            )));
        }
        Ok(format!("ch_{}", run_id.simple()))
    }
}

impl Workflow for FlakyPayment {
    fn name(&self) -> &str {
        "payment"
    }

    fn run<'a>(&'a self, ctx: &'a mut WorkflowContext, input: Value) -> WorkflowFuture<'a> {
        Box::pin(async move {
            let run_id = ctx.run_id();
            let fail_times = input["fail_times"].as_u64().unwrap_or(1);
            let charge_id: String = ctx
                .run("charge", move || async move { self.attempt(run_id, fail_times) })
                .await?;
            Ok(json!({"charge_id": charge_id}))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_contains_demo_workflows() {
        let registry = registry().unwrap();
        assert_eq!(registry.names(), vec!["order", "payment"]);
    }

    #[test]
    fn flaky_payment_fails_then_succeeds() {
        let payment = FlakyPayment::default();
        let run_id = Uuid::now_v7();
        assert!(payment.attempt(run_id, 2).is_err());
        assert!(payment.attempt(run_id, 2).is_err());
        assert!(payment.attempt(run_id, 2).is_ok());
        // Counters are per run.
        assert!(payment.attempt(Uuid::now_v7(), 1).is_err());
    }
}
