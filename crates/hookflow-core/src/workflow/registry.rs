//! Explicit registry mapping workflow names to functions.
//!
//! Built once at startup and handed to the engine; there is no process-wide
//! registration.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::context::WorkflowContext;
use super::error::StepResult;

/// Boxed future returned by a workflow invocation.
pub type WorkflowFuture<'a> = Pin<Box<dyn Future<Output = StepResult<Value>> + Send + 'a>>;

/// A durable workflow.
///
/// `run` is re-invoked from the top on every callback of a run. It must
/// request the same step ids in the same order for the same input and
/// recorded step results.
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    fn run<'a>(&'a self, ctx: &'a mut WorkflowContext, input: Value) -> WorkflowFuture<'a>;
}

/// Signature of a plain function usable as a workflow.
pub type WorkflowFn = for<'a> fn(&'a mut WorkflowContext, Value) -> WorkflowFuture<'a>;

/// Adapts a plain function to `Workflow`.
pub struct FnWorkflow {
    name: String,
    func: WorkflowFn,
}

impl FnWorkflow {
    pub fn new(name: impl Into<String>, func: WorkflowFn) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl Workflow for FnWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, ctx: &'a mut WorkflowContext, input: Value) -> WorkflowFuture<'a> {
        (self.func)(ctx, input)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("workflow '{0}' is already registered")]
    Duplicate(String),

    #[error("workflow name must not be empty")]
    EmptyName,
}

#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: Arc<dyn Workflow>) -> Result<(), RegistryError> {
        let name = workflow.name().to_string();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.workflows.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(workflow = %name, "Registered workflow");
        self.workflows.insert(name, workflow);
        Ok(())
    }

    pub fn register_fn(
        &mut self,
        name: impl Into<String>,
        func: WorkflowFn,
    ) -> Result<(), RegistryError> {
        self.register(Arc::new(FnWorkflow::new(name, func)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: &mut WorkflowContext, input: Value) -> WorkflowFuture<'_> {
        Box::pin(async move { Ok(input) })
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register_fn("order", noop).unwrap();
        registry.register_fn("refund", noop).unwrap();

        assert_eq!(registry.names(), vec!["order", "refund"]);
        assert_eq!(registry.get("order").unwrap().name(), "order");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn duplicate_and_empty_names_are_rejected() {
        let mut registry = WorkflowRegistry::new();
        registry.register_fn("order", noop).unwrap();
        assert!(matches!(
            registry.register_fn("order", noop),
            Err(RegistryError::Duplicate(_))
        ));
        assert!(matches!(
            registry.register_fn("  ", noop),
            Err(RegistryError::EmptyName)
        ));
        assert_eq!(registry.len(), 1);
    }
}
