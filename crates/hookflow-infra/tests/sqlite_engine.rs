//! Engine runs persisted in SQLite: the ledger survives a fresh engine, and
//! the lease lock turns a concurrent invocation into a no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use hookflow_core::clock::{Clock, ManualClock};
use hookflow_core::repository::lock::RunLock;
use hookflow_core::repository::store::WorkflowStore;
use hookflow_core::workflow::context::WorkflowContext;
use hookflow_core::workflow::dispatcher::{Dispatch, Engine, Persistence};
use hookflow_core::workflow::error::StepError;
use hookflow_core::workflow::outbound::{
    OutboundClient, OutboundError, OutboundRequest, OutboundResponse,
};
use hookflow_core::workflow::registry::{Workflow, WorkflowFuture, WorkflowRegistry};
use hookflow_core::workflow::scheduler::{CallbackScheduler, MessageId, SchedulerError};
use hookflow_infra::sqlite::lock::SqliteRunLock;
use hookflow_infra::sqlite::pool::DatabasePool;
use hookflow_infra::sqlite::store::SqliteWorkflowStore;
use hookflow_types::callback::CallbackPayload;
use hookflow_types::config::EngineConfig;
use hookflow_types::run::RunStatus;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct NoNetwork;

impl OutboundClient for NoNetwork {
    fn send<'a>(
        &'a self,
        _request: OutboundRequest,
    ) -> Pin<Box<dyn Future<Output = Result<OutboundResponse, OutboundError>> + Send + 'a>> {
        Box::pin(async { Err(OutboundError::Transport("offline".to_string())) })
    }
}

#[derive(Default)]
struct Outbox {
    published: Mutex<Vec<(CallbackPayload, Option<DateTime<Utc>>)>>,
}

impl Outbox {
    fn last(&self) -> (CallbackPayload, Option<DateTime<Utc>>) {
        self.published.lock().unwrap().last().cloned().unwrap()
    }
}

impl CallbackScheduler for Outbox {
    async fn schedule_callback(
        &self,
        payload: &CallbackPayload,
        not_before: Option<DateTime<Utc>>,
        _dedup_key: &str,
    ) -> Result<MessageId, SchedulerError> {
        let mut published = self.published.lock().unwrap();
        published.push((payload.clone(), not_before));
        Ok(format!("msg-{}", published.len()))
    }
}

type SqliteEngine = Engine<SqliteWorkflowStore, SqliteRunLock, Outbox>;

async fn test_pool() -> DatabasePool {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = DatabasePool::new(&url).await.unwrap();
    std::mem::forget(dir);
    pool
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

fn engine(
    pool: &DatabasePool,
    workflow: Arc<dyn Workflow>,
    outbox: Arc<Outbox>,
    clock: Arc<ManualClock>,
) -> SqliteEngine {
    let config = EngineConfig::default();
    let mut registry = WorkflowRegistry::new();
    registry.register(workflow).unwrap();
    let lock = SqliteRunLock::new(pool.clone(), config.lock.lease_ttl());

    Engine::new(
        config,
        Persistence::Durable(Arc::new(SqliteWorkflowStore::new(pool.clone()))),
        registry,
        Arc::new(lock),
        outbox,
        Arc::new(NoNetwork),
    )
    .unwrap()
    .with_clock(clock as Arc<dyn Clock>)
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OrderWorkflow {
    validate: AtomicUsize,
    charge: AtomicUsize,
    fulfill: AtomicUsize,
}

impl Workflow for OrderWorkflow {
    fn name(&self) -> &str {
        "order"
    }

    fn run<'a>(&'a self, ctx: &'a mut WorkflowContext, input: Value) -> WorkflowFuture<'a> {
        let this = self;
        Box::pin(async move {
            ctx.run("validate", move || async move {
                this.validate.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            })
            .await?;
            ctx.sleep("sleep", Duration::from_secs(60))?;
            let charge_id: String = ctx
                .run("charge", move || async move {
                    this.charge.fetch_add(1, Ordering::SeqCst);
                    Ok("ch_1".to_string())
                })
                .await?;
            ctx.run("fulfill", move || async move {
                this.fulfill.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            })
            .await?;
            Ok(json!({"order_id": input["order_id"], "charge_id": charge_id}))
        })
    }
}

struct AlwaysFails {
    calls: AtomicUsize,
}

impl Workflow for AlwaysFails {
    fn name(&self) -> &str {
        "payment"
    }

    fn run<'a>(&'a self, ctx: &'a mut WorkflowContext, _input: Value) -> WorkflowFuture<'a> {
        let calls = &self.calls;
        Box::pin(async move {
            let _: String = ctx
                .run("charge", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::transient("gateway unavailable"))
                })
                .await?;
            Ok(Value::Null)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn order_survives_engine_restarts() {
    let pool = test_pool().await;
    let workflow = Arc::new(OrderWorkflow::default());
    let outbox = Arc::new(Outbox::default());
    let clock = Arc::new(ManualClock::new(start()));

    let run_id = engine(&pool, workflow.clone(), outbox.clone(), clock.clone())
        .trigger("order", json!({"order_id": "12345"}))
        .await
        .unwrap();

    // A fresh engine per delivery, as if every callback hit a new process.
    let mut invocations = 0;
    let result = loop {
        let (payload, not_before) = outbox.last();
        if let Some(at) = not_before {
            clock.set(at);
        }
        invocations += 1;
        let e = engine(&pool, workflow.clone(), outbox.clone(), clock.clone());
        match e.handle_callback(payload).await.unwrap() {
            Dispatch::Completed { result } => break result,
            Dispatch::Suspended { .. } => {}
            other => panic!("unexpected dispatch: {other:?}"),
        }
    };

    assert_eq!(invocations, 5);
    assert_eq!(result, json!({"order_id": "12345", "charge_id": "ch_1"}));
    assert_eq!(workflow.validate.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.charge.load(Ordering::SeqCst), 1);
    assert_eq!(workflow.fulfill.load(Ordering::SeqCst), 1);

    let store = SqliteWorkflowStore::new(pool.clone());
    let run = store.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(store.list_steps(&run_id).await.unwrap().len(), 4);
    let completed = store
        .list_runs_by_status(RunStatus::Completed, 10)
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_in_sqlite() {
    let pool = test_pool().await;
    let workflow = Arc::new(AlwaysFails {
        calls: AtomicUsize::new(0),
    });
    let outbox = Arc::new(Outbox::default());
    let clock = Arc::new(ManualClock::new(start()));
    let e = engine(&pool, workflow.clone(), outbox.clone(), clock.clone());

    let run_id = e.trigger("payment", json!({"amount": 10})).await.unwrap();
    let dispatch = loop {
        let (payload, not_before) = outbox.last();
        if let Some(at) = not_before {
            clock.set(at);
        }
        match e.handle_callback(payload).await.unwrap() {
            Dispatch::Suspended { .. } => {}
            other => break other,
        }
    };

    assert!(matches!(dispatch, Dispatch::Failed { dead_lettered: true, .. }));
    assert_eq!(workflow.calls.load(Ordering::SeqCst), 3);

    let store = e.store().unwrap();
    assert_eq!(
        store.get_run(&run_id).await.unwrap().unwrap().status,
        RunStatus::DeadLettered
    );
    let entries = store.list_dead_letters(Some(&run_id)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].failure_count, 3);
    assert_eq!(entries[0].payload, json!({"amount": 10}));
}

#[tokio::test]
async fn held_lease_makes_callback_a_no_op() {
    let pool = test_pool().await;
    let workflow = Arc::new(OrderWorkflow::default());
    let outbox = Arc::new(Outbox::default());
    let clock = Arc::new(ManualClock::new(start()));
    let e = engine(&pool, workflow.clone(), outbox.clone(), clock);

    let run_id = e.trigger("order", json!({"order_id": "1"})).await.unwrap();

    // Another process holds the lease for this run.
    let other = SqliteRunLock::new(pool.clone(), Duration::from_secs(300));
    assert!(other.try_acquire(&run_id, "other-process").await.unwrap());

    let (payload, _) = outbox.last();
    let dispatch = e.handle_callback(payload.clone()).await.unwrap();
    assert_eq!(dispatch, Dispatch::InProgress);
    assert_eq!(workflow.validate.load(Ordering::SeqCst), 0);

    other.release(&run_id, "other-process").await.unwrap();
    let dispatch = e.handle_callback(payload).await.unwrap();
    assert!(matches!(dispatch, Dispatch::Suspended { ref step_id, .. } if step_id == "validate"));
    assert_eq!(workflow.validate.load(Ordering::SeqCst), 1);

    // The engine released its own lease after the invocation.
    assert!(other.try_acquire(&run_id, "other-process").await.unwrap());
}
