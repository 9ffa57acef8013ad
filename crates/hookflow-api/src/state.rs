//! Application state: data directory, configuration and engine wiring.
//!
//! The engine is generic over store, lock and scheduler. AppState pins it
//! to SQLite (or the ephemeral store) and the reqwest outbound client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hookflow_core::repository::lock::LocalRunLock;
use hookflow_core::repository::memory::MemoryStore;
use hookflow_core::workflow::dispatcher::{Engine, Persistence};
use hookflow_core::workflow::outbound::OutboundClient;
use hookflow_core::workflow::scheduler::CallbackScheduler;
use hookflow_infra::config::{default_data_dir, load_engine_config};
use hookflow_infra::http::ReqwestOutboundClient;
use hookflow_infra::sqlite::lock::SqliteRunLock;
use hookflow_infra::sqlite::pool::DatabasePool;
use hookflow_infra::sqlite::store::SqliteWorkflowStore;
use hookflow_types::config::{EngineConfig, PersistenceMode};

use crate::demo;

pub type DurableEngine<Q> = Engine<SqliteWorkflowStore, SqliteRunLock, Q>;
pub type EphemeralEngine<Q> = Engine<MemoryStore, LocalRunLock, Q>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
}

impl AppState {
    /// Resolve the data directory and load `hookflow.toml` from it.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await?;
        Ok(Self { data_dir, config })
    }

    pub fn database_url(&self) -> String {
        hookflow_infra::config::database_url(&self.config, &self.data_dir)
    }

    pub fn is_ephemeral(&self) -> bool {
        self.config.persistence == PersistenceMode::Disabled
    }

    pub async fn pool(&self) -> anyhow::Result<DatabasePool> {
        let url = self.database_url();
        DatabasePool::new(&url)
            .await
            .with_context(|| format!("failed to open database {url}"))
    }

    pub async fn store(&self) -> anyhow::Result<SqliteWorkflowStore> {
        Ok(SqliteWorkflowStore::new(self.pool().await?))
    }

    fn outbound(&self) -> anyhow::Result<Arc<dyn OutboundClient>> {
        Ok(Arc::new(ReqwestOutboundClient::new()?))
    }

    pub async fn durable_engine<Q: CallbackScheduler>(
        &self,
        scheduler: Arc<Q>,
    ) -> anyhow::Result<DurableEngine<Q>> {
        let pool = self.pool().await?;
        let lock = SqliteRunLock::new(pool.clone(), self.config.lock.lease_ttl());
        let engine = Engine::new(
            self.config.clone(),
            Persistence::Durable(Arc::new(SqliteWorkflowStore::new(pool))),
            demo::registry()?,
            Arc::new(lock),
            scheduler,
            self.outbound()?,
        )?;
        Ok(engine)
    }

    pub fn ephemeral_engine<Q: CallbackScheduler>(
        &self,
        scheduler: Arc<Q>,
    ) -> anyhow::Result<EphemeralEngine<Q>> {
        let config = EngineConfig {
            persistence: PersistenceMode::Disabled,
            ..self.config.clone()
        };
        let engine = Engine::new(
            config,
            Persistence::Disabled,
            demo::registry()?,
            Arc::new(LocalRunLock::new()),
            scheduler,
            self.outbound()?,
        )?;
        Ok(engine)
    }
}
