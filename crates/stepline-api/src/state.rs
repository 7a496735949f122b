//! Application state wiring the engine together.
//!
//! AppState pins the generic executor to the SQLite store and the SQLite job
//! queue. Both live in the same database file, so every `stepline` process
//! pointed at one data directory shares executions and jobs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use stepline_core::workflow::executor::WorkflowExecutor;
use stepline_infra::config::{database_path, load_engine_config, resolve_data_dir};
use stepline_infra::queue::sqlite::SqliteJobQueue;
use stepline_infra::queue::worker::{WorkerPool, WorkerPoolConfig};
use stepline_infra::sqlite::pool::DatabasePool;
use stepline_infra::sqlite::workflow_store::SqliteWorkflowStore;
use stepline_types::config::EngineConfig;

use crate::demo;

pub type ConcreteExecutor = WorkflowExecutor<SqliteWorkflowStore, SqliteJobQueue>;

pub struct AppState {
    pub executor: Arc<ConcreteExecutor>,
    pub queue: SqliteJobQueue,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Resolve the data directory, load config, open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        Self::open(data_dir).await
    }

    pub async fn open(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_path = database_path(&data_dir, &config);
        let pool = DatabasePool::open(&db_path)
            .await
            .with_context(|| format!("Failed to open database {}", db_path.display()))?;

        let registry = Arc::new(demo::registry()?);
        let store = SqliteWorkflowStore::new(pool.clone());
        let queue = SqliteJobQueue::new(pool).with_rescue_after(config.rescue_after());
        let executor = WorkflowExecutor::new(registry, store, queue.clone())
            .with_default_timeout(config.default_step_timeout());

        tracing::debug!(data_dir = %data_dir.display(), workers = config.workers, "engine state ready");

        Ok(Self {
            executor: Arc::new(executor),
            queue,
            config,
            data_dir,
        })
    }

    /// Start the worker pool and re-enqueue running executions that have no job.
    ///
    /// Two processes starting workers at the same moment may both re-enqueue
    /// the same orphaned execution; its next step then runs twice.
    pub async fn start_workers(&self) -> anyhow::Result<WorkerPool> {
        let pool = WorkerPool::start(
            self.executor.clone(),
            self.queue.clone(),
            WorkerPoolConfig::from(&self.config),
        );

        let resumed = self.executor.resume_running().await?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed running workflows without a queued job");
        }
        Ok(pool)
    }
}
