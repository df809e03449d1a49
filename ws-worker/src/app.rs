//! Wiring: builds every component once from [`Config`] and shares them by `Arc`.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;
use ws_network::SlotAllocator;
use ws_orchestrator::db::{create_pool, run_migrations};
use ws_orchestrator::WorkspaceService;
use ws_proxy::{build_route_manager, RouteManager};
use ws_queue::{JobQueue, MemoryQueue, SqliteQueue};
use ws_runtime::{get_runtime, Runtime};

use crate::config::{Config, QueueBackend};
use crate::poll_loop::PollLoop;
use crate::processor::Processor;

pub struct App {
    pub service: Arc<WorkspaceService>,
    pub queue: Arc<dyn JobQueue>,
    pub routes: Arc<dyn RouteManager>,
}

async fn open_database(path: &std::path::Path) -> Result<SqlitePool> {
    let pool = create_pool(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    Ok(pool)
}

async fn build_queue(config: &Config, pool: &SqlitePool) -> Result<Arc<dyn JobQueue>> {
    match config.queue.backend {
        QueueBackend::Memory => {
            info!("Using in-memory job queue; pending jobs are lost on exit");
            Ok(Arc::new(MemoryQueue::new()))
        }
        QueueBackend::Sqlite => {
            let queue_pool = if config.queue_db_path() == config.db_path.as_path() {
                pool.clone()
            } else {
                create_pool(config.queue_db_path()).await?
            };
            Ok(Arc::new(SqliteQueue::new(queue_pool, config.queue.sqlite).await?))
        }
    }
}

impl App {
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = open_database(&config.db_path).await?;
        let queue = build_queue(config, &pool).await?;
        let routes = build_route_manager(&config.proxy)?;

        let slots = Arc::new(SlotAllocator::open(&config.slots_path)?);
        let runtime: Arc<dyn Runtime> = Arc::from(get_runtime(&config.runtime, slots)?);
        info!(backend = runtime.name(), "runtime backend ready");

        let mut orchestrator = config.orchestrator.clone();
        orchestrator.guest_port = config.runtime.guest_port;

        let service = Arc::new(WorkspaceService::new(
            pool,
            runtime,
            routes.clone(),
            queue.clone(),
            orchestrator,
        )?);

        Ok(Self {
            service,
            queue,
            routes,
        })
    }

    pub fn poll_loop(&self, config: &Config) -> PollLoop {
        PollLoop::new(
            self.queue.clone(),
            Arc::new(Processor::new(self.service.clone())),
            config.worker,
        )
    }
}
