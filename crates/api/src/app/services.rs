//! Engine wiring: stores, services, and the background loops.
//!
//! Without `DATABASE_URL` everything runs on the in-memory stores; without
//! `REDIS_URL` coordination stays in-process.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use beacon_infra::config::EngineConfig;
use beacon_infra::coordination::{CoordinationStore, InMemoryCoordinationStore};
use beacon_infra::db;
use beacon_infra::intake::IntakeService;
use beacon_infra::jobs::{InMemoryJobStore, JobStore, PostgresJobStore};
use beacon_infra::orchestrator::{
    ExecutionStore, InMemoryExecutionStore, InferenceRouter, Orchestrator, OrchestratorWorker,
    PostgresExecutionStore, UnitRunner, WorkerHandle,
};
use beacon_infra::outbox::{
    ChannelDispatcher, OutboxPublisher, OutboxStore, PostgresOutboxStore, PublisherHandle,
};
use beacon_infra::repair::{RepairHandle, RepairSweep};
use beacon_infra::retry::RetryService;
use beacon_infra::transparency::{
    InMemoryTransparencyStore, PostgresTransparencyStore, TransparencyLog, TransparencyStore,
};

/// Everything the HTTP handlers need.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: Arc<dyn JobStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub outbox: Arc<dyn OutboxStore>,
    pub intake: IntakeService,
    pub retries: Arc<RetryService>,
    pub transparency: Arc<TransparencyLog>,
    pub repair: RepairSweep,
}

/// Handles to the background loops started alongside the API.
pub struct BackgroundTasks {
    publisher: PublisherHandle,
    worker: WorkerHandle,
    repair: RepairHandle,
    retries: Arc<RetryService>,
}

impl BackgroundTasks {
    /// Stop intake of new work first, then let in-flight work finish.
    pub async fn shutdown(self) {
        self.publisher.shutdown().await;
        self.repair.shutdown().await;
        self.worker.shutdown().await;
        self.retries.pool().shutdown().await;
        info!("background tasks stopped");
    }
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    outbox: Arc<dyn OutboxStore>,
    executions: Arc<dyn ExecutionStore>,
    transparency: Arc<dyn TransparencyStore>,
}

async fn build_stores(config: &EngineConfig) -> anyhow::Result<Stores> {
    let Some(url) = config.database_url.as_deref() else {
        let jobs = InMemoryJobStore::arc();
        return Ok(Stores {
            outbox: jobs.clone(),
            jobs,
            executions: InMemoryExecutionStore::arc(),
            transparency: InMemoryTransparencyStore::arc(),
        });
    };

    let pool = db::connect(url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    info!(max_connections = config.db_max_connections, "using postgres stores");
    Ok(Stores {
        jobs: Arc::new(PostgresJobStore::new(pool.clone())),
        outbox: Arc::new(PostgresOutboxStore::new(pool.clone())),
        executions: Arc::new(PostgresExecutionStore::new(pool.clone())),
        transparency: Arc::new(PostgresTransparencyStore::new(pool)),
    })
}

async fn build_coordination(config: &EngineConfig) -> anyhow::Result<Arc<dyn CoordinationStore>> {
    match config.redis_url.as_deref() {
        #[cfg(feature = "redis")]
        Some(url) => {
            let store = beacon_infra::coordination::RedisCoordinationStore::connect(url).await?;
            info!("using redis coordination store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("REDIS_URL set but redis feature not enabled, falling back to in-process coordination");
            Ok(Arc::new(InMemoryCoordinationStore::new()))
        }
        None => Ok(Arc::new(InMemoryCoordinationStore::new())),
    }
}

/// Wire the engine and start its background loops.
pub async fn build_services(
    config: &EngineConfig,
    router: Arc<dyn InferenceRouter>,
) -> anyhow::Result<(AppServices, BackgroundTasks)> {
    let stores = build_stores(config).await?;
    let coordination = build_coordination(config).await?;
    let transparency = Arc::new(TransparencyLog::new(stores.transparency));

    let runner = UnitRunner::new(stores.executions.clone(), router, transparency.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        stores.jobs.clone(),
        stores.executions.clone(),
        coordination.clone(),
        runner.clone(),
        config.orchestrator.clone(),
    ));
    let retries = Arc::new(RetryService::new(
        stores.jobs.clone(),
        stores.executions.clone(),
        coordination,
        runner,
        config.retry.clone(),
    ));
    if let Some(mut failures) = retries.pool().take_failures().await {
        tokio::spawn(async move {
            while let Some(failure) = failures.recv().await {
                warn!(task = %failure.task, error = %failure.error, panicked = failure.panicked, "retry task failed");
            }
        });
    }

    let (tx, rx) = mpsc::channel(config.orchestrator.queue_capacity);
    let worker = OrchestratorWorker::spawn(orchestrator, rx);
    let publisher = OutboxPublisher::new(
        stores.outbox.clone(),
        Arc::new(ChannelDispatcher::new(tx)),
        config.publisher.clone(),
    )
    .spawn();
    let repair = RepairSweep::new(stores.jobs.clone(), config.repair.clone());
    let repair_handle = repair.clone().spawn();

    let services = AppServices {
        intake: IntakeService::new(stores.jobs.clone()),
        jobs: stores.jobs,
        executions: stores.executions,
        outbox: stores.outbox,
        retries: retries.clone(),
        transparency,
        repair,
    };
    let background = BackgroundTasks {
        publisher,
        worker,
        repair: repair_handle,
        retries,
    };
    Ok((services, background))
}
