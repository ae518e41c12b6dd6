//! Process wiring and shutdown sequencing.
//!
//! ```text
//! ConnectionPool → SchemaScopedPool → PooledWarehouse ┐
//! files / definitions / settings ─────────────────────┴→ ExtractionOrchestrator
//!   → register_handlers → Dispatcher → WorkerGroup ← MessageQueue
//! ```
//!
//! Shutdown stops every worker (each finishes its in-flight batch) before the
//! pool is drained, so no step ever finds the pool closed under it.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::info;

use reportflow_events::Dispatcher;
use reportflow_extraction::{
    Collaborators, FileSystem, PlatformSettingsProvider, ReportDefinitionResolver,
};
use reportflow_warehouse::{ConnectionFactory, ConnectionPool, SchemaScopedPool};

use crate::config::{AppConfig, QueueConfig};
use crate::handlers::register_handlers;
use crate::jobs::{
    BackgroundJobClient, BackgroundJobRegistrar, DisabledBackgroundJobs, HttpBackgroundJobClient,
};
use crate::orchestrator::ExtractionOrchestrator;
use crate::publisher::EventPublisher;
use crate::queue::{InMemoryQueue, MessageQueue};
use crate::repository::{
    ExtractionRepository, InMemoryExtractionRepository, PostgresExtractionRepository,
    ScheduledReportRepository, Scheduler,
};
use crate::warehouse_gateway::PooledWarehouse;
use crate::workers::{WorkerGroup, WorkerState};

/// Adapters the service cannot build from configuration alone.
pub struct ServiceDependencies {
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub queue: Arc<dyn MessageQueue>,
    pub extractions: Arc<dyn ExtractionRepository>,
    pub reports: Arc<dyn ScheduledReportRepository>,
    pub scheduler: Arc<dyn Scheduler>,
    pub files: Arc<dyn FileSystem>,
    pub definitions: Arc<dyn ReportDefinitionResolver>,
    pub settings: Arc<dyn PlatformSettingsProvider>,
    /// Overrides the client derived from `background_jobs.base_url`.
    pub background_jobs: Option<Arc<dyn BackgroundJobClient>>,
}

pub struct ExtractionService {
    pool: ConnectionPool,
    workers: WorkerGroup,
    evictor: JoinHandle<()>,
    publisher: EventPublisher,
}

impl core::fmt::Debug for ExtractionService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtractionService")
            .field("pool", &self.pool)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl ExtractionService {
    pub async fn start(config: &AppConfig, deps: ServiceDependencies) -> anyhow::Result<Self> {
        let pool = ConnectionPool::new(config.pool.clone(), deps.connection_factory).await;
        let scoped = SchemaScopedPool::new(pool.clone(), config.default_scope.clone())
            .context("default warehouse schema")?
            .with_reset_policy(config.reset_policy);

        let ports = Collaborators {
            warehouse: Arc::new(PooledWarehouse::new(scoped)),
            files: deps.files,
            definitions: deps.definitions,
            settings: deps.settings,
        };

        let jobs_client: Arc<dyn BackgroundJobClient> =
            match (deps.background_jobs, &config.background_jobs.base_url) {
                (Some(client), _) => client,
                (None, Some(base_url)) => Arc::new(HttpBackgroundJobClient::new(base_url)?),
                (None, None) => Arc::new(DisabledBackgroundJobs),
            };

        let publisher = EventPublisher::new(Arc::clone(&deps.queue));
        let orchestrator = ExtractionOrchestrator::new(
            deps.extractions,
            deps.reports,
            deps.scheduler,
            BackgroundJobRegistrar::new(jobs_client, config.background_jobs.retry),
            publisher.clone(),
            ports,
        )
        .with_config(config.orchestrator);

        let mut dispatcher = Dispatcher::new();
        register_handlers(&mut dispatcher, Arc::new(orchestrator));

        let workers = WorkerGroup::spawn(deps.queue, Arc::new(dispatcher), config.consumer);
        let evictor = pool.spawn_evictor();
        info!(
            workers = workers.len(),
            pool_max_size = config.pool.max_size,
            "extraction service started"
        );

        Ok(Self {
            pool,
            workers,
            evictor,
            publisher,
        })
    }

    /// Publisher onto the consumed queue, e.g. for the scheduler's `NewExtraction`s.
    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.states()
    }

    /// Stop the workers, then drain the pool.
    pub async fn shutdown(self) {
        info!("stopping queue workers");
        self.workers.stop().await;

        self.evictor.abort();
        self.pool.drain().await;
        info!(stats = ?self.pool.stats(), "extraction service stopped");
    }
}

/// Queue named by the configuration: Redis when a URL is set, otherwise a
/// process-local queue.
pub async fn queue_from_config(config: &QueueConfig) -> anyhow::Result<Arc<dyn MessageQueue>> {
    match &config.redis_url {
        None => Ok(Arc::new(InMemoryQueue::with_visibility_timeout(
            config.visibility_timeout,
        ))),
        #[cfg(feature = "redis")]
        Some(url) => {
            let queue = crate::queue::RedisQueue::connect(
                url,
                config.stream.clone(),
                config.group.clone(),
                config.visibility_timeout,
            )
            .await
            .context("connecting to the redis queue")?;
            Ok(Arc::new(queue))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("a redis queue URL is configured but the `redis` feature is disabled"),
    }
}

/// Extraction store named by the configuration: Postgres when a database URL
/// is set, otherwise in memory.
pub async fn extraction_repository_from_config(
    config: &AppConfig,
) -> anyhow::Result<Arc<dyn ExtractionRepository>> {
    let ttl = config.orchestrator.extraction_ttl;
    match &config.database_url {
        Some(url) => {
            let repo = PostgresExtractionRepository::connect(url, ttl)
                .await
                .context("connecting to postgres")?;
            repo.ensure_schema().await?;
            Ok(Arc::new(repo))
        }
        None => Ok(Arc::new(InMemoryExtractionRepository::new(ttl))),
    }
}
