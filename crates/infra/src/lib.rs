//! Infrastructure layer: queue, persistence, background jobs, orchestration
//! and the worker pool that drives extractions from queue events.

pub mod config;
pub mod handlers;
pub mod jobs;
pub mod orchestrator;
pub mod publisher;
pub mod queue;
pub mod repository;
pub mod service;
pub mod warehouse_gateway;
pub mod workers;

pub use config::{AppConfig, BackgroundJobsConfig, ConfigError, QueueConfig};
pub use handlers::register_handlers;
pub use jobs::{
    BackgroundJob, BackgroundJobClient, BackgroundJobRegistrar, DisabledBackgroundJobs,
    HttpBackgroundJobClient,
};
pub use orchestrator::{ExtractionOrchestrator, OrchestratorConfig};
pub use publisher::EventPublisher;
pub use queue::{InMemoryQueue, MessageQueue, OutgoingMessage, QueueError, QueueMessage};
#[cfg(feature = "redis")]
pub use queue::RedisQueue;
pub use repository::{
    ExtractionRepository, InMemoryExtractionRepository, InMemoryScheduledReports,
    InMemoryScheduler, PostgresExtractionRepository, RepositoryError, ScheduledReportRepository,
    Scheduler,
};
pub use service::{
    ExtractionService, ServiceDependencies, extraction_repository_from_config, queue_from_config,
};
pub use warehouse_gateway::PooledWarehouse;
pub use workers::{ConsumerConfig, QueueWorker, WorkerGroup, WorkerState};
