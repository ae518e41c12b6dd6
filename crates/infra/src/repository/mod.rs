//! Persistence ports for extractions and scheduled reports.

use async_trait::async_trait;
use thiserror::Error;

use reportflow_core::{ExtractionId, ReportId};
use reportflow_extraction::{Extraction, ScheduledReport};

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryExtractionRepository, InMemoryScheduledReports, InMemoryScheduler};
pub use postgres::PostgresExtractionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored document could not be decoded: {0}")]
    Serialization(String),
}

/// Extraction records keyed by `(extraction_id, report_id)`.
///
/// Records expire a fixed time after the extraction started; an expired
/// record reads as absent.
#[async_trait]
pub trait ExtractionRepository: Send + Sync {
    async fn get(
        &self,
        extraction_id: ExtractionId,
        report_id: ReportId,
    ) -> Result<Option<Extraction>, RepositoryError>;

    /// Insert or overwrite.
    async fn save(&self, extraction: &Extraction) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ScheduledReportRepository: Send + Sync {
    async fn get(
        &self,
        platform: &str,
        report_id: ReportId,
    ) -> Result<Option<ScheduledReport>, RepositoryError>;
}

/// The recurring trigger that emits `NewExtraction` for a report.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Stop triggering the report. Removing an absent entry is not an error.
    async fn remove(&self, platform: &str, report_id: ReportId) -> Result<(), RepositoryError>;
}
