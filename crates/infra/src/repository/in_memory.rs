use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use reportflow_core::{ExtractionId, ReportId};
use reportflow_extraction::{Extraction, ScheduledReport};

use super::{ExtractionRepository, RepositoryError, ScheduledReportRepository, Scheduler};

fn lock_error<T>(_: T) -> RepositoryError {
    RepositoryError::Backend("lock poisoned".into())
}

#[derive(Debug, Clone)]
struct StoredExtraction {
    extraction: Extraction,
    expires_at: DateTime<Utc>,
}

/// In-memory extraction store with the same expiry rule as the Postgres one.
#[derive(Debug, Clone)]
pub struct InMemoryExtractionRepository {
    ttl: Duration,
    records: Arc<RwLock<HashMap<(ExtractionId, ReportId), StoredExtraction>>>,
}

impl InMemoryExtractionRepository {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored extraction, expired or not.
    pub fn all(&self) -> Vec<Extraction> {
        self.records
            .read()
            .map(|r| r.values().map(|s| s.extraction.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExtractionRepository for InMemoryExtractionRepository {
    async fn get(
        &self,
        extraction_id: ExtractionId,
        report_id: ReportId,
    ) -> Result<Option<Extraction>, RepositoryError> {
        let records = self.records.read().map_err(lock_error)?;
        Ok(records
            .get(&(extraction_id, report_id))
            .filter(|stored| stored.expires_at > Utc::now())
            .map(|stored| stored.extraction.clone()))
    }

    async fn save(&self, extraction: &Extraction) -> Result<(), RepositoryError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| RepositoryError::Backend(format!("ttl out of range: {e}")))?;
        let mut records = self.records.write().map_err(lock_error)?;
        records.insert(
            (extraction.extraction_id(), extraction.report_id()),
            StoredExtraction {
                extraction: extraction.clone(),
                expires_at: extraction.date_start() + ttl,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryScheduledReports {
    reports: Arc<RwLock<HashMap<(String, ReportId), ScheduledReport>>>,
}

impl InMemoryScheduledReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, report: ScheduledReport) {
        if let Ok(mut reports) = self.reports.write() {
            reports.insert((report.platform.clone(), report.report_id), report);
        }
    }
}

#[async_trait]
impl ScheduledReportRepository for InMemoryScheduledReports {
    async fn get(
        &self,
        platform: &str,
        report_id: ReportId,
    ) -> Result<Option<ScheduledReport>, RepositoryError> {
        let reports = self.reports.read().map_err(lock_error)?;
        Ok(reports.get(&(platform.to_string(), report_id)).cloned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryScheduler {
    entries: Arc<RwLock<HashSet<(String, ReportId)>>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, platform: &str, report_id: ReportId) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert((platform.to_string(), report_id));
        }
    }

    pub fn is_scheduled(&self, platform: &str, report_id: ReportId) -> bool {
        self.entries
            .read()
            .map(|e| e.contains(&(platform.to_string(), report_id)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn remove(&self, platform: &str, report_id: ReportId) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().map_err(lock_error)?;
        entries.remove(&(platform.to_string(), report_id));
        Ok(())
    }
}
