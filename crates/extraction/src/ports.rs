//! Collaborators consumed by the state machine.
//!
//! Implementations live elsewhere (the pooled warehouse adapter in
//! `reportflow-infra`, object storage and report catalogues outside this
//! workspace). Every port reports failures as `anyhow::Error`; the state
//! machine treats them as possibly transient and lets them propagate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reportflow_core::ReportId;

/// Where an export lands and how the warehouse is allowed to write there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTarget {
    pub bucket: String,
    /// Warehouse storage integration granting write access to the bucket.
    pub integration: String,
    /// Key prefix under which exports are written.
    pub prefix: String,
}

/// Per-platform settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSettings {
    pub database: String,
    pub schema: String,
    /// Queries (and their exports) running longer than this are abandoned.
    pub max_query_age: Duration,
    pub storage: StorageTarget,
}

/// Report-specific SQL and its presentation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDefinition {
    pub sql: String,
    /// Full clause, e.g. `ORDER BY "day" DESC`.
    pub sort: Option<String>,
    pub columns: Vec<String>,
}

/// Raw poll result for a submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseQueryState {
    pub status: String,
    pub is_running: bool,
    pub is_error: bool,
}

#[async_trait]
pub trait WarehouseGateway: Send + Sync {
    /// Submit `sql` inside `database.schema` without waiting for it to finish.
    /// Returns the warehouse query id, if the driver handed one back.
    async fn submit(&self, database: &str, schema: &str, sql: &str)
    -> anyhow::Result<Option<String>>;

    async fn query_state(&self, query_id: &str) -> anyhow::Result<WarehouseQueryState>;
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn file_is_empty(&self, bucket: &str, path: &str) -> anyhow::Result<bool>;

    async fn create_file(
        &self,
        bucket: &str,
        path: &str,
        content: &[u8],
        content_type: &str,
    ) -> anyhow::Result<()>;

    /// Zip `src_path/src_name` into `src_path/dst_name`, storing it inside the
    /// archive as `inner_name`.
    async fn compress_file(
        &self,
        bucket: &str,
        src_path: &str,
        src_name: &str,
        dst_name: &str,
        inner_name: &str,
    ) -> anyhow::Result<()>;

    async fn delete_file(&self, bucket: &str, path: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ReportDefinitionResolver: Send + Sync {
    async fn resolve(
        &self,
        platform: &str,
        report_id: ReportId,
        period_days: u32,
    ) -> anyhow::Result<ReportDefinition>;
}

#[async_trait]
pub trait PlatformSettingsProvider: Send + Sync {
    async fn settings(&self, platform: &str) -> anyhow::Result<PlatformSettings>;
}

/// Everything a state-machine step may call out to.
#[derive(Clone)]
pub struct Collaborators {
    pub warehouse: Arc<dyn WarehouseGateway>,
    pub files: Arc<dyn FileSystem>,
    pub definitions: Arc<dyn ReportDefinitionResolver>,
    pub settings: Arc<dyn PlatformSettingsProvider>,
}

impl core::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
