//! In-memory collaborators for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use reportflow_core::ReportId;

use crate::ports::{
    Collaborators, FileSystem, PlatformSettings, PlatformSettingsProvider, ReportDefinition,
    ReportDefinitionResolver, StorageTarget, WarehouseGateway, WarehouseQueryState,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A statement handed to [`ScriptedWarehouse::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub database: String,
    pub schema: String,
    pub sql: String,
}

#[derive(Debug, Default)]
struct WarehouseState {
    submitted: Vec<Submitted>,
    next_id: u32,
    omit_next_id: bool,
    submit_failures: VecDeque<String>,
    states: HashMap<String, VecDeque<WarehouseQueryState>>,
}

/// Warehouse gateway issuing ids `q-1`, `q-2`, ... Unscripted queries report
/// `SUCCESS`.
#[derive(Debug, Clone, Default)]
pub struct ScriptedWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl ScriptedWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<Submitted> {
        lock(&self.state).submitted.clone()
    }

    /// The next submission succeeds without returning a query id.
    pub fn omit_next_query_id(&self) {
        lock(&self.state).omit_next_id = true;
    }

    pub fn fail_next_submit(&self, message: impl Into<String>) {
        lock(&self.state).submit_failures.push_back(message.into());
    }

    /// Raw statuses reported for `query_id`, in order; the last one repeats.
    pub fn script<'a>(&self, query_id: &str, statuses: impl IntoIterator<Item = &'a str>) {
        let states = statuses.into_iter().map(classify).collect();
        lock(&self.state).states.insert(query_id.to_string(), states);
    }
}

fn classify(status: &str) -> WarehouseQueryState {
    const RUNNING: &[&str] = &["RUNNING", "RESUMING_WAREHOUSE", "QUEUED", "NO_DATA"];
    const ERROR: &[&str] = &["ABORTING", "FAILED_WITH_ERROR", "ABORTED", "BLOCKED"];
    WarehouseQueryState {
        status: status.to_string(),
        is_running: RUNNING.contains(&status),
        is_error: ERROR.contains(&status),
    }
}

#[async_trait]
impl WarehouseGateway for ScriptedWarehouse {
    async fn submit(
        &self,
        database: &str,
        schema: &str,
        sql: &str,
    ) -> anyhow::Result<Option<String>> {
        let mut state = lock(&self.state);
        if let Some(message) = state.submit_failures.pop_front() {
            anyhow::bail!(message);
        }
        state.submitted.push(Submitted {
            database: database.to_string(),
            schema: schema.to_string(),
            sql: sql.to_string(),
        });
        if std::mem::take(&mut state.omit_next_id) {
            return Ok(None);
        }
        state.next_id += 1;
        Ok(Some(format!("q-{}", state.next_id)))
    }

    async fn query_state(&self, query_id: &str) -> anyhow::Result<WarehouseQueryState> {
        let mut state = lock(&self.state);
        Ok(match state.states.get_mut(query_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_else(|| classify("SUCCESS")),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| classify("SUCCESS")),
            None => classify("SUCCESS"),
        })
    }
}

#[derive(Debug, Default)]
struct FilesState {
    files: HashMap<(String, String), Vec<u8>>,
    content_types: HashMap<(String, String), String>,
    compressed: Vec<(String, String, String)>,
}

/// Object storage keyed by `(bucket, path)`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileSystem {
    state: Arc<Mutex<FilesState>>,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, path: &str, content: impl Into<Vec<u8>>) {
        lock(&self.state)
            .files
            .insert((bucket.to_string(), path.to_string()), content.into());
    }

    pub fn read(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.state)
            .files
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    pub fn content_type(&self, bucket: &str, path: &str) -> Option<String> {
        lock(&self.state)
            .content_types
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
    }

    pub fn exists(&self, bucket: &str, path: &str) -> bool {
        self.read(bucket, path).is_some()
    }

    /// `(archive path, source name, inner name)` of every compression.
    pub fn compressed(&self) -> Vec<(String, String, String)> {
        lock(&self.state).compressed.clone()
    }
}

#[async_trait]
impl FileSystem for InMemoryFileSystem {
    async fn file_is_empty(&self, bucket: &str, path: &str) -> anyhow::Result<bool> {
        Ok(self.read(bucket, path).is_none_or(|content| content.is_empty()))
    }

    async fn create_file(
        &self,
        bucket: &str,
        path: &str,
        content: &[u8],
        content_type: &str,
    ) -> anyhow::Result<()> {
        let key = (bucket.to_string(), path.to_string());
        let mut state = lock(&self.state);
        state.files.insert(key.clone(), content.to_vec());
        state.content_types.insert(key, content_type.to_string());
        Ok(())
    }

    async fn compress_file(
        &self,
        bucket: &str,
        src_path: &str,
        src_name: &str,
        dst_name: &str,
        inner_name: &str,
    ) -> anyhow::Result<()> {
        let source = format!("{src_path}/{src_name}");
        let Some(content) = self.read(bucket, &source) else {
            anyhow::bail!("no such file: {bucket}/{source}");
        };
        let archive = format!("{src_path}/{dst_name}");
        let mut state = lock(&self.state);
        state.files.insert((bucket.to_string(), archive.clone()), content);
        state
            .compressed
            .push((archive, src_name.to_string(), inner_name.to_string()));
        Ok(())
    }

    async fn delete_file(&self, bucket: &str, path: &str) -> anyhow::Result<()> {
        lock(&self.state)
            .files
            .remove(&(bucket.to_string(), path.to_string()));
        Ok(())
    }
}

/// Resolves every report to the same definition.
#[derive(Debug, Clone)]
pub struct StaticDefinitions(pub ReportDefinition);

#[async_trait]
impl ReportDefinitionResolver for StaticDefinitions {
    async fn resolve(
        &self,
        _platform: &str,
        _report_id: ReportId,
        _period_days: u32,
    ) -> anyhow::Result<ReportDefinition> {
        Ok(self.0.clone())
    }
}

/// Same settings for every platform.
#[derive(Debug, Clone)]
pub struct StaticSettings(pub PlatformSettings);

#[async_trait]
impl PlatformSettingsProvider for StaticSettings {
    async fn settings(&self, _platform: &str) -> anyhow::Result<PlatformSettings> {
        Ok(self.0.clone())
    }
}

pub fn sample_definition() -> ReportDefinition {
    ReportDefinition {
        sql: "SELECT day, clicks FROM stats".into(),
        sort: Some("ORDER BY \"day\" DESC".into()),
        columns: vec!["day".into(), "clicks".into()],
    }
}

pub fn sample_settings() -> PlatformSettings {
    PlatformSettings {
        database: "ANALYTICS".into(),
        schema: "ACME".into(),
        max_query_age: Duration::from_secs(30 * 60),
        storage: StorageTarget {
            bucket: "exports".into(),
            integration: "S3_EXPORTS".into(),
            prefix: "reports".into(),
        },
    }
}

/// Scripted collaborators plus handles onto the fakes behind them.
#[derive(Debug, Clone)]
pub struct TestCollaborators {
    pub warehouse: ScriptedWarehouse,
    pub files: InMemoryFileSystem,
    pub ports: Collaborators,
}

impl TestCollaborators {
    pub fn new() -> Self {
        Self::with(sample_definition(), sample_settings())
    }

    pub fn with(definition: ReportDefinition, settings: PlatformSettings) -> Self {
        let warehouse = ScriptedWarehouse::new();
        let files = InMemoryFileSystem::new();
        let ports = Collaborators {
            warehouse: Arc::new(warehouse.clone()),
            files: Arc::new(files.clone()),
            definitions: Arc::new(StaticDefinitions(definition)),
            settings: Arc::new(StaticSettings(settings)),
        };
        Self {
            warehouse,
            files,
            ports,
        }
    }
}

impl Default for TestCollaborators {
    fn default() -> Self {
        Self::new()
    }
}
