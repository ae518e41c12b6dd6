//! The extraction state machine.
//!
//! Every operation checks the current status against its allowed
//! predecessors, performs one externally visible effect and records the new
//! status. A crash between the effect and the persisted write is detected on
//! redelivery because the stored status is still the pre-effect one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use reportflow_core::{DomainError, DomainResult, ExtractionId, ReportId};

use crate::error::ExtractionError;
use crate::export::{CSV_CONTENT_TYPE, copy_into_statement, header_only_csv};
use crate::ports::{Collaborators, StorageTarget};
use crate::query_status::{QueryOutcome, QueryStatus};
use crate::status::{ExtractionStatus, Operation};

/// Warehouse location the report query ran in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryScope {
    pub database: String,
    pub schema: String,
}

/// How the `compress` step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressOutcome {
    Converted,
    Skipped,
}

/// One attempt to produce a report export file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    extraction_id: ExtractionId,
    report_id: ReportId,
    platform: String,
    period_days: u32,
    output_name: String,
    compression_enabled: bool,
    status: ExtractionStatus,
    query_id: Option<String>,
    export_query_id: Option<String>,
    columns: Vec<String>,
    sort: Option<String>,
    scope: Option<QueryScope>,
    storage: Option<StorageTarget>,
    max_query_age_secs: Option<u64>,
    running_for_too_long: bool,
    error_details: Option<String>,
    csv_path: Option<String>,
    compressed_path: Option<String>,
    date_start: DateTime<Utc>,
    date_end: Option<DateTime<Utc>>,
    process_last_time: DateTime<Utc>,
}

impl Extraction {
    pub fn new(
        extraction_id: ExtractionId,
        report_id: ReportId,
        platform: impl Into<String>,
        period_days: u32,
        output_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            extraction_id,
            report_id,
            platform: platform.into(),
            period_days,
            output_name: output_name.into(),
            compression_enabled: true,
            status: ExtractionStatus::Initializing,
            query_id: None,
            export_query_id: None,
            columns: Vec::new(),
            sort: None,
            scope: None,
            storage: None,
            max_query_age_secs: None,
            running_for_too_long: false,
            error_details: None,
            csv_path: None,
            compressed_path: None,
            date_start: now,
            date_end: None,
            process_last_time: now,
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn extraction_id(&self) -> ExtractionId {
        self.extraction_id
    }

    pub fn report_id(&self) -> ReportId {
        self.report_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn period_days(&self) -> u32 {
        self.period_days
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    pub fn status(&self) -> ExtractionStatus {
        self.status
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn export_query_id(&self) -> Option<&str> {
        self.export_query_id.as_deref()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn sort(&self) -> Option<&str> {
        self.sort.as_deref()
    }

    pub fn scope(&self) -> Option<&QueryScope> {
        self.scope.as_ref()
    }

    pub fn storage(&self) -> Option<&StorageTarget> {
        self.storage.as_ref()
    }

    pub fn max_query_age(&self) -> Option<Duration> {
        self.max_query_age_secs.map(Duration::from_secs)
    }

    pub fn running_for_too_long(&self) -> bool {
        self.running_for_too_long
    }

    pub fn error_details(&self) -> Option<&str> {
        self.error_details.as_deref()
    }

    pub fn csv_path(&self) -> Option<&str> {
        self.csv_path.as_deref()
    }

    pub fn compressed_path(&self) -> Option<&str> {
        self.compressed_path.as_deref()
    }

    pub fn date_start(&self) -> DateTime<Utc> {
        self.date_start
    }

    pub fn date_end(&self) -> Option<DateTime<Utc>> {
        self.date_end
    }

    pub fn process_last_time(&self) -> DateTime<Utc> {
        self.process_last_time
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn query_in_flight(&self) -> bool {
        matches!(
            self.status,
            ExtractionStatus::Running | ExtractionStatus::QueryChecked
        )
    }

    fn ensure(&self, op: Operation) -> DomainResult<()> {
        if op.is_allowed_from(self.status) {
            Ok(())
        } else {
            Err(DomainError::status_conflict(op.name(), self.status))
        }
    }

    fn transition(&mut self, to: ExtractionStatus, now: DateTime<Utc>) {
        debug!(
            extraction_id = %self.extraction_id,
            from = %self.status,
            to = %to,
            "extraction status changed"
        );
        self.status = to;
        self.process_last_time = now;
    }

    fn fail(&mut self, detail: String, now: DateTime<Utc>) {
        self.error_details = Some(detail);
        self.date_end = Some(now);
        self.transition(ExtractionStatus::Failed, now);
    }

    fn recorded_scope(&self) -> DomainResult<&QueryScope> {
        self.scope
            .as_ref()
            .ok_or_else(|| DomainError::validation("warehouse scope not recorded"))
    }

    fn recorded_storage(&self) -> DomainResult<&StorageTarget> {
        self.storage
            .as_ref()
            .ok_or_else(|| DomainError::validation("storage target not recorded"))
    }

    fn recorded_csv_path(&self) -> DomainResult<&str> {
        self.csv_path
            .as_deref()
            .ok_or_else(|| DomainError::validation("export path not recorded"))
    }

    fn export_directory(&self, storage: &StorageTarget) -> String {
        let prefix = storage.prefix.trim_matches('/');
        let dir = format!("{}/{}", self.report_id, self.extraction_id);
        if prefix.is_empty() {
            dir
        } else {
            format!("{prefix}/{dir}")
        }
    }

    /// Submit the report query.
    ///
    /// Re-entering while the recorded query is still being polled returns
    /// that id without submitting anything. Once the extraction moved past
    /// polling, re-entry is a status conflict.
    pub async fn perform_query(
        &mut self,
        ports: &Collaborators,
        now: DateTime<Utc>,
    ) -> Result<String, ExtractionError> {
        if let Some(query_id) = self.query_id.as_ref().filter(|_| self.query_in_flight()) {
            return Ok(query_id.clone());
        }
        self.ensure(Operation::PerformQuery)?;

        let settings = ports.settings.settings(&self.platform).await?;
        let definition = ports
            .definitions
            .resolve(&self.platform, self.report_id, self.period_days)
            .await?;

        let query_id = ports
            .warehouse
            .submit(&settings.database, &settings.schema, &definition.sql)
            .await?
            .filter(|id| !id.trim().is_empty())
            .ok_or(DomainError::InvalidQueryId)?;

        self.query_id = Some(query_id.clone());
        self.sort = definition.sort;
        self.columns = definition.columns;
        self.scope = Some(QueryScope {
            database: settings.database,
            schema: settings.schema,
        });
        self.storage = Some(settings.storage);
        self.max_query_age_secs = Some(settings.max_query_age.as_secs());
        self.transition(ExtractionStatus::Running, now);
        Ok(query_id)
    }

    /// Poll the report query.
    pub async fn check_query_status(
        &mut self,
        ports: &Collaborators,
        now: DateTime<Utc>,
    ) -> Result<QueryStatus, ExtractionError> {
        self.ensure(Operation::CheckQueryStatus)?;
        let query_id = self.query_id.clone().ok_or(DomainError::InvalidQueryId)?;

        let polled = self.poll(ports, &query_id, now).await?;
        self.apply_poll(
            &polled,
            ExtractionStatus::QueryChecked,
            ExtractionStatus::QueryCompleted,
            "query",
            now,
        );
        Ok(polled)
    }

    /// Unload the query's result set into a CSV file.
    pub async fn export_to_csv(
        &mut self,
        ports: &Collaborators,
        now: DateTime<Utc>,
    ) -> Result<String, ExtractionError> {
        self.ensure(Operation::ExportToCsv)?;
        let query_id = self.query_id.as_deref().ok_or(DomainError::InvalidQueryId)?;
        let scope = self.recorded_scope()?;
        let storage = self.recorded_storage()?;

        let path = format!("{}/{}.csv", self.export_directory(storage), self.output_name);
        let statement =
            copy_into_statement(query_id, &self.columns, self.sort.as_deref(), storage, &path);

        let export_query_id = ports
            .warehouse
            .submit(&scope.database, &scope.schema, &statement)
            .await?
            .filter(|id| !id.trim().is_empty())
            .ok_or(DomainError::InvalidQueryId)?;

        self.export_query_id = Some(export_query_id.clone());
        self.csv_path = Some(path);
        self.transition(ExtractionStatus::ExportCsvStarted, now);
        Ok(export_query_id)
    }

    /// Poll the export query.
    pub async fn check_csv_export_query_status(
        &mut self,
        ports: &Collaborators,
        now: DateTime<Utc>,
    ) -> Result<QueryStatus, ExtractionError> {
        self.ensure(Operation::CheckCsvExportQueryStatus)?;
        let query_id = self
            .export_query_id
            .clone()
            .ok_or(DomainError::InvalidQueryId)?;

        let polled = self.poll(ports, &query_id, now).await?;
        self.apply_poll(
            &polled,
            ExtractionStatus::ExportCsvChecked,
            ExtractionStatus::ExportCsvCompleted,
            "export query",
            now,
        );
        Ok(polled)
    }

    /// Make sure the exported file exists. An empty result set unloads no
    /// file at all; a header-only CSV is written in its place.
    ///
    /// Returns whether the header-only file was written.
    pub async fn check_exported_csv_content(
        &mut self,
        ports: &Collaborators,
        now: DateTime<Utc>,
    ) -> Result<bool, ExtractionError> {
        self.ensure(Operation::CheckExportedCsvContent)?;
        let storage = self.recorded_storage()?;
        let path = self.recorded_csv_path()?;

        let empty = ports.files.file_is_empty(&storage.bucket, path).await?;
        if empty {
            let header = header_only_csv(&self.columns);
            ports
                .files
                .create_file(&storage.bucket, path, header.as_bytes(), CSV_CONTENT_TYPE)
                .await?;
        }

        self.transition(ExtractionStatus::ExportCsvContentChecked, now);
        Ok(empty)
    }

    /// Zip the CSV (unless compression is off for this extraction) and finish.
    pub async fn compress(
        &mut self,
        ports: &Collaborators,
        now: DateTime<Utc>,
    ) -> Result<CompressOutcome, ExtractionError> {
        self.ensure(Operation::Compress)?;

        if !self.compression_enabled {
            self.transition(ExtractionStatus::ExportConversionSkipped, now);
            self.finalize_with_success(now)?;
            return Ok(CompressOutcome::Skipped);
        }

        let storage = self.recorded_storage()?;
        let csv_path = self.recorded_csv_path()?;
        let dir = self.export_directory(storage);
        let src_name = format!("{}.csv", self.output_name);
        let dst_name = format!("{}.zip", self.output_name);
        let inner_name = format!("report_{}.csv", self.report_id);

        ports
            .files
            .compress_file(&storage.bucket, &dir, &src_name, &dst_name, &inner_name)
            .await?;
        ports.files.delete_file(&storage.bucket, csv_path).await?;

        self.compressed_path = Some(format!("{dir}/{dst_name}"));
        self.transition(ExtractionStatus::ExportConverted, now);
        self.finalize_with_success(now)?;
        Ok(CompressOutcome::Converted)
    }

    pub fn finalize_with_success(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure(Operation::FinalizeWithSuccess)?;
        self.date_end = Some(now);
        self.transition(ExtractionStatus::Succeeded, now);
        Ok(())
    }

    /// Record `detail` verbatim and move to `FAILED`.
    pub fn finalize_with_error(
        &mut self,
        detail: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure(Operation::FinalizeWithError)?;
        self.fail(detail.into(), now);
        Ok(())
    }

    async fn poll(
        &self,
        ports: &Collaborators,
        query_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QueryStatus, ExtractionError> {
        let state = ports.warehouse.query_state(query_id).await?;
        Ok(QueryStatus::evaluate(
            query_id,
            state,
            self.date_start,
            now,
            self.max_query_age(),
        ))
    }

    fn apply_poll(
        &mut self,
        polled: &QueryStatus,
        checked: ExtractionStatus,
        completed: ExtractionStatus,
        what: &str,
        now: DateTime<Utc>,
    ) {
        match polled.outcome() {
            QueryOutcome::TimedOut => {
                self.running_for_too_long = true;
                let max = self.max_query_age_secs.unwrap_or_default();
                self.fail(
                    format!(
                        "{what} {} took too long: running for more than {max}s (last status {})",
                        polled.query_id, polled.status
                    ),
                    now,
                );
            }
            QueryOutcome::Failed => self.fail(
                format!("{what} {} failed with status {}", polled.query_id, polled.status),
                now,
            ),
            QueryOutcome::StillRunning => self.transition(checked, now),
            QueryOutcome::Completed => self.transition(completed, now),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_status(&mut self, status: ExtractionStatus) {
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;
    use crate::testing::TestCollaborators;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn minutes(n: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::minutes(n)
    }

    fn extraction() -> Extraction {
        Extraction::new(
            ExtractionId::new(),
            ReportId::new(),
            "acme.example.com",
            7,
            "weekly_clicks_20260301",
            t0(),
        )
    }

    async fn advanced_to_export_completed(c: &TestCollaborators) -> Extraction {
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();
        e.check_query_status(&c.ports, minutes(2)).await.unwrap();
        e.export_to_csv(&c.ports, minutes(3)).await.unwrap();
        e.check_csv_export_query_status(&c.ports, minutes(4)).await.unwrap();
        assert_eq!(e.status(), ExtractionStatus::ExportCsvCompleted);
        e
    }

    #[tokio::test]
    async fn perform_query_records_submission() {
        let c = TestCollaborators::new();
        let mut e = extraction();

        let query_id = e.perform_query(&c.ports, minutes(1)).await.unwrap();

        assert_eq!(query_id, "q-1");
        assert_eq!(e.status(), ExtractionStatus::Running);
        assert_eq!(e.columns(), ["day", "clicks"]);
        assert_eq!(e.sort(), Some("ORDER BY \"day\" DESC"));
        assert_eq!(e.max_query_age(), Some(Duration::from_secs(1800)));
        assert_eq!(e.process_last_time(), minutes(1));
        let submitted = c.warehouse.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].schema, "ACME");
    }

    #[tokio::test]
    async fn perform_query_twice_returns_same_id_without_resubmitting() {
        let c = TestCollaborators::new();
        let mut e = extraction();

        let first = e.perform_query(&c.ports, minutes(1)).await.unwrap();
        let second = e.perform_query(&c.ports, minutes(2)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(c.warehouse.submitted().len(), 1);
        assert_eq!(e.process_last_time(), minutes(1));
    }

    #[tokio::test]
    async fn perform_query_after_polling_ended_conflicts() {
        let c = TestCollaborators::new();
        c.warehouse.script("q-1", ["FAILED_WITH_ERROR"]);
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();
        e.check_query_status(&c.ports, minutes(2)).await.unwrap();
        assert_eq!(e.status(), ExtractionStatus::Failed);
        let failed = e.clone();

        let err = e.perform_query(&c.ports, minutes(3)).await.unwrap_err();

        assert!(err.is_stale());
        assert_eq!(e, failed);
        assert_eq!(c.warehouse.submitted().len(), 1);
    }

    #[tokio::test]
    async fn missing_query_id_is_invalid() {
        let c = TestCollaborators::new();
        c.warehouse.omit_next_query_id();
        let mut e = extraction();

        let err = e.perform_query(&c.ports, minutes(1)).await.unwrap_err();

        assert!(matches!(err.domain(), Some(DomainError::InvalidQueryId)));
        assert!(err.is_terminal_domain());
        assert_eq!(e.status(), ExtractionStatus::Initializing);
    }

    #[tokio::test]
    async fn submit_failure_propagates_as_collaborator_error() {
        let c = TestCollaborators::new();
        c.warehouse.fail_next_submit("acquire timeout");
        let mut e = extraction();

        let err = e.perform_query(&c.ports, minutes(1)).await.unwrap_err();

        assert!(matches!(err, ExtractionError::Collaborator(_)));
        assert_eq!(e.status(), ExtractionStatus::Initializing);
        assert_eq!(e.query_id(), None);
    }

    #[tokio::test]
    async fn running_query_moves_to_checked_then_completed() {
        let c = TestCollaborators::new();
        c.warehouse.script("q-1", ["RUNNING", "SUCCESS"]);
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();

        let first = e.check_query_status(&c.ports, minutes(2)).await.unwrap();
        assert!(first.is_running);
        assert_eq!(e.status(), ExtractionStatus::QueryChecked);

        e.check_query_status(&c.ports, minutes(3)).await.unwrap();
        assert_eq!(e.status(), ExtractionStatus::QueryCompleted);
    }

    #[tokio::test]
    async fn failed_query_finalizes_with_error() {
        let c = TestCollaborators::new();
        c.warehouse.script("q-1", ["FAILED_WITH_ERROR"]);
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();

        let polled = e.check_query_status(&c.ports, minutes(2)).await.unwrap();

        assert!(polled.is_error);
        assert_eq!(e.status(), ExtractionStatus::Failed);
        assert!(e.error_details().unwrap().contains("FAILED_WITH_ERROR"));
        assert_eq!(e.date_end(), Some(minutes(2)));
        assert!(!e.running_for_too_long());
    }

    #[tokio::test]
    async fn query_over_max_age_fails_even_when_finished() {
        let c = TestCollaborators::new();
        c.warehouse.script("q-1", ["SUCCESS"]);
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();

        let polled = e.check_query_status(&c.ports, minutes(31)).await.unwrap();

        assert!(polled.running_for_too_long);
        assert!(e.running_for_too_long());
        assert_eq!(e.status(), ExtractionStatus::Failed);
        assert!(e.error_details().unwrap().contains("took too long"));
    }

    #[tokio::test]
    async fn export_scans_the_report_query_into_the_bucket() {
        let c = TestCollaborators::new();
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();
        e.check_query_status(&c.ports, minutes(2)).await.unwrap();

        let export_id = e.export_to_csv(&c.ports, minutes(3)).await.unwrap();

        assert_eq!(export_id, "q-2");
        assert_eq!(e.status(), ExtractionStatus::ExportCsvStarted);
        let expected_path = format!(
            "reports/{}/{}/weekly_clicks_20260301.csv",
            e.report_id(),
            e.extraction_id()
        );
        assert_eq!(e.csv_path(), Some(expected_path.as_str()));

        let copy = &c.warehouse.submitted()[1].sql;
        assert!(copy.starts_with(&format!("COPY INTO 's3://exports/{expected_path}'")));
        assert!(copy.contains("RESULT_SCAN('q-1')"));
    }

    #[tokio::test]
    async fn export_timeout_counts_from_extraction_start() {
        let c = TestCollaborators::new();
        let mut e = extraction();
        e.perform_query(&c.ports, minutes(1)).await.unwrap();
        e.check_query_status(&c.ports, minutes(2)).await.unwrap();
        e.export_to_csv(&c.ports, minutes(3)).await.unwrap();
        c.warehouse.script("q-2", ["RUNNING"]);

        e.check_csv_export_query_status(&c.ports, minutes(10)).await.unwrap();
        assert_eq!(e.status(), ExtractionStatus::ExportCsvChecked);

        e.check_csv_export_query_status(&c.ports, minutes(45)).await.unwrap();
        assert_eq!(e.status(), ExtractionStatus::Failed);
        assert!(e.running_for_too_long());
    }

    #[tokio::test]
    async fn empty_export_is_replaced_by_header_only_file() {
        let c = TestCollaborators::new();
        let mut e = advanced_to_export_completed(&c).await;

        let synthesized = e.check_exported_csv_content(&c.ports, minutes(5)).await.unwrap();

        assert!(synthesized);
        assert_eq!(e.status(), ExtractionStatus::ExportCsvContentChecked);
        let path = e.csv_path().unwrap();
        assert_eq!(
            c.files.read("exports", path).unwrap(),
            b"\"day\",\"clicks\"\n".to_vec()
        );
        assert_eq!(c.files.content_type("exports", path).as_deref(), Some("text/csv"));
    }

    #[tokio::test]
    async fn non_empty_export_is_left_alone() {
        let c = TestCollaborators::new();
        let mut e = advanced_to_export_completed(&c).await;
        let path = e.csv_path().unwrap().to_string();
        c.files.put("exports", &path, "day,clicks\n2026-03-01,4\n");

        let synthesized = e.check_exported_csv_content(&c.ports, minutes(5)).await.unwrap();

        assert!(!synthesized);
        assert_eq!(e.status(), ExtractionStatus::ExportCsvContentChecked);
        assert_eq!(c.files.content_type("exports", &path), None);
    }

    #[tokio::test]
    async fn compress_zips_deletes_source_and_succeeds() {
        let c = TestCollaborators::new();
        let mut e = advanced_to_export_completed(&c).await;
        let path = e.csv_path().unwrap().to_string();
        c.files.put("exports", &path, "day\n1\n");
        e.check_exported_csv_content(&c.ports, minutes(5)).await.unwrap();

        let outcome = e.compress(&c.ports, minutes(6)).await.unwrap();

        assert_eq!(outcome, CompressOutcome::Converted);
        assert_eq!(e.status(), ExtractionStatus::Succeeded);
        assert_eq!(e.date_end(), Some(minutes(6)));
        assert!(!c.files.exists("exports", &path));
        let archive = e.compressed_path().unwrap();
        assert!(archive.ends_with("weekly_clicks_20260301.zip"));
        assert!(c.files.exists("exports", archive));
        assert_eq!(c.files.compressed().len(), 1);
    }

    #[tokio::test]
    async fn compress_disabled_skips_straight_to_success() {
        let c = TestCollaborators::new();
        let mut e = extraction().with_compression(false);
        e.perform_query(&c.ports, minutes(1)).await.unwrap();
        e.check_query_status(&c.ports, minutes(2)).await.unwrap();
        e.export_to_csv(&c.ports, minutes(3)).await.unwrap();
        e.check_csv_export_query_status(&c.ports, minutes(4)).await.unwrap();
        e.check_exported_csv_content(&c.ports, minutes(5)).await.unwrap();

        let outcome = e.compress(&c.ports, minutes(6)).await.unwrap();

        assert_eq!(outcome, CompressOutcome::Skipped);
        assert_eq!(e.status(), ExtractionStatus::Succeeded);
        assert!(c.files.compressed().is_empty());
    }

    #[test]
    fn finalize_with_error_records_detail_verbatim() {
        let mut e = extraction();
        e.finalize_with_error("background job: 503 Service Unavailable", minutes(1))
            .unwrap();

        assert_eq!(e.status(), ExtractionStatus::Failed);
        assert_eq!(
            e.error_details(),
            Some("background job: 503 Service Unavailable")
        );

        let err = e.finalize_with_error("again", minutes(2)).unwrap_err();
        assert!(err.is_stale());
        assert_eq!(
            e.error_details(),
            Some("background job: 503 Service Unavailable")
        );
    }

    #[test]
    fn round_trips_through_json_document() {
        let e = extraction();
        let doc = serde_json::to_value(&e).unwrap();
        assert_eq!(doc["status"], "INITIALIZING");
        let back: Extraction = serde_json::from_value(doc).unwrap();
        assert_eq!(back, e);
    }

    fn any_status() -> impl Strategy<Value = ExtractionStatus> {
        prop::sample::select(ExtractionStatus::ALL.to_vec())
    }

    fn any_operation() -> impl Strategy<Value = Operation> {
        prop::sample::select(Operation::ALL.to_vec())
    }

    async fn run(op: Operation, e: &mut Extraction, c: &TestCollaborators) -> Result<(), ExtractionError> {
        let now = minutes(1);
        match op {
            Operation::PerformQuery => e.perform_query(&c.ports, now).await.map(drop),
            Operation::CheckQueryStatus => e.check_query_status(&c.ports, now).await.map(drop),
            Operation::ExportToCsv => e.export_to_csv(&c.ports, now).await.map(drop),
            Operation::CheckCsvExportQueryStatus => {
                e.check_csv_export_query_status(&c.ports, now).await.map(drop)
            }
            Operation::CheckExportedCsvContent => {
                e.check_exported_csv_content(&c.ports, now).await.map(drop)
            }
            Operation::Compress => e.compress(&c.ports, now).await.map(drop),
            Operation::FinalizeWithSuccess => e.finalize_with_success(now).map_err(Into::into),
            Operation::FinalizeWithError => e.finalize_with_error("boom", now).map_err(Into::into),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: an operation invoked outside its allowed-predecessor set
        /// fails with a status conflict, touches no collaborator and leaves
        /// the extraction unchanged.
        #[test]
        fn disallowed_operations_conflict_without_side_effects(
            status in any_status(),
            op in any_operation(),
        ) {
            prop_assume!(!op.is_allowed_from(status));

            let c = TestCollaborators::new();
            let mut e = extraction();
            e.force_status(status);
            let before = e.clone();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let err = rt.block_on(run(op, &mut e, &c)).unwrap_err();

            let is_conflict = matches!(err.domain(), Some(DomainError::StatusConflict { .. }));
            prop_assert!(is_conflict);
            prop_assert_eq!(e, before);
            prop_assert!(c.warehouse.submitted().is_empty());
        }

        /// Property: with a query id already recorded, `perform_query` only
        /// re-enters while that query is being polled; from any other status
        /// it conflicts and changes nothing.
        #[test]
        fn recorded_query_id_reenters_only_while_polling(status in any_status()) {
            // A query id is only ever recorded together with the move to Running.
            prop_assume!(status != ExtractionStatus::Initializing);

            let c = TestCollaborators::new();
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let mut e = extraction();
            rt.block_on(e.perform_query(&c.ports, minutes(1))).unwrap();
            e.force_status(status);
            let before = e.clone();

            let result = rt.block_on(e.perform_query(&c.ports, minutes(2)));

            let polling = matches!(
                status,
                ExtractionStatus::Running | ExtractionStatus::QueryChecked
            );
            if polling {
                prop_assert_eq!(result.unwrap(), "q-1");
            } else {
                let is_conflict = matches!(
                    result.unwrap_err().domain(),
                    Some(DomainError::StatusConflict { .. })
                );
                prop_assert!(is_conflict);
            }
            prop_assert_eq!(e, before);
            prop_assert_eq!(c.warehouse.submitted().len(), 1);
        }
    }
}
