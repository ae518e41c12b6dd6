//! Extraction orchestration: one step per queue event.
//!
//! Each step loads the extraction, runs one state-machine operation, persists
//! the result and publishes the event that triggers the next step. Status
//! polls re-publish themselves with a delay until the query settles.
//!
//! Error handling per step:
//! - stale (status conflict, extraction gone): logged, event dropped, no write
//! - other domain errors: extraction finalized as failed and persisted
//! - collaborator errors: propagated so the queue redelivers the event

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use reportflow_core::{DomainError, ReportId};
use reportflow_events::{Envelope, EventName, EventPayload, LifecyclePayload, NewExtractionPayload, Outcome};
use reportflow_extraction::{
    Collaborators, CompressOutcome, Extraction, ExtractionError, ExtractionStatus, QueryOutcome,
};

use crate::jobs::{BackgroundJob, BackgroundJobRegistrar};
use crate::publisher::EventPublisher;
use crate::repository::{ExtractionRepository, ScheduledReportRepository, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Delay before re-checking a running query.
    pub poll_delay: Duration,
    /// How long extraction records are kept.
    pub extraction_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(30),
            extraction_ttl: Duration::from_secs(32 * 86_400),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_extraction_ttl(mut self, ttl: Duration) -> Self {
        self.extraction_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    PerformQuery,
    CheckQueryStatus,
    ExportToCsv,
    CheckCsvQueryStatus,
    EnsureCsvNotEmpty,
    Compress,
}

impl Step {
    fn name(self) -> &'static str {
        match self {
            Self::PerformQuery => "perform_query",
            Self::CheckQueryStatus => "check_query_status",
            Self::ExportToCsv => "export_to_csv",
            Self::CheckCsvQueryStatus => "check_csv_query_status",
            Self::EnsureCsvNotEmpty => "ensure_exported_csv_file_is_not_empty",
            Self::Compress => "compress",
        }
    }

    /// Event announcing a failure during this step.
    fn failure_event(self) -> Option<EventName> {
        match self {
            Self::PerformQuery | Self::CheckQueryStatus => Some(EventName::QueryFailed),
            Self::ExportToCsv | Self::CheckCsvQueryStatus => Some(EventName::ExportFailed),
            Self::EnsureCsvNotEmpty | Self::Compress => None,
        }
    }
}

/// Next event to publish and how long to hold it back.
type Next = (EventName, Duration);

pub struct ExtractionOrchestrator {
    extractions: Arc<dyn ExtractionRepository>,
    reports: Arc<dyn ScheduledReportRepository>,
    scheduler: Arc<dyn Scheduler>,
    jobs: BackgroundJobRegistrar,
    publisher: EventPublisher,
    ports: Collaborators,
    config: OrchestratorConfig,
}

impl core::fmt::Debug for ExtractionOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExtractionOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExtractionOrchestrator {
    pub fn new(
        extractions: Arc<dyn ExtractionRepository>,
        reports: Arc<dyn ScheduledReportRepository>,
        scheduler: Arc<dyn Scheduler>,
        jobs: BackgroundJobRegistrar,
        publisher: EventPublisher,
        ports: Collaborators,
    ) -> Self {
        Self {
            extractions,
            reports,
            scheduler,
            jobs,
            publisher,
            ports,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// `NewExtraction`: create an extraction for a scheduled report and
    /// register its background job.
    ///
    /// Reports that are gone, disabled, without recipients or with an invalid
    /// period are removed from the scheduler.
    #[instrument(skip(self, request), fields(platform = %request.platform, report_id = %request.report_id))]
    pub async fn start_extraction(&self, request: NewExtractionPayload) -> anyhow::Result<Outcome> {
        let NewExtractionPayload {
            platform,
            report_id,
        } = request;

        let Some(report) = self.reports.get(&platform, report_id).await? else {
            let missing = DomainError::not_found(format!("scheduled report {report_id}"));
            return self.unschedule(&platform, report_id, missing).await;
        };

        let now = Utc::now();
        let extraction = match report.start_extraction(now) {
            Ok(extraction) => extraction,
            Err(DomainError::NotScheduledToday) => {
                debug!("report is not scheduled today");
                return Ok(Outcome::Skipped(DomainError::NotScheduledToday.to_string()));
            }
            Err(err) => return self.unschedule(&platform, report_id, err).await,
        };

        self.extractions.save(&extraction).await?;
        if let Err(err) = self
            .jobs
            .register(&BackgroundJob::for_extraction(&extraction))
            .await
        {
            return self.fail(extraction, None, err.to_string(), now).await;
        }

        info!(
            extraction_id = %extraction.extraction_id(),
            output_name = extraction.output_name(),
            "extraction created"
        );
        self.emit(&extraction, EventName::Initialized, Duration::ZERO)
            .await?;
        Ok(Outcome::Applied)
    }

    /// `Initialized`: submit the report query.
    pub async fn perform_query(&self, ids: LifecyclePayload) -> anyhow::Result<Outcome> {
        self.advance(Step::PerformQuery, ids).await
    }

    /// `CheckQueryStatus`: poll the report query.
    pub async fn check_query_status(&self, ids: LifecyclePayload) -> anyhow::Result<Outcome> {
        self.advance(Step::CheckQueryStatus, ids).await
    }

    /// `QueryCompleted`: unload the results to CSV.
    pub async fn export_to_csv(&self, ids: LifecyclePayload) -> anyhow::Result<Outcome> {
        self.advance(Step::ExportToCsv, ids).await
    }

    /// `CheckExportStatus`: poll the export query.
    pub async fn check_csv_query_status(&self, ids: LifecyclePayload) -> anyhow::Result<Outcome> {
        self.advance(Step::CheckCsvQueryStatus, ids).await
    }

    /// `ExportCompleted`: write a header-only file when the export was empty.
    pub async fn ensure_exported_csv_file_is_not_empty(
        &self,
        ids: LifecyclePayload,
    ) -> anyhow::Result<Outcome> {
        self.advance(Step::EnsureCsvNotEmpty, ids).await
    }

    /// `ExportContentChecked`: zip the CSV and finish.
    pub async fn compress(&self, ids: LifecyclePayload) -> anyhow::Result<Outcome> {
        self.advance(Step::Compress, ids).await
    }

    /// Terminal events: log how the extraction ended.
    #[instrument(skip(self), fields(extraction_id = %ids.extraction_id, report_id = %ids.report_id))]
    pub async fn acknowledge_outcome(
        &self,
        event: EventName,
        ids: LifecyclePayload,
    ) -> anyhow::Result<Outcome> {
        let Some(extraction) = self.extractions.get(ids.extraction_id, ids.report_id).await? else {
            return Ok(Outcome::StaleIgnored(format!(
                "extraction {} not found",
                ids.extraction_id
            )));
        };

        match extraction.status() {
            ExtractionStatus::Succeeded => info!(
                %event,
                platform = extraction.platform(),
                csv_path = ?extraction.csv_path(),
                compressed_path = ?extraction.compressed_path(),
                "extraction succeeded"
            ),
            ExtractionStatus::Failed => warn!(
                %event,
                platform = extraction.platform(),
                error_details = ?extraction.error_details(),
                "extraction failed"
            ),
            status => {
                return Ok(Outcome::StaleIgnored(format!(
                    "{event} received while extraction is {status}"
                )));
            }
        }
        Ok(Outcome::Applied)
    }

    #[instrument(
        skip(self),
        fields(step = step.name(), extraction_id = %ids.extraction_id, report_id = %ids.report_id)
    )]
    async fn advance(&self, step: Step, ids: LifecyclePayload) -> anyhow::Result<Outcome> {
        let Some(mut extraction) = self.extractions.get(ids.extraction_id, ids.report_id).await? else {
            let missing = DomainError::not_found(format!("extraction {}", ids.extraction_id));
            warn!(error = %missing, "dropping event");
            return Ok(Outcome::StaleIgnored(missing.to_string()));
        };

        let now = Utc::now();
        match self.apply(step, &mut extraction, now).await {
            Ok((event, delay)) => {
                self.extractions.save(&extraction).await?;
                self.emit(&extraction, event, delay).await?;
                Ok(match extraction.error_details() {
                    Some(detail) if extraction.status() == ExtractionStatus::Failed => {
                        Outcome::Failed(detail.to_string())
                    }
                    _ => Outcome::Applied,
                })
            }
            Err(err) if err.is_stale() => {
                warn!(status = %extraction.status(), error = %err, "dropping stale event");
                Ok(Outcome::StaleIgnored(err.to_string()))
            }
            Err(err) if err.is_terminal_domain() => {
                self.fail(extraction, step.failure_event(), err.to_string(), now)
                    .await
            }
            Err(ExtractionError::Domain(err)) => {
                warn!(status = %extraction.status(), error = %err, "dropping event the extraction cannot act on");
                Ok(Outcome::Skipped(err.to_string()))
            }
            Err(ExtractionError::Collaborator(err)) => {
                Err(err.context(format!("{} failed", step.name())))
            }
        }
    }

    async fn apply(
        &self,
        step: Step,
        extraction: &mut Extraction,
        now: DateTime<Utc>,
    ) -> Result<Next, ExtractionError> {
        let ports = &self.ports;
        let poll = self.config.poll_delay;

        let next = match step {
            Step::PerformQuery => {
                extraction.perform_query(ports, now).await?;
                (EventName::CheckQueryStatus, poll)
            }
            Step::CheckQueryStatus => {
                match extraction.check_query_status(ports, now).await?.outcome() {
                    QueryOutcome::StillRunning => (EventName::CheckQueryStatus, poll),
                    QueryOutcome::Completed => (EventName::QueryCompleted, Duration::ZERO),
                    QueryOutcome::Failed | QueryOutcome::TimedOut => {
                        (EventName::QueryFailed, Duration::ZERO)
                    }
                }
            }
            Step::ExportToCsv => {
                extraction.export_to_csv(ports, now).await?;
                (EventName::CheckExportStatus, poll)
            }
            Step::CheckCsvQueryStatus => {
                match extraction
                    .check_csv_export_query_status(ports, now)
                    .await?
                    .outcome()
                {
                    QueryOutcome::StillRunning => (EventName::CheckExportStatus, poll),
                    QueryOutcome::Completed => (EventName::ExportCompleted, Duration::ZERO),
                    QueryOutcome::Failed | QueryOutcome::TimedOut => {
                        (EventName::ExportFailed, Duration::ZERO)
                    }
                }
            }
            Step::EnsureCsvNotEmpty => {
                if extraction.check_exported_csv_content(ports, now).await? {
                    debug!("export was empty; header-only file written");
                }
                (EventName::ExportContentChecked, Duration::ZERO)
            }
            Step::Compress => match extraction.compress(ports, now).await? {
                CompressOutcome::Converted => (EventName::ReportConverted, Duration::ZERO),
                CompressOutcome::Skipped => (EventName::ReportConversionSkipped, Duration::ZERO),
            },
        };
        Ok(next)
    }

    async fn fail(
        &self,
        mut extraction: Extraction,
        failure_event: Option<EventName>,
        detail: String,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Outcome> {
        if let Err(conflict) = extraction.finalize_with_error(detail.clone(), now) {
            warn!(error = %conflict, "extraction already finished");
            return Ok(Outcome::StaleIgnored(conflict.to_string()));
        }
        warn!(
            extraction_id = %extraction.extraction_id(),
            error_details = %detail,
            "extraction finalized with error"
        );

        self.extractions.save(&extraction).await?;
        if let Some(event) = failure_event {
            self.emit(&extraction, event, Duration::ZERO).await?;
        }
        Ok(Outcome::Failed(detail))
    }

    async fn unschedule(
        &self,
        platform: &str,
        report_id: ReportId,
        reason: DomainError,
    ) -> anyhow::Result<Outcome> {
        self.scheduler
            .remove(platform, report_id)
            .await
            .context("removing scheduler entry")?;
        warn!(error = %reason, "report removed from the scheduler");
        Ok(Outcome::Skipped(reason.to_string()))
    }

    async fn emit(
        &self,
        extraction: &Extraction,
        event: EventName,
        delay: Duration,
    ) -> anyhow::Result<()> {
        let envelope = Envelope::new(
            event,
            EventPayload::lifecycle(extraction.extraction_id(), extraction.report_id()),
        )
        .with_domain(extraction.platform());
        self.publisher
            .publish(&envelope, delay)
            .await
            .with_context(|| format!("publishing {event}"))
    }
}
