//! Downstream background job registration.
//!
//! Every extraction is announced to the background job service once, right
//! after it is created. Registration is retried with a fixed delay; running
//! out of attempts is a terminal domain failure for the extraction.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use reportflow_core::{DomainError, ExtractionId, ReportId, RetryPolicy};
use reportflow_extraction::Extraction;

mod http;

pub use http::HttpBackgroundJobClient;

/// Job kind sent for report extractions.
pub const REPORT_EXTRACTION_JOB: &str = "report_extraction";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub kind: String,
    pub platform: String,
    pub extraction_id: ExtractionId,
    pub report_id: ReportId,
    pub created_at: DateTime<Utc>,
}

impl BackgroundJob {
    pub fn for_extraction(extraction: &Extraction) -> Self {
        Self {
            kind: REPORT_EXTRACTION_JOB.to_string(),
            platform: extraction.platform().to_string(),
            extraction_id: extraction.extraction_id(),
            report_id: extraction.report_id(),
            created_at: extraction.date_start(),
        }
    }
}

#[async_trait]
pub trait BackgroundJobClient: Send + Sync {
    async fn create(&self, job: &BackgroundJob) -> anyhow::Result<()>;
}

/// Client used when no background job service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBackgroundJobs;

#[async_trait]
impl BackgroundJobClient for DisabledBackgroundJobs {
    async fn create(&self, job: &BackgroundJob) -> anyhow::Result<()> {
        debug!(
            extraction_id = %job.extraction_id,
            "background job service not configured; skipping registration"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct BackgroundJobRegistrar {
    client: Arc<dyn BackgroundJobClient>,
    retry: RetryPolicy,
}

impl core::fmt::Debug for BackgroundJobRegistrar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackgroundJobRegistrar")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl BackgroundJobRegistrar {
    pub fn new(client: Arc<dyn BackgroundJobClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub async fn register(&self, job: &BackgroundJob) -> Result<(), DomainError> {
        let mut attempt = 1;
        loop {
            match self.client.create(job).await {
                Ok(()) => return Ok(()),
                Err(err) if self.retry.should_retry(attempt) => {
                    warn!(
                        extraction_id = %job.extraction_id,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        error = %err,
                        "background job creation failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(DomainError::BackgroundJobCreationFailed {
                        attempts: attempt,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Fails the first `failures` calls.
    #[derive(Default)]
    struct Flaky {
        failures: u32,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl BackgroundJobClient for Flaky {
        async fn create(&self, _job: &BackgroundJob) -> anyhow::Result<()> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                anyhow::bail!("503 Service Unavailable");
            }
            Ok(())
        }
    }

    fn job() -> BackgroundJob {
        BackgroundJob::for_extraction(&Extraction::new(
            ExtractionId::new(),
            ReportId::new(),
            "acme",
            7,
            "weekly_20260301",
            Utc::now(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_a_retry_goes_through() {
        let client = Arc::new(Flaky {
            failures: 2,
            ..Flaky::default()
        });
        let registrar =
            BackgroundJobRegistrar::new(client.clone(), RetryPolicy::fixed(3, Duration::from_secs(1)));

        let started = tokio::time::Instant::now();
        registrar.register(&job()).await.unwrap();

        assert_eq!(*client.calls.lock().unwrap(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_last_attempt() {
        let client = Arc::new(Flaky {
            failures: u32::MAX,
            ..Flaky::default()
        });
        let registrar =
            BackgroundJobRegistrar::new(client.clone(), RetryPolicy::fixed(3, Duration::from_secs(1)));

        let err = registrar.register(&job()).await.unwrap_err();

        assert_eq!(
            err,
            DomainError::BackgroundJobCreationFailed {
                attempts: 3,
                reason: "503 Service Unavailable".into()
            }
        );
        assert!(err.is_terminal());
    }
}
