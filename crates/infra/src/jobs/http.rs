use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::instrument;

use super::{BackgroundJob, BackgroundJobClient};

/// Posts jobs as JSON to `<base_url>/background-jobs`.
#[derive(Debug, Clone)]
pub struct HttpBackgroundJobClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBackgroundJobClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building background job http client")?;
        Ok(Self {
            client,
            endpoint: endpoint(base_url),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn endpoint(base_url: &str) -> String {
    format!("{}/background-jobs", base_url.trim_end_matches('/'))
}

#[async_trait]
impl BackgroundJobClient for HttpBackgroundJobClient {
    #[instrument(skip(self, job), fields(extraction_id = %job.extraction_id, endpoint = %self.endpoint), err)]
    async fn create(&self, job: &BackgroundJob) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(job)
            .send()
            .await
            .context("sending background job")?;

        if !resp.status().is_success() {
            anyhow::bail!("background job service answered {}", resp.status());
        }
        Ok(())
    }
}
