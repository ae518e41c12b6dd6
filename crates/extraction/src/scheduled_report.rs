use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reportflow_core::{DomainError, DomainResult, ExtractionId, ReportId};

use crate::extraction::Extraction;
use crate::recurrence::RecurrenceRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
}

/// A report's recurring export configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledReport {
    pub report_id: ReportId,
    pub platform: String,
    pub name: String,
    pub owner: String,
    pub enabled: bool,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub visibility: Visibility,
    /// Number of days of data the report covers.
    pub period_days: i64,
    pub recurrence: RecurrenceRule,
    #[serde(default = "default_compress")]
    pub compress_output: bool,
}

fn default_compress() -> bool {
    true
}

impl ScheduledReport {
    /// Check eligibility for today and spawn a new extraction.
    pub fn start_extraction(&self, now: DateTime<Utc>) -> DomainResult<Extraction> {
        if !self.enabled {
            return Err(DomainError::ReportDisabled);
        }
        if self.recipients.iter().all(|r| r.trim().is_empty()) {
            return Err(DomainError::NoRecipients);
        }
        let period_days = u32::try_from(self.period_days)
            .ok()
            .filter(|days| *days > 0)
            .ok_or(DomainError::InvalidPeriod(self.period_days))?;
        if !self.recurrence.occurs_on(now.date_naive()) {
            return Err(DomainError::NotScheduledToday);
        }

        Ok(Extraction::new(
            ExtractionId::new(),
            self.report_id,
            self.platform.clone(),
            period_days,
            self.output_name(now),
            now,
        )
        .with_compression(self.compress_output))
    }

    /// File name stem for an export produced at `now`, e.g. `weekly_clicks_20260301`.
    pub fn output_name(&self, now: DateTime<Utc>) -> String {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('_') && !slug.is_empty() {
                slug.push('_');
            }
        }
        let slug = slug.trim_end_matches('_');
        let slug = if slug.is_empty() { "report" } else { slug };
        format!("{slug}_{}", now.format("%Y%m%d"))
    }
}
