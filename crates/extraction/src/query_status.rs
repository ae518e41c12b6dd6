use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ports::WarehouseQueryState;

/// Result of polling the warehouse for a submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatus {
    pub query_id: String,
    pub status: String,
    pub is_running: bool,
    pub is_error: bool,
    /// Elapsed time since the extraction started exceeds its max query age.
    pub running_for_too_long: bool,
}

/// What a poll means for the extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Over its time budget, whatever the warehouse says.
    TimedOut,
    Failed,
    StillRunning,
    Completed,
}

impl QueryStatus {
    pub fn evaluate(
        query_id: &str,
        state: WarehouseQueryState,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        max_age: Option<Duration>,
    ) -> Self {
        let elapsed = (now - started_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            query_id: query_id.to_string(),
            status: state.status,
            is_running: state.is_running,
            is_error: state.is_error,
            running_for_too_long: max_age.is_some_and(|max| elapsed > max),
        }
    }

    pub fn outcome(&self) -> QueryOutcome {
        if self.running_for_too_long {
            QueryOutcome::TimedOut
        } else if self.is_error {
            QueryOutcome::Failed
        } else if self.is_running {
            QueryOutcome::StillRunning
        } else {
            QueryOutcome::Completed
        }
    }
}
