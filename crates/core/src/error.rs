//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic business failures only. A domain error never becomes
/// transient: redelivering the same event would hit the same error, so callers
/// either finalize the extraction as failed or drop the event as stale.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An operation was invoked while the entity is in a status that forbids it.
    #[error("status conflict: cannot {operation} while {status}")]
    StatusConflict {
        operation: &'static str,
        status: String,
    },

    /// A requested entity does not exist (extraction or scheduled report).
    #[error("{0} not found")]
    NotFound(String),

    /// The scheduled report's recurrence rule does not fire today.
    #[error("report is not scheduled today")]
    NotScheduledToday,

    /// The scheduled report has been disabled by its owner.
    #[error("report is disabled")]
    ReportDisabled,

    /// The scheduled report has nobody to deliver to.
    #[error("report has no recipients")]
    NoRecipients,

    /// The scheduled report's data period is zero or negative.
    #[error("invalid report period: {0}")]
    InvalidPeriod(i64),

    /// The warehouse accepted a query but did not hand back a query id.
    #[error("warehouse returned an invalid query id")]
    InvalidQueryId,

    /// Registering the downstream background job failed after every attempt.
    #[error("background job creation failed after {attempts} attempts: {reason}")]
    BackgroundJobCreationFailed { attempts: u32, reason: String },

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn status_conflict(operation: &'static str, status: impl core::fmt::Display) -> Self {
        Self::StatusConflict {
            operation,
            status: status.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    /// The event that produced this error is a duplicate or arrived after the
    /// entity moved on; redelivery cannot help.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StatusConflict { .. } | Self::NotFound(_))
    }

    /// The error ends the extraction: it must be finalized as failed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidQueryId
                | Self::BackgroundJobCreationFailed { .. }
                | Self::Validation(_)
                | Self::InvalidId(_)
        )
    }
}
