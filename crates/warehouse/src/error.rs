use std::time::Duration;

use thiserror::Error;

/// Failure reported by the warehouse driver.
///
/// `status` is the HTTP-like code the driver attaches to the failure, when it
/// has one. Codes >= 500 are transient (warehouse or network blip); anything
/// below is deterministic (bad SQL, missing object, auth) and retrying it
/// would only fail again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (status: {status:?})")]
pub struct DriverError {
    pub status: Option<u16>,
    pub message: String,
}

impl DriverError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// A failure without any status code (treated as non-transient).
    pub fn without_status(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status.is_some_and(|code| code >= 500)
    }
}

/// Resource-layer error: pool, connection and query execution failures.
///
/// None of these are retried by callers; transient driver failures have
/// already been retried by [`crate::RetryingConnection`] before surfacing here.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// The pool was drained (or never started); no connection can be handed out.
    #[error("warehouse connection pool is not instantiated")]
    NotInstantiated,

    /// A schema-scoped call was made without a database or schema name.
    #[error("empty schema configuration (database: {database:?}, schema: {schema:?})")]
    EmptySchemaConfig { database: String, schema: String },

    /// Every connection is borrowed and none came back in time.
    #[error("timed out after {0:?} waiting for a warehouse connection")]
    AcquireTimeout(Duration),

    /// A fresh connection could not be opened or failed its health check.
    #[error("warehouse data source unavailable after {attempts} attempt(s): {source}")]
    DataSourceUnavailable {
        attempts: u32,
        #[source]
        source: DriverError,
    },

    /// A connection operation failed, after retries if the failure was transient.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    QueryExecution {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: DriverError,
    },

    /// The caller's query (or the schema switch preceding it) failed. The
    /// connection has already been handed back to the pool.
    #[error("extraction query failed: {0}")]
    ExtractionFailed(#[source] Box<WarehouseError>),
}

impl WarehouseError {
    /// Number of attempts made before giving up, when the error came from a
    /// retried operation.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::DataSourceUnavailable { attempts, .. } | Self::QueryExecution { attempts, .. } => {
                Some(*attempts)
            }
            Self::ExtractionFailed(inner) => inner.attempts(),
            _ => None,
        }
    }

    /// The driver error at the root of this failure, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::DataSourceUnavailable { source, .. } | Self::QueryExecution { source, .. } => {
                Some(source)
            }
            Self::ExtractionFailed(inner) => inner.driver_error(),
            _ => None,
        }
    }
}
