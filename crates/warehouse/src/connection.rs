//! Driver-facing connection contract.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::DriverError;

/// Statuses for which a submitted query is still in flight.
pub const RUNNING_STATUSES: &[&str] = &[
    "RUNNING",
    "RESUMING_WAREHOUSE",
    "QUEUED",
    "QUEUED_REPAIRING_WAREHOUSE",
    "NO_DATA",
];

/// Statuses for which a submitted query has ended in failure.
pub const ERROR_STATUSES: &[&str] = &[
    "ABORTING",
    "FAILED_WITH_ERROR",
    "ABORTED",
    "FAILED_WITH_INCIDENT",
    "DISCONNECTED",
    "BLOCKED",
];

/// How a statement is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// Block until the statement finishes.
    pub wait_for_results: bool,
    /// Stream rows instead of buffering them.
    pub stream_results: bool,
    /// Hand back the warehouse query id.
    pub return_query_id: bool,
}

impl QueryOptions {
    /// Run to completion and buffer the rows.
    pub fn blocking() -> Self {
        Self {
            wait_for_results: true,
            stream_results: false,
            return_query_id: false,
        }
    }

    /// Submit and return immediately with the query id; completion is polled
    /// later through [`WarehouseConnection::query_status`].
    pub fn fire_and_forget() -> Self {
        Self {
            wait_for_results: false,
            stream_results: false,
            return_query_id: true,
        }
    }
}

/// Result of a submitted statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub query_id: Option<String>,
    pub rows: Vec<JsonValue>,
}

/// One live warehouse session.
///
/// Implementations wrap a driver handle. Methods take `&self`; a connection is
/// only ever used by the task that borrowed it from the pool.
#[async_trait]
pub trait WarehouseConnection: Send + Sync {
    /// Execute a statement.
    async fn run_query(&self, sql: &str, options: QueryOptions) -> Result<QueryResult, DriverError>;

    /// Health check run by the pool before handing the connection out.
    async fn is_valid(&self) -> Result<bool, DriverError>;

    /// Graceful session teardown.
    async fn close(&self) -> Result<(), DriverError>;

    /// Raw status string of a previously submitted query.
    async fn query_status(&self, query_id: &str) -> Result<String, DriverError>;

    fn is_still_running(&self, status: &str) -> bool {
        RUNNING_STATUSES.contains(&status)
    }

    fn is_error_status(&self, status: &str) -> bool {
        ERROR_STATUSES.contains(&status)
    }
}

/// Opens new sessions for the pool (network handshake).
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, DriverError>;
}
