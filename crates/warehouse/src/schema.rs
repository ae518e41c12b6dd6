//! Schema-scoped access on top of the connection pool.
//!
//! Every call borrows a connection, switches it to the caller's schema, runs
//! the statement, switches it back to the default schema and returns it. The
//! pool never needs to know which schema a connection was last used with.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::{QueryOptions, QueryResult};
use crate::error::WarehouseError;
use crate::pool::{ConnectionPool, PooledConnection};

/// A `<database>.<schema>` pair a connection can be switched to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaScope {
    pub database: String,
    pub schema: String,
}

impl SchemaScope {
    pub fn new(database: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
        }
    }

    /// Both names must be non-blank.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if self.database.trim().is_empty() || self.schema.trim().is_empty() {
            return Err(WarehouseError::EmptySchemaConfig {
                database: self.database.clone(),
                schema: self.schema.clone(),
            });
        }
        Ok(())
    }

    pub fn use_statement(&self) -> String {
        format!("USE {}.{}", self.database, self.schema)
    }
}

impl core::fmt::Display for SchemaScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.database, self.schema)
    }
}

/// What to do with a connection whose switch back to the default schema failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetFailurePolicy {
    /// Hand it back anyway; the next borrower's health check decides its fate.
    #[default]
    ReturnToPool,
    /// Close it so it can never be borrowed in an unknown schema.
    Destroy,
}

/// Polled state of a previously submitted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatusReport {
    pub query_id: String,
    pub status: String,
    pub is_running: bool,
    pub is_error: bool,
}

/// Pool wrapper that runs each statement inside a caller-chosen schema.
#[derive(Debug, Clone)]
pub struct SchemaScopedPool {
    pool: ConnectionPool,
    default_scope: SchemaScope,
    reset_policy: ResetFailurePolicy,
}

impl SchemaScopedPool {
    /// Wrap `pool`, resetting connections to `default_scope` after each call.
    pub fn new(pool: ConnectionPool, default_scope: SchemaScope) -> Result<Self, WarehouseError> {
        default_scope.validate()?;
        Ok(Self {
            pool,
            default_scope,
            reset_policy: ResetFailurePolicy::default(),
        })
    }

    pub fn with_reset_policy(mut self, policy: ResetFailurePolicy) -> Self {
        self.reset_policy = policy;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn default_scope(&self) -> &SchemaScope {
        &self.default_scope
    }

    /// Run `sql` with the connection switched to `scope`.
    ///
    /// The connection is back in the pool before this returns, whatever the
    /// outcome. A failing switch or query is reported as
    /// [`WarehouseError::ExtractionFailed`].
    pub async fn run_query(
        &self,
        scope: &SchemaScope,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, WarehouseError> {
        scope.validate()?;
        let conn = self.pool.acquire().await?;

        if let Err(err) = conn
            .run_query(&scope.use_statement(), QueryOptions::blocking())
            .await
        {
            warn!(%scope, error = %err, "failed to switch warehouse schema");
            // Nothing ran in the wrong schema; the next borrow re-validates it.
            conn.release();
            return Err(WarehouseError::ExtractionFailed(Box::new(err)));
        }

        let result = conn.run_query(sql, options).await;
        self.restore_default(conn).await;

        result.map_err(|err| {
            debug!(%scope, error = %err, "scoped warehouse query failed");
            WarehouseError::ExtractionFailed(Box::new(err))
        })
    }

    /// Poll the status of a query submitted earlier. Status lookups are not
    /// schema-bound, so no switch happens.
    pub async fn query_status(&self, query_id: &str) -> Result<QueryStatusReport, WarehouseError> {
        let conn = self.pool.acquire().await?;
        let report = conn
            .query_status(query_id)
            .await
            .map(|status| QueryStatusReport {
                query_id: query_id.to_string(),
                is_running: conn.is_still_running(&status),
                is_error: conn.is_error_status(&status),
                status,
            });
        conn.release();
        report
    }

    async fn restore_default(&self, conn: PooledConnection) {
        let reset = conn
            .run_query(&self.default_scope.use_statement(), QueryOptions::blocking())
            .await;

        match (reset, self.reset_policy) {
            (Ok(_), _) => conn.release(),
            (Err(err), ResetFailurePolicy::ReturnToPool) => {
                warn!(
                    default_scope = %self.default_scope,
                    error = %err,
                    "failed to reset warehouse schema, returning connection anyway"
                );
                conn.release();
            }
            (Err(err), ResetFailurePolicy::Destroy) => {
                warn!(
                    default_scope = %self.default_scope,
                    error = %err,
                    "failed to reset warehouse schema, destroying connection"
                );
                conn.destroy().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reportflow_core::RetryPolicy;

    use super::*;
    use crate::error::DriverError;
    use crate::pool::PoolConfig;
    use crate::testing::FakeWarehouse;

    async fn scoped(warehouse: &FakeWarehouse) -> SchemaScopedPool {
        let config = PoolConfig::default()
            .with_min_size(1)
            .with_max_size(2)
            .with_retry(RetryPolicy::fixed(2, Duration::from_millis(10)));
        let pool = ConnectionPool::new(config, warehouse.factory()).await;
        SchemaScopedPool::new(pool, SchemaScope::new("ANALYTICS", "PUBLIC")).unwrap()
    }

    fn tenant() -> SchemaScope {
        SchemaScope::new("ANALYTICS", "ACME")
    }

    #[tokio::test(start_paused = true)]
    async fn switches_runs_and_resets_in_order() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse).await;

        let result = scoped
            .run_query(&tenant(), "SELECT 1", QueryOptions::fire_and_forget())
            .await
            .unwrap();

        assert_eq!(result.query_id.as_deref(), Some("q-1"));
        assert_eq!(
            warehouse.statements(),
            vec!["USE ANALYTICS.ACME", "SELECT 1", "USE ANALYTICS.PUBLIC"]
        );
        assert_eq!(scoped.pool().borrowed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scope_fails_without_touching_the_pool() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse).await;
        let acquisitions = scoped.pool().stats().acquisitions;

        let err = scoped
            .run_query(&SchemaScope::new("ANALYTICS", " "), "SELECT 1", QueryOptions::blocking())
            .await
            .unwrap_err();

        assert!(matches!(err, WarehouseError::EmptySchemaConfig { .. }));
        assert_eq!(scoped.pool().stats().acquisitions, acquisitions);
        assert!(warehouse.statements().is_empty());
    }

    #[test]
    fn empty_default_scope_is_rejected() {
        let scope = SchemaScope::new("", "PUBLIC");
        assert!(matches!(
            scope.validate(),
            Err(WarehouseError::EmptySchemaConfig { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_switch_returns_connection_and_skips_query() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse).await;
        warehouse.fail_when("USE ANALYTICS.ACME", DriverError::new(404, "schema missing"));

        let err = scoped
            .run_query(&tenant(), "SELECT 1", QueryOptions::blocking())
            .await
            .unwrap_err();

        assert!(matches!(err, WarehouseError::ExtractionFailed(_)));
        assert!(warehouse.statements_matching("SELECT 1").is_empty());
        assert_eq!(scoped.pool().borrowed(), 0);
        assert_eq!(scoped.pool().idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_still_resets_and_returns() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse).await;
        warehouse.fail_when("SELECT broken", DriverError::new(400, "syntax error"));

        let err = scoped
            .run_query(&tenant(), "SELECT broken", QueryOptions::blocking())
            .await
            .unwrap_err();

        assert!(matches!(err, WarehouseError::ExtractionFailed(_)));
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(warehouse.statements_matching("USE ANALYTICS.PUBLIC").len(), 1);
        assert_eq!(scoped.pool().borrowed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_failure_is_swallowed_and_connection_returned() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse).await;
        warehouse.fail_when("USE ANALYTICS.PUBLIC", DriverError::new(400, "denied"));

        scoped
            .run_query(&tenant(), "SELECT 1", QueryOptions::blocking())
            .await
            .unwrap();

        assert_eq!(scoped.pool().borrowed(), 0);
        assert_eq!(scoped.pool().idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_failure_can_destroy_the_connection() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse)
            .await
            .with_reset_policy(ResetFailurePolicy::Destroy);
        warehouse.fail_when("USE ANALYTICS.PUBLIC", DriverError::new(400, "denied"));

        scoped
            .run_query(&tenant(), "SELECT 1", QueryOptions::blocking())
            .await
            .unwrap();

        assert_eq!(scoped.pool().borrowed(), 0);
        assert_eq!(scoped.pool().size(), 0);
        assert_eq!(warehouse.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn query_status_classifies_raw_status() {
        let warehouse = FakeWarehouse::new();
        let scoped = scoped(&warehouse).await;
        warehouse.script_status("q-9", ["RUNNING", "FAILED_WITH_ERROR"]);

        let first = scoped.query_status("q-9").await.unwrap();
        assert!(first.is_running);
        assert!(!first.is_error);

        let second = scoped.query_status("q-9").await.unwrap();
        assert!(!second.is_running);
        assert!(second.is_error);
        assert_eq!(second.status, "FAILED_WITH_ERROR");
        assert_eq!(scoped.pool().borrowed(), 0);
    }
}
