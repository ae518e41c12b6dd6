use async_trait::async_trait;

use reportflow_extraction::{WarehouseGateway, WarehouseQueryState};
use reportflow_warehouse::{QueryOptions, SchemaScope, SchemaScopedPool};

/// [`WarehouseGateway`] over the schema-scoped connection pool.
///
/// Statements are submitted asynchronously; the extraction polls their
/// status on later events.
#[derive(Debug, Clone)]
pub struct PooledWarehouse {
    pool: SchemaScopedPool,
}

impl PooledWarehouse {
    pub fn new(pool: SchemaScopedPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SchemaScopedPool {
        &self.pool
    }
}

#[async_trait]
impl WarehouseGateway for PooledWarehouse {
    async fn submit(
        &self,
        database: &str,
        schema: &str,
        sql: &str,
    ) -> anyhow::Result<Option<String>> {
        let scope = SchemaScope::new(database, schema);
        let result = self
            .pool
            .run_query(&scope, sql, QueryOptions::fire_and_forget())
            .await?;
        Ok(result.query_id)
    }

    async fn query_state(&self, query_id: &str) -> anyhow::Result<WarehouseQueryState> {
        let report = self.pool.query_status(query_id).await?;
        Ok(WarehouseQueryState {
            status: report.status,
            is_running: report.is_running,
            is_error: report.is_error,
        })
    }
}
