//! Postgres-backed extraction store.
//!
//! Each extraction is one JSONB document in `report_extractions`, keyed by
//! `(extraction_id, report_id)`. `expires_at` is fixed on first insert to the
//! extraction's start plus the configured TTL; reads ignore expired rows and
//! `purge_expired` deletes them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | Database, PoolClosed, Io, other | `Backend` |
//! | ColumnDecode / Decode | `Serialization` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use reportflow_core::{ExtractionId, ReportId};
use reportflow_extraction::Extraction;

use super::{ExtractionRepository, RepositoryError};

#[derive(Debug, Clone)]
pub struct PostgresExtractionRepository {
    pool: Arc<PgPool>,
    ttl: Duration,
}

impl PostgresExtractionRepository {
    pub fn new(pool: Arc<PgPool>, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    pub async fn connect(database_url: &str, ttl: Duration) -> Result<Self, RepositoryError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(Arc::new(pool), ttl))
    }

    /// Create the table and its expiry index when missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS report_extractions (
                extraction_id UUID NOT NULL,
                report_id UUID NOT NULL,
                platform TEXT NOT NULL,
                status TEXT NOT NULL,
                document JSONB NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (extraction_id, report_id)
            )
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS report_extractions_expires_at_idx
                ON report_extractions (expires_at)
            "#,
        )
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Delete expired rows, returning how many were removed.
    #[instrument(skip(self), err)]
    pub async fn purge_expired(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM report_extractions WHERE expires_at <= now()")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?;
        Ok(result.rows_affected())
    }

    fn expires_at(&self, extraction: &Extraction) -> Result<DateTime<Utc>, RepositoryError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| RepositoryError::Backend(format!("ttl out of range: {e}")))?;
        Ok(extraction.date_start() + ttl)
    }
}

#[async_trait]
impl ExtractionRepository for PostgresExtractionRepository {
    #[instrument(
        skip(self),
        fields(
            extraction_id = %extraction_id.as_uuid(),
            report_id = %report_id.as_uuid()
        ),
        err
    )]
    async fn get(
        &self,
        extraction_id: ExtractionId,
        report_id: ReportId,
    ) -> Result<Option<Extraction>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT document
            FROM report_extractions
            WHERE extraction_id = $1
              AND report_id = $2
              AND expires_at > now()
            "#,
        )
        .bind(extraction_id.as_uuid())
        .bind(report_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| {
            row.try_get::<Json<Extraction>, _>("document")
                .map(|Json(extraction)| extraction)
                .map_err(|e| map_sqlx_error("get", e))
        })
        .transpose()
    }

    #[instrument(
        skip(self, extraction),
        fields(
            extraction_id = %extraction.extraction_id().as_uuid(),
            status = %extraction.status()
        ),
        err
    )]
    async fn save(&self, extraction: &Extraction) -> Result<(), RepositoryError> {
        let expires_at = self.expires_at(extraction)?;

        sqlx::query(
            r#"
            INSERT INTO report_extractions (
                extraction_id,
                report_id,
                platform,
                status,
                document,
                expires_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (extraction_id, report_id) DO UPDATE SET
                status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = now()
            "#,
        )
        .bind(extraction.extraction_id().as_uuid())
        .bind(extraction.report_id().as_uuid())
        .bind(extraction.platform())
        .bind(extraction.status().as_str())
        .bind(Json(extraction))
        .bind(expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => RepositoryError::Backend(format!(
            "database error in {}: {} ({})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("no code")
        )),
        sqlx::Error::PoolClosed => {
            RepositoryError::Backend(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            RepositoryError::Serialization(format!("{operation}: {err}"))
        }
        _ => RepositoryError::Backend(format!("sqlx error in {operation}: {err}")),
    }
}
