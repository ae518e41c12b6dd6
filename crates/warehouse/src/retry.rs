//! Retry decorator for a single warehouse connection.
//!
//! Only transient driver failures (status >= 500) are retried, with a fixed
//! delay between attempts. Client-side failures propagate on the attempt that
//! produced them.

use std::future::Future;

use tracing::warn;

use reportflow_core::RetryPolicy;

use crate::connection::{QueryOptions, QueryResult, WarehouseConnection};
use crate::error::{DriverError, WarehouseError};

/// A successful value together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `call` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
///
/// Errors are annotated with the operation name and the attempt count at
/// which the call gave up.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<Retried<T>, WarehouseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    status = ?err.status,
                    error = %err.message,
                    "transient warehouse failure, retrying"
                );
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
            }
            Err(source) => {
                return Err(WarehouseError::QueryExecution {
                    operation,
                    attempts: attempt,
                    source,
                });
            }
        }
    }
}

/// A driver connection with every operation wrapped in [`retry_transient`].
pub struct RetryingConnection {
    inner: Box<dyn WarehouseConnection>,
    policy: RetryPolicy,
}

impl core::fmt::Debug for RetryingConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RetryingConnection")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryingConnection {
    pub fn new(inner: Box<dyn WarehouseConnection>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn run_query(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, WarehouseError> {
        retry_transient(&self.policy, "run query", move || {
            self.inner.run_query(sql, options)
        })
        .await
        .map(|r| r.value)
    }

    pub async fn is_valid(&self) -> Result<bool, WarehouseError> {
        retry_transient(&self.policy, "validate connection", move || self.inner.is_valid())
            .await
            .map(|r| r.value)
    }

    pub async fn close(&self) -> Result<(), WarehouseError> {
        retry_transient(&self.policy, "close connection", move || self.inner.close())
            .await
            .map(|r| r.value)
    }

    pub async fn query_status(&self, query_id: &str) -> Result<String, WarehouseError> {
        retry_transient(&self.policy, "get query status", move || {
            self.inner.query_status(query_id)
        })
        .await
        .map(|r| r.value)
    }

    pub fn is_still_running(&self, status: &str) -> bool {
        self.inner.is_still_running(status)
    }

    pub fn is_error_status(&self, status: &str) -> bool {
        self.inner.is_error_status(status)
    }
}
