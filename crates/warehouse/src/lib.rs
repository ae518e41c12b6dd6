//! Warehouse access: pooled connections, transient-failure retries and
//! per-call schema switching.
//!
//! Layering, outermost first:
//!
//! ```text
//! SchemaScopedPool  (USE <db>.<schema>, run, reset, return)
//!   └─ ConnectionPool  (bounded, validate on borrow, idle eviction)
//!        └─ RetryingConnection  (retry status >= 500, fixed delay)
//!             └─ dyn WarehouseConnection  (driver session)
//! ```
//!
//! A connection is exclusively owned by whoever borrowed it and is never held
//! across two queue events.

pub mod connection;
pub mod error;
pub mod pool;
pub mod retry;
pub mod schema;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use connection::{ConnectionFactory, QueryOptions, QueryResult, WarehouseConnection};
pub use error::{DriverError, WarehouseError};
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use retry::{Retried, RetryingConnection, retry_transient};
pub use schema::{QueryStatusReport, ResetFailurePolicy, SchemaScope, SchemaScopedPool};
