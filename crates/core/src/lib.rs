//! `reportflow-core`: shared building blocks for the extraction pipeline.
//!
//! This crate contains **pure** primitives (no IO, no async): identifiers, the
//! domain error taxonomy and the fixed-delay retry policy used by every layer
//! that retries.

pub mod error;
pub mod id;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::{ExtractionId, ReportId};
pub use retry::RetryPolicy;
