use thiserror::Error;

use reportflow_core::DomainError;

/// Failure of a state-machine operation.
///
/// `Domain` failures are deterministic and decided on by the orchestrator.
/// `Collaborator` failures (warehouse, file system, lookups) may be transient;
/// they propagate so the triggering event is redelivered.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl ExtractionError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            Self::Collaborator(_) => None,
        }
    }

    /// The event behind this call was a duplicate or arrived too late.
    pub fn is_stale(&self) -> bool {
        self.domain().is_some_and(DomainError::is_stale)
    }

    /// The extraction cannot make progress and must be finalized as failed.
    pub fn is_terminal_domain(&self) -> bool {
        self.domain().is_some_and(DomainError::is_terminal)
    }
}
