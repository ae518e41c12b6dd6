use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::envelope::Envelope;
use crate::error::ValidationError;
use crate::payload::{EventPayload, accept_any};

/// What handling an event amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The step ran and its result was persisted.
    Applied,
    /// Duplicate or late event; nothing to do and nothing to retry.
    StaleIgnored(String),
    /// Valid event, but nothing was due (report disabled, not scheduled today).
    Skipped(String),
    /// The extraction was finalized as failed. The event itself is done.
    Failed(String),
    /// No handler is registered for the event name.
    Unhandled,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::StaleIgnored(_) => "stale_ignored",
            Self::Skipped(_) => "skipped",
            Self::Failed(_) => "failed",
            Self::Unhandled => "unhandled",
        }
    }
}

pub type Validator = fn(&Envelope) -> Result<EventPayload, ValidationError>;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Outcome>>;

pub type Executor = Arc<dyn Fn(EventPayload) -> HandlerFuture + Send + Sync>;

/// A validator paired with the async step it feeds.
#[derive(Clone)]
pub struct HandlerRecord {
    pub validate: Validator,
    pub execute: Executor,
}

impl core::fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRecord").finish_non_exhaustive()
    }
}

impl HandlerRecord {
    pub fn new<F, Fut>(validate: Validator, execute: F) -> Self
    where
        F: Fn(EventPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Outcome>> + Send + 'static,
    {
        Self {
            validate,
            execute: Arc::new(move |payload| Box::pin(execute(payload))),
        }
    }

    /// Accepts anything and does nothing.
    pub fn noop() -> Self {
        Self::new(accept_any, |_| async { Ok(Outcome::Unhandled) })
    }
}
