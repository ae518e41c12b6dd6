use thiserror::Error;

/// Malformed envelope or payload. Never retried: the same body fails the
/// same way on every delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message body is not valid JSON: {0}")]
    NotJson(String),

    #[error("envelope must be a JSON object")]
    NotAnObject,

    #[error("envelope has no `name`")]
    MissingName,

    #[error("envelope `name` must be a string")]
    NameNotString,

    #[error("envelope `payload` must be an object")]
    PayloadNotObject,

    #[error("envelope `domain` must be a string")]
    DomainNotString,

    #[error("{event}: payload field `{field}` is required")]
    MissingField { event: String, field: &'static str },

    #[error("{event}: payload field `{field}` must be a string")]
    FieldNotString { event: String, field: &'static str },

    #[error("{event}: payload field `{field}` is invalid: {reason}")]
    InvalidField {
        event: String,
        field: &'static str,
        reason: String,
    },
}

/// Dispatch failure surfaced to the queue consumer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The cause chain is rendered into the message and not exposed as
    /// `source()`, so `{:#}` prints each cause once.
    #[error("handler for {event} failed: {cause:#}")]
    Handler { event: String, cause: anyhow::Error },
}

impl DispatchError {
    /// Redelivering the message cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
