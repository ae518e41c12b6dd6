//! Queue event envelopes and their dispatch.
//!
//! A message body is parsed into an [`Envelope`], routed by name to a
//! [`HandlerRecord`] whose validator turns the raw payload into a typed
//! [`EventPayload`], and executed with timing and outcome logging.

pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod name;
pub mod payload;

pub use dispatcher::Dispatcher;
pub use envelope::Envelope;
pub use error::{DispatchError, ValidationError};
pub use handler::{HandlerFuture, HandlerRecord, Outcome, Validator};
pub use name::EventName;
pub use payload::{
    EventPayload, LifecyclePayload, NewExtractionPayload, accept_any, validate_lifecycle,
    validate_new_extraction,
};
