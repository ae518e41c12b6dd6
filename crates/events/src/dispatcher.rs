//! Event name → handler routing.
//!
//! Names without a registered handler go to the fallback (a no-op unless
//! replaced) so that event types introduced later never crash a consumer.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::envelope::Envelope;
use crate::error::DispatchError;
use crate::handler::{HandlerRecord, Outcome};
use crate::name::EventName;

#[derive(Debug)]
pub struct Dispatcher {
    handlers: HashMap<String, HandlerRecord>,
    fallback: HandlerRecord,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: HandlerRecord::noop(),
        }
    }

    pub fn register(&mut self, name: EventName, handler: HandlerRecord) -> &mut Self {
        self.handlers.insert(name.as_str().to_string(), handler);
        self
    }

    pub fn with_fallback(mut self, handler: HandlerRecord) -> Self {
        self.fallback = handler;
        self
    }

    pub fn handles(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Parse a raw queue body and dispatch it.
    pub async fn dispatch_raw(&self, body: &str) -> Result<Outcome, DispatchError> {
        let envelope = Envelope::parse(body).map_err(|err| {
            error!(error = %err, body, "malformed event envelope");
            DispatchError::from(err)
        })?;
        self.dispatch(envelope).await
    }

    /// Validate the payload, run the handler and log how it went.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<Outcome, DispatchError> {
        let handler = self.handlers.get(&envelope.name).unwrap_or(&self.fallback);
        let event = envelope.name.as_str();

        let payload = (handler.validate)(&envelope).map_err(|err| {
            error!(
                event,
                domain = ?envelope.domain,
                payload = ?envelope.payload,
                error = %err,
                "invalid event payload"
            );
            DispatchError::from(err)
        })?;

        debug!(event, domain = ?envelope.domain, "dispatching event");
        let started = Instant::now();
        let result = (handler.execute)(payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => {
                match &outcome {
                    Outcome::StaleIgnored(reason)
                    | Outcome::Skipped(reason)
                    | Outcome::Failed(reason) => info!(
                        event,
                        elapsed_ms,
                        outcome = outcome.label(),
                        reason = %reason,
                        "event handled"
                    ),
                    _ => info!(event, elapsed_ms, outcome = outcome.label(), "event handled"),
                }
                Ok(outcome)
            }
            Err(cause) => {
                warn!(event, elapsed_ms, error = %cause, "event handler failed");
                Err(DispatchError::Handler {
                    event: envelope.name.clone(),
                    cause,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use reportflow_core::{ExtractionId, ReportId};

    use super::*;
    use crate::error::ValidationError;
    use crate::payload::{EventPayload, validate_lifecycle};

    fn counting(calls: Arc<AtomicU32>) -> HandlerRecord {
        HandlerRecord::new(validate_lifecycle, move |payload| {
            let calls = Arc::clone(&calls);
            async move {
                assert!(matches!(payload, EventPayload::Lifecycle(_)));
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Outcome::Applied)
            }
        })
    }

    fn lifecycle_body(name: &str) -> String {
        Envelope::new(
            name.parse().unwrap(),
            EventPayload::lifecycle(ExtractionId::new(), ReportId::new()),
        )
        .to_json()
        .unwrap()
    }

    #[tokio::test]
    async fn routes_by_name() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(EventName::Initialized, counting(Arc::clone(&calls)));

        let outcome = dispatcher
            .dispatch_raw(&lifecycle_body("Initialized"))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_names_go_to_the_noop_fallback() {
        let dispatcher = Dispatcher::new();

        let outcome = dispatcher
            .dispatch_raw(r#"{"name":"ReportArchived","payload":{"anything":1}}"#)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unhandled);
    }

    #[tokio::test]
    async fn invalid_envelope_fails_before_any_handler_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(EventName::Initialized, counting(Arc::clone(&calls)));

        for body in [r#"{"payload":{}}"#, r#"{"name":["Initialized"]}"#] {
            let err = dispatcher.dispatch_raw(body).await.unwrap_err();
            assert!(err.is_permanent());
        }
        let err = dispatcher
            .dispatch_raw(r#"{"name":"Initialized","payload":{"report_id":"x"}}"#)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Validation(ValidationError::MissingField { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            EventName::CheckQueryStatus,
            HandlerRecord::new(validate_lifecycle, |_| async {
                Err(anyhow::anyhow!("warehouse unavailable"))
            }),
        );

        let err = dispatcher
            .dispatch_raw(&lifecycle_body("CheckQueryStatus"))
            .await
            .unwrap_err();

        assert!(!err.is_permanent());
        assert!(err.to_string().contains("warehouse unavailable"));
    }
}
