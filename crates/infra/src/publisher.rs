use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use reportflow_events::Envelope;

use crate::queue::{DOMAIN_ATTRIBUTE, MessageQueue, OutgoingMessage, QueueError};

/// Serializes envelopes onto the queue.
#[derive(Clone)]
pub struct EventPublisher {
    queue: Arc<dyn MessageQueue>,
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }

    /// Enqueue `envelope`, hidden for `delay`. The envelope's domain is also
    /// set as a transport attribute.
    pub async fn publish(&self, envelope: &Envelope, delay: Duration) -> Result<(), QueueError> {
        let body = envelope
            .to_json()
            .map_err(|e| QueueError::Command(format!("serialize envelope: {e}")))?;
        let mut message = OutgoingMessage::new(body).with_delay(delay);
        if let Some(domain) = &envelope.domain {
            message = message.with_attribute(DOMAIN_ATTRIBUTE, domain.clone());
        }

        self.queue.send(message).await?;
        debug!(
            event = %envelope.name,
            domain = ?envelope.domain,
            delay_secs = delay.as_secs(),
            "event published"
        );
        Ok(())
    }
}
