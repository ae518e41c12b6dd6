//! Message queue abstraction the workers consume from and the publisher
//! writes to.
//!
//! Delivery is at-least-once: a received message stays invisible for the
//! queue's visibility timeout and comes back unless it is deleted first.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisQueue;

/// Attribute carrying the tenant routing key.
pub const DOMAIN_ATTRIBUTE: &str = "domain";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("unknown receipt: {0}")]
    UnknownReceipt(String),
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque handle used to delete the message once processed.
    pub receipt: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// A message to enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: String,
    /// Hidden from consumers until this much time has passed.
    pub delay: Duration,
    pub attributes: HashMap<String, String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Long-poll for up to `max` messages, waiting at most `wait` when the
    /// queue is empty.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt: &str) -> Result<(), QueueError>;

    async fn send(&self, message: OutgoingMessage) -> Result<(), QueueError>;
}
