use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{MessageQueue, OutgoingMessage, QueueError, QueueMessage};

/// Process-local queue with delayed delivery and visibility timeouts.
///
/// Used by tests and single-process deployments. Clones share the same queue.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    entries: BTreeMap<u64, Entry>,
}

struct Entry {
    body: String,
    attributes: HashMap<String, String>,
    visible_at: Instant,
    receipt: Option<String>,
    deliveries: u32,
}

impl core::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("len", &self.len())
            .field("visibility_timeout", &self.inner.visibility_timeout)
            .finish()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                visibility_timeout,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Messages not yet deleted, in flight or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages received and not yet deleted nor timed out.
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|e| e.receipt.is_some() && e.visible_at > now)
            .count()
    }

    /// Bodies of every undeleted message, oldest first.
    pub fn bodies(&self) -> Vec<String> {
        self.lock().entries.values().map(|e| e.body.clone()).collect()
    }

    fn claim(&self, max: usize) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let visibility_timeout = self.inner.visibility_timeout;
        let mut state = self.lock();
        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for (seq, entry) in state.entries.iter_mut() {
            if entry.visible_at > now {
                next_visible = Some(next_visible.map_or(entry.visible_at, |t| t.min(entry.visible_at)));
                continue;
            }
            if batch.len() == max {
                break;
            }
            entry.deliveries += 1;
            let receipt = format!("{seq}-{}", entry.deliveries);
            entry.receipt = Some(receipt.clone());
            entry.visible_at = now + visibility_timeout;
            batch.push(QueueMessage {
                receipt,
                body: entry.body.clone(),
                attributes: entry.attributes.clone(),
                delivery_count: entry.deliveries,
            });
        }
        (batch, next_visible)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.notify.notified();
            let (batch, next_visible) = self.claim(max);
            if !batch.is_empty() || max == 0 || Instant::now() >= deadline {
                return Ok(batch);
            }

            let wake = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        let seq = state
            .entries
            .iter()
            .find(|(_, e)| e.receipt.as_deref() == Some(receipt))
            .map(|(seq, _)| *seq)
            .ok_or_else(|| QueueError::UnknownReceipt(receipt.to_string()))?;
        state.entries.remove(&seq);
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                seq,
                Entry {
                    body: message.body,
                    attributes: message.attributes,
                    visible_at: Instant::now() + message.delay,
                    receipt: None,
                    deliveries: 0,
                },
            );
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}
