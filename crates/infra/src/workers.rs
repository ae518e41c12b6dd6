//! Queue consumers.
//!
//! A worker long-polls the queue for a batch, dispatches every message of the
//! batch concurrently and deletes each message whose handling succeeded or
//! can never succeed. Messages whose handler failed are left for redelivery.
//!
//! Stopping is cooperative: the stop flag is checked between poll cycles and
//! interrupts an idle wait, but an in-flight batch always runs to completion.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{error, info, warn};

use reportflow_events::Dispatcher;

use crate::queue::{MessageQueue, QueueMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Maximum messages per receive.
    pub batch_size: usize,
    /// Long-poll wait per receive.
    pub wait_time: Duration,
    /// Pause after an empty receive or a queue error.
    pub idle_sleep: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            batch_size: 10,
            wait_time: Duration::from_secs(20),
            idle_sleep: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// Stop requested; finishing the current batch.
    Stopping,
    Stopped,
}

/// Marks the worker stopped when its task ends, panics included.
struct MarkStopped(Arc<watch::Sender<WorkerState>>);

impl Drop for MarkStopped {
    fn drop(&mut self) {
        self.0.send_replace(WorkerState::Stopped);
    }
}

/// Handle onto one spawned consumer task.
#[derive(Debug)]
pub struct QueueWorker {
    name: String,
    stop: watch::Sender<bool>,
    state: Arc<watch::Sender<WorkerState>>,
}

impl QueueWorker {
    pub fn spawn(
        name: impl Into<String>,
        queue: Arc<dyn MessageQueue>,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
    ) -> Self {
        let name = name.into();
        let (stop, stop_rx) = watch::channel(false);
        let (state, _) = watch::channel(WorkerState::Running);
        let state = Arc::new(state);

        let task = WorkerLoop {
            name: name.clone(),
            queue,
            dispatcher,
            config,
            stop: stop_rx,
        };
        let stopped = MarkStopped(Arc::clone(&state));
        tokio::spawn(async move {
            let _stopped = stopped;
            task.run().await;
        });

        Self { name, stop, state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Request a stop and wait until the worker has finished its current
    /// batch. Safe to call more than once.
    pub async fn stop(&self) {
        self.stop.send_replace(true);
        self.state.send_if_modified(|state| {
            if *state == WorkerState::Running {
                *state = WorkerState::Stopping;
                true
            } else {
                false
            }
        });

        let mut state = self.state.subscribe();
        // The sender lives in `self`, so this only ends once stopped.
        let _ = state.wait_for(|s| *s == WorkerState::Stopped).await;
    }
}

struct WorkerLoop {
    name: String,
    queue: Arc<dyn MessageQueue>,
    dispatcher: Arc<Dispatcher>,
    config: ConsumerConfig,
    stop: watch::Receiver<bool>,
}

impl WorkerLoop {
    async fn run(mut self) {
        info!(worker = %self.name, "queue worker started");
        loop {
            if *self.stop.borrow() {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = self.stop.changed() => break,
                received = self.queue.receive(self.config.batch_size, self.config.wait_time) => received,
            };

            match received {
                Ok(batch) if batch.is_empty() => {
                    if !self.pause().await {
                        break;
                    }
                }
                Ok(batch) => self.process(batch).await,
                Err(err) => {
                    warn!(worker = %self.name, error = %err, "queue receive failed");
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }
        info!(worker = %self.name, "queue worker stopped");
    }

    /// Idle sleep, cut short by a stop request. Returns `false` when stopping.
    async fn pause(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.changed() => false,
            _ = tokio::time::sleep(self.config.idle_sleep) => true,
        }
    }

    async fn process(&self, batch: Vec<QueueMessage>) {
        let dispatcher = &self.dispatcher;
        let results = join_all(batch.into_iter().map(|message| async move {
            let result = dispatcher.dispatch_raw(&message.body).await;
            (message, result)
        }))
        .await;

        for (message, result) in results {
            let delete = match result {
                Ok(_) => true,
                Err(err) if err.is_permanent() => {
                    error!(
                        worker = %self.name,
                        receipt = %message.receipt,
                        error = %err,
                        "dropping message that can never be handled"
                    );
                    true
                }
                Err(err) => {
                    warn!(
                        worker = %self.name,
                        receipt = %message.receipt,
                        delivery_count = message.delivery_count,
                        error = %err,
                        "message left for redelivery"
                    );
                    false
                }
            };

            if delete {
                if let Err(err) = self.queue.delete(&message.receipt).await {
                    warn!(
                        worker = %self.name,
                        receipt = %message.receipt,
                        error = %err,
                        "failed to delete handled message"
                    );
                }
            }
        }
    }
}

/// A fixed set of workers consuming the same queue.
#[derive(Debug)]
pub struct WorkerGroup {
    workers: Vec<QueueWorker>,
}

impl WorkerGroup {
    pub fn spawn(
        queue: Arc<dyn MessageQueue>,
        dispatcher: Arc<Dispatcher>,
        config: ConsumerConfig,
    ) -> Self {
        let workers = (0..config.workers.max(1))
            .map(|i| {
                QueueWorker::spawn(
                    format!("queue-worker-{i}"),
                    Arc::clone(&queue),
                    Arc::clone(&dispatcher),
                    config,
                )
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(QueueWorker::state).collect()
    }

    /// Stop every worker and wait for all of them.
    pub async fn stop(&self) {
        join_all(self.workers.iter().map(QueueWorker::stop)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use reportflow_core::{ExtractionId, ReportId};
    use reportflow_events::{Envelope, EventName, EventPayload, HandlerRecord, Outcome, validate_lifecycle};

    use super::*;
    use crate::queue::{InMemoryQueue, OutgoingMessage};

    fn body(name: EventName) -> String {
        Envelope::new(name, EventPayload::lifecycle(ExtractionId::new(), ReportId::new()))
            .to_json()
            .unwrap()
    }

    /// `Initialized` succeeds after `work`, `CheckQueryStatus` always fails.
    fn dispatcher(completed: Arc<AtomicU32>, work: Duration) -> Arc<Dispatcher> {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(
                EventName::Initialized,
                HandlerRecord::new(validate_lifecycle, move |_| {
                    let completed = Arc::clone(&completed);
                    async move {
                        tokio::time::sleep(work).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(Outcome::Applied)
                    }
                }),
            )
            .register(
                EventName::CheckQueryStatus,
                HandlerRecord::new(validate_lifecycle, |_| async {
                    Err(anyhow::anyhow!("warehouse unavailable"))
                }),
            );
        Arc::new(dispatcher)
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::default()
            .with_workers(1)
            .with_wait_time(Duration::from_secs(20))
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_handled_and_malformed_messages_keeps_failed_ones() {
        let queue = InMemoryQueue::with_visibility_timeout(Duration::from_secs(300));
        let completed = Arc::new(AtomicU32::new(0));
        for m in [
            body(EventName::Initialized),
            body(EventName::CheckQueryStatus),
            "{not json".to_string(),
        ] {
            queue.send(OutgoingMessage::new(m)).await.unwrap();
        }

        let worker = QueueWorker::spawn(
            "test",
            Arc::new(queue.clone()),
            dispatcher(Arc::clone(&completed), Duration::ZERO),
            config(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        worker.stop().await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        let left = queue.bodies();
        assert_eq!(left.len(), 1);
        assert_eq!(
            Envelope::parse(&left[0]).unwrap().event_name(),
            Some(EventName::CheckQueryStatus)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_in_flight_batch_finish_and_fetches_nothing_more() {
        let queue = InMemoryQueue::new();
        let completed = Arc::new(AtomicU32::new(0));
        queue.send(OutgoingMessage::new(body(EventName::Initialized))).await.unwrap();
        queue.send(OutgoingMessage::new(body(EventName::Initialized))).await.unwrap();

        let worker = QueueWorker::spawn(
            "test",
            Arc::new(queue.clone()),
            dispatcher(Arc::clone(&completed), Duration::from_secs(5)),
            config(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.in_flight(), 2);

        worker.stop().await;

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());

        queue.send(OutgoingMessage::new(body(EventName::Initialized))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_an_idle_long_poll() {
        let queue = InMemoryQueue::new();
        let worker = QueueWorker::spawn(
            "idle",
            Arc::new(queue),
            dispatcher(Arc::new(AtomicU32::new(0)), Duration::ZERO),
            config(),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        worker.stop().await;
        worker.stop().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn group_stops_every_worker() {
        let queue: Arc<dyn MessageQueue> = Arc::new(InMemoryQueue::new());
        let group = WorkerGroup::spawn(
            queue,
            dispatcher(Arc::new(AtomicU32::new(0)), Duration::ZERO),
            ConsumerConfig::default(),
        );
        assert_eq!(group.len(), 3);

        group.stop().await;

        assert!(group.states().iter().all(|s| *s == WorkerState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn group_stop_drains_in_flight_messages_across_workers() {
        let queue = InMemoryQueue::new();
        let completed = Arc::new(AtomicU32::new(0));
        queue.send(OutgoingMessage::new(body(EventName::Initialized))).await.unwrap();
        queue.send(OutgoingMessage::new(body(EventName::Initialized))).await.unwrap();

        let group = WorkerGroup::spawn(
            Arc::new(queue.clone()),
            dispatcher(Arc::clone(&completed), Duration::from_secs(5)),
            ConsumerConfig::default()
                .with_workers(3)
                .with_wait_time(Duration::from_secs(20)),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.in_flight(), 2);

        group.stop().await;

        assert!(group.states().iter().all(|s| *s == WorkerState::Stopped));
        assert_eq!(completed.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());

        queue.send(OutgoingMessage::new(body(EventName::Initialized))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 0);
    }
}
