//! Redis Streams-backed queue.
//!
//! - **Stream**: one stream per queue, consumed through a single consumer group
//! - **Delays**: delayed messages wait in a sorted set `<stream>:delayed`
//!   scored by due time and are moved onto the stream by `receive`
//! - **Visibility**: entries left pending longer than the visibility timeout
//!   are taken over with `XAUTOCLAIM`
//! - **Delete**: `XACK` followed by `XDEL`

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Value;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{MessageQueue, OutgoingMessage, QueueError, QueueMessage};

/// Delayed messages promoted per `receive` call.
const PROMOTE_BATCH: usize = 100;

#[derive(Debug, Serialize, Deserialize)]
struct DelayedMessage {
    id: Uuid,
    body: String,
    attributes: HashMap<String, String>,
}

/// Connections parked between blocking reads.
///
/// A blocking `XREADGROUP` holds its connection for the whole wait, so each
/// concurrent reader checks one out and returns it once the read succeeded.
/// A connection whose command failed is dropped instead of returned.
struct IdleConnections<C> {
    idle: Arc<Mutex<Vec<C>>>,
}

impl<C> Clone for IdleConnections<C> {
    fn clone(&self) -> Self {
        Self {
            idle: Arc::clone(&self.idle),
        }
    }
}

impl<C> IdleConnections<C> {
    fn new() -> Self {
        Self {
            idle: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    fn put_back(&self, conn: C) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }
}

#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    commands: MultiplexedConnection,
    blocking: IdleConnections<MultiplexedConnection>,
    stream_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

impl core::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

fn connection_error(err: redis::RedisError) -> QueueError {
    QueueError::Connection(err.to_string())
}

fn command_error(command: &str, err: redis::RedisError) -> QueueError {
    QueueError::Command(format!("{command}: {err}"))
}

impl RedisQueue {
    /// Connect and make sure the stream and consumer group exist.
    pub async fn connect(
        redis_url: &str,
        stream_key: impl Into<String>,
        group: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(connection_error)?;
        let commands = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connection_error)?;
        let stream_key = stream_key.into();

        let queue = Self {
            client,
            commands,
            blocking: IdleConnections::new(),
            delayed_key: format!("{stream_key}:delayed"),
            stream_key,
            group: group.into(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            visibility_timeout,
        };
        queue.ensure_consumer_group().await;
        Ok(queue)
    }

    async fn ensure_consumer_group(&self) {
        let mut conn = self.commands.clone();
        // BUSYGROUP when it already exists
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        if let Err(err) = created {
            debug!(stream = %self.stream_key, group = %self.group, error = %err, "consumer group not created");
        }
    }

    async fn xadd(
        &self,
        conn: &mut MultiplexedConnection,
        body: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let attributes = serde_json::to_string(attributes)
            .map_err(|e| QueueError::Command(format!("XADD: {e}")))?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("body")
            .arg(body)
            .arg("attributes")
            .arg(attributes)
            .query_async(conn)
            .await
            .map_err(|e| command_error("XADD", e))?;
        Ok(())
    }

    /// Move due delayed messages onto the stream.
    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.commands.clone();
        let now_ms = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZRANGEBYSCORE", e))?;

        let mut promoted = 0;
        for member in due {
            // another consumer may have promoted it already
            let removed: u64 = redis::cmd("ZREM")
                .arg(&self.delayed_key)
                .arg(&member)
                .query_async(&mut conn)
                .await
                .map_err(|e| command_error("ZREM", e))?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<DelayedMessage>(&member) {
                Ok(message) => {
                    self.xadd(&mut conn, &message.body, &message.attributes)
                        .await?;
                    promoted += 1;
                }
                Err(err) => warn!(error = %err, "dropping unreadable delayed message"),
            }
        }
        Ok(promoted)
    }

    async fn reclaim(&self, max: usize) -> Result<Vec<QueueMessage>, QueueError> {
        let mut conn = self.commands.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XAUTOCLAIM", e))?;

        // [next-cursor, [entries...], (deleted ids...)]
        let entries = match reply {
            Value::Bulk(mut parts) if parts.len() >= 2 => parts.swap_remove(1),
            _ => return Ok(Vec::new()),
        };
        Ok(parse_entries(&entries, 2))
    }

    async fn read_new(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        // BLOCK would stall the shared multiplexed connection
        let mut conn = match self.blocking.take() {
            Some(conn) => conn,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(connection_error)?,
        };
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max);
        // BLOCK 0 blocks forever
        if !wait.is_zero() {
            cmd.arg("BLOCK").arg(wait.as_millis().max(1) as u64);
        }
        let reply: Value = cmd
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XREADGROUP", e))?;
        self.blocking.put_back(conn);

        // [[stream, [entries...]]] or nil on timeout
        let Value::Bulk(streams) = reply else {
            return Ok(Vec::new());
        };
        let mut messages = Vec::new();
        for stream in &streams {
            if let Value::Bulk(pair) = stream {
                if let Some(entries) = pair.get(1) {
                    messages.extend(parse_entries(entries, 1));
                }
            }
        }
        Ok(messages)
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[[id, [field, value, ...]], ...]`, skipping entries deleted since
/// they were delivered.
fn parse_entries(entries: &Value, delivery_count: u32) -> Vec<QueueMessage> {
    let Value::Bulk(entries) = entries else {
        return Vec::new();
    };
    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let Value::Bulk(parts) = entry else { continue };
        let (Some(id), Some(Value::Bulk(fields))) = (parts.first().and_then(value_to_string), parts.get(1))
        else {
            continue;
        };

        let mut body = None;
        let mut attributes = HashMap::new();
        for chunk in fields.chunks(2) {
            if let [key, value] = chunk {
                match (value_to_string(key).as_deref(), value_to_string(value)) {
                    (Some("body"), Some(v)) => body = Some(v),
                    (Some("attributes"), Some(v)) => {
                        attributes = serde_json::from_str(&v).unwrap_or_default();
                    }
                    _ => {}
                }
            }
        }

        match body {
            Some(body) => messages.push(QueueMessage {
                receipt: id,
                body,
                attributes,
                delivery_count,
            }),
            None => warn!(entry_id = %id, "stream entry without body"),
        }
    }
    messages
}

#[async_trait]
impl MessageQueue for RedisQueue {
    #[instrument(skip(self), fields(stream = %self.stream_key, consumer = %self.consumer), err)]
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        self.promote_due().await?;

        let mut messages = self.reclaim(max).await?;
        if messages.len() < max {
            let wait = if messages.is_empty() { wait } else { Duration::ZERO };
            let fresh = self.read_new(max - messages.len(), wait).await?;
            messages.extend(fresh);
        }
        Ok(messages)
    }

    #[instrument(skip(self), fields(stream = %self.stream_key), err)]
    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XACK", e))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(receipt)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("XDEL", e))?;
        if acked == 0 {
            return Err(QueueError::UnknownReceipt(receipt.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(stream = %self.stream_key, delay_ms = message.delay.as_millis() as u64), err)]
    async fn send(&self, message: OutgoingMessage) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        if message.delay.is_zero() {
            return self.xadd(&mut conn, &message.body, &message.attributes).await;
        }

        let due_ms = Utc::now().timestamp_millis() + message.delay.as_millis() as i64;
        let member = serde_json::to_string(&DelayedMessage {
            id: Uuid::now_v7(),
            body: message.body,
            attributes: message.attributes,
        })
        .map_err(|e| QueueError::Command(format!("ZADD: {e}")))?;
        let _: u64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(due_ms)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| command_error("ZADD", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn idle_connections_are_reused_across_clones() {
        let pool = IdleConnections::new();
        let shared = pool.clone();
        assert_eq!(pool.take(), None::<u32>);

        pool.put_back(1);
        pool.put_back(2);

        assert_eq!(shared.take(), Some(2));
        assert_eq!(pool.take(), Some(1));
        assert_eq!(shared.take(), None);
    }

    #[test]
    fn parses_stream_entries_and_skips_deleted_ones() {
        let entries = Value::Bulk(vec![
            Value::Bulk(vec![
                data("1700000000000-0"),
                Value::Bulk(vec![
                    data("body"),
                    data(r#"{"name":"Initialized"}"#),
                    data("attributes"),
                    data(r#"{"domain":"acme"}"#),
                ]),
            ]),
            Value::Bulk(vec![data("1700000000001-0"), Value::Nil]),
        ]);

        let messages = parse_entries(&entries, 1);

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receipt, "1700000000000-0");
        assert_eq!(messages[0].body, r#"{"name":"Initialized"}"#);
        assert_eq!(messages[0].attributes["domain"], "acme");
        assert_eq!(messages[0].delivery_count, 1);
    }
}
