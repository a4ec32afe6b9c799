// Message bus - the queue service send and receive tasks talk to

//! # Message Bus
//!
//! Send and receive tasks never talk to each other directly. A send task
//! puts an [`Envelope`] on a named queue; a receive task asks the bus for a
//! stream of envelopes on that queue under its own receiver identity.
//!
//! - [`ServiceBus`] hands out the [`MessageServer`] an environment uses
//! - [`MessageServer::put`] appends a message to a queue
//! - [`MessageServer::get`] streams undelivered envelopes for one receiver,
//!   closing the stream after `wait` passes without traffic
//!
//! The engine never closes a stream itself: a receiver that found its
//! message keeps draining until the bus closes the channel.
//!
//! ## Rust Learning Notes:
//!
//! ### Trait Objects Behind `Arc`
//! Environments hold an `Arc<dyn ServiceBus>`, so the in-memory bus used by
//! tests and the NATS bus used in deployments are interchangeable at
//! runtime. `async_trait` makes async methods usable on trait objects.
//!
//! ### `Notify` for Wake-ups
//! The in-memory bus registers interest in a queue's `Notify` *before* it
//! reads the log. A `put` that lands between the read and the wait still
//! wakes the reader, so no envelope is ever missed.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::models::{Id, Message};
use crate::Result;

/// Buffer size of the channel returned by `get`
pub const STREAM_BUFFER: usize = 64;

/// One message on a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Id,
    /// Id of the instance that put the message
    pub producer: Id,
    pub queue: String,
    /// Message name, checked by receivers before decoding the body
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Canonical JSON form of the message
    pub body: Vec<u8>,
}

impl Envelope {
    /// Wrap a message for `queue`
    pub fn seal(producer: Id, queue: &str, message: &Message) -> Result<Self> {
        Ok(Envelope {
            id: message.id,
            producer,
            queue: queue.to_string(),
            name: message.name.clone(),
            created_at: Utc::now(),
            body: message.to_envelope()?,
        })
    }

    /// Decode the message carried in the body
    pub fn open(&self) -> Result<Message> {
        Message::from_envelope(&self.body)
    }
}

/// Queue operations
#[async_trait]
pub trait MessageServer: Send + Sync {
    /// Append `message` to `queue` on behalf of `producer`
    async fn put(&self, producer: Id, queue: &str, message: &Message) -> Result<()>;

    /// Stream envelopes of `queue` not yet delivered to `receiver`
    ///
    /// The channel closes once `wait` elapses without a new envelope.
    async fn get(&self, receiver: Id, queue: &str, wait: Duration) -> Result<mpsc::Receiver<Envelope>>;
}

/// Handle to the external message service
#[async_trait]
pub trait ServiceBus: Send + Sync {
    async fn message_server(&self) -> Result<Arc<dyn MessageServer>>;
}

#[derive(Default)]
struct Queue {
    log: RwLock<Vec<Envelope>>,
    notify: Notify,
}

#[derive(Default)]
struct MemoryServer {
    queues: DashMap<String, Arc<Queue>>,
    cursors: DashMap<(Id, String), usize>,
}

impl MemoryServer {
    fn queue(&self, name: &str) -> Arc<Queue> {
        self.queues.entry(name.to_string()).or_default().clone()
    }

    /// Take every envelope past the receiver's cursor and advance it
    fn take_pending(&self, receiver: Id, queue_name: &str, queue: &Queue) -> Vec<Envelope> {
        let mut cursor = self.cursors.entry((receiver, queue_name.to_string())).or_insert(0);
        let log = queue.log.read().unwrap_or_else(PoisonError::into_inner);
        let pending = log[(*cursor).min(log.len())..].to_vec();
        *cursor = log.len();
        pending
    }
}

/// In-process message bus
///
/// Each queue is an append-only log; every receiver has its own cursor per
/// queue, so two receivers each see every message once. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    server: Arc<MemoryServer>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of envelopes ever put on `queue`
    pub fn queue_len(&self, queue: &str) -> usize {
        self.server
            .queues
            .get(queue)
            .map(|q| q.log.read().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageServer for InMemoryBus {
    async fn put(&self, producer: Id, queue: &str, message: &Message) -> Result<()> {
        let envelope = Envelope::seal(producer, queue, message)?;
        let q = self.server.queue(queue);
        {
            let mut log = q.log.write().unwrap_or_else(PoisonError::into_inner);
            log.push(envelope);
        }
        q.notify.notify_waiters();
        trace!(queue = %queue, message = %message.name, producer = %producer.last(8), "envelope queued");
        Ok(())
    }

    async fn get(&self, receiver: Id, queue: &str, wait: Duration) -> Result<mpsc::Receiver<Envelope>> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let q = self.server.queue(queue);
        let queue_name = queue.to_string();
        let server = self.server.clone();

        tokio::spawn(async move {
            loop {
                let notified = q.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                for envelope in server.take_pending(receiver, &queue_name, &q) {
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                }

                if tokio::time::timeout(wait, notified).await.is_err() {
                    debug!(queue = %queue_name, receiver = %receiver.last(8), "stream idle, closing");
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl ServiceBus for InMemoryBus {
    async fn message_server(&self) -> Result<Arc<dyn MessageServer>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageDirection, MessageVariable, Variable};

    fn letter(x: i64) -> Message {
        Message::new(
            "letter",
            MessageDirection::Outgoing,
            vec![MessageVariable::required(Variable::int("x", x))],
        )
    }

    #[tokio::test]
    async fn test_get_streams_backlog_then_closes() {
        let bus = InMemoryBus::new();
        let producer = Id::new();
        bus.put(producer, "Q", &letter(1)).await.unwrap();
        bus.put(producer, "Q", &letter(2)).await.unwrap();

        let mut rx = bus.get(Id::new(), "Q", Duration::from_millis(50)).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.open().unwrap().vars[0].variable.int_value().unwrap(), 1);
        assert_eq!(second.producer, producer);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cursor_is_per_receiver() {
        let bus = InMemoryBus::new();
        bus.put(Id::new(), "Q", &letter(7)).await.unwrap();

        let receiver = Id::new();
        let mut rx = bus.get(receiver, "Q", Duration::from_millis(30)).await.unwrap();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());

        let mut again = bus.get(receiver, "Q", Duration::from_millis(30)).await.unwrap();
        assert!(again.recv().await.is_none());

        let mut other = bus.get(Id::new(), "Q", Duration::from_millis(30)).await.unwrap();
        assert!(other.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_late_put_wakes_receiver() {
        let bus = InMemoryBus::new();
        let mut rx = bus.get(Id::new(), "late", Duration::from_secs(2)).await.unwrap();
        let writer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put(Id::new(), "late", &letter(3)).await.unwrap();
        });
        let env = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.name, "letter");
        assert_eq!(bus.queue_len("late"), 1);
    }

    #[test]
    fn test_service_bus_hands_out_shared_server() {
        let bus = InMemoryBus::new();
        let server = tokio_test::block_on(bus.message_server()).unwrap();
        tokio_test::block_on(server.put(Id::new(), "shared", &letter(4))).unwrap();
        assert_eq!(bus.queue_len("shared"), 1);
        assert_eq!(bus.queue_len("other"), 0);
    }
}
