// NATS JetStream message bus
// Queues become subjects of one stream; receivers are durable pull consumers

//! # NATS Message Bus
//!
//! [`NatsBus`] implements [`MessageServer`] on top of JetStream so instances
//! in different processes can exchange messages.
//!
//! ## Subject Hierarchy
//!
//! - stream `<stream>` captures `<prefix>.>`
//! - `put` publishes the JSON [`Envelope`] on `<prefix>.<queue>`
//! - `get` reads through a durable pull consumer named after the receiver
//!   and the queue, filtered to `<prefix>.<queue>`. The consumer remembers
//!   what it acknowledged, which gives the per-receiver cursor.
//!
//! ## Lazy Connection
//!
//! The client connects on first use and keeps the JetStream context in a
//! `tokio::sync::OnceCell`; building a `NatsBus` never touches the network.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream, Context};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

use super::bus::{Envelope, MessageServer, ServiceBus, STREAM_BUFFER};
use crate::config::NatsSettings;
use crate::models::{Id, Message};
use crate::Result;

struct NatsInner {
    settings: NatsSettings,
    jetstream: OnceCell<Context>,
}

/// JetStream-backed message bus; clones share one connection
#[derive(Clone)]
pub struct NatsBus {
    inner: Arc<NatsInner>,
}

impl NatsBus {
    pub fn new(settings: NatsSettings) -> Self {
        NatsBus {
            inner: Arc::new(NatsInner {
                settings,
                jetstream: OnceCell::new(),
            }),
        }
    }

    pub fn settings(&self) -> &NatsSettings {
        &self.inner.settings
    }

    /// Connect once and make sure the stream exists
    async fn context(&self) -> Result<&Context> {
        let settings = &self.inner.settings;
        self.inner
            .jetstream
            .get_or_try_init(|| async {
                let client = async_nats::connect(settings.url.as_str())
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to connect to NATS at {}: {}", settings.url, e))?;
                let js = jetstream::new(client);

                let stream_config = stream::Config {
                    name: settings.stream.clone(),
                    subjects: vec![format!("{}.>", settings.subject_prefix)],
                    storage: stream::StorageType::File,
                    retention: stream::RetentionPolicy::Limits,
                    discard: stream::DiscardPolicy::Old,
                    max_age: Duration::from_secs(7 * 24 * 60 * 60),
                    duplicate_window: Duration::from_secs(120),
                    ..Default::default()
                };
                js.get_or_create_stream(stream_config)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to create stream {}: {}", settings.stream, e))?;

                info!(url = %settings.url, stream = %settings.stream, "connected to NATS message bus");
                Ok::<Context, crate::ThresherError>(js)
            })
            .await
    }

    pub fn subject(&self, queue: &str) -> String {
        format!("{}.{}", self.inner.settings.subject_prefix, subject_token(queue))
    }
}

/// Replace characters NATS reserves in subject tokens
fn subject_token(queue: &str) -> String {
    queue
        .chars()
        .map(|c| match c {
            ' ' | '*' | '>' | '\t' => '_',
            c => c,
        })
        .collect()
}

/// Durable consumer names allow only `[A-Za-z0-9_-]`
fn consumer_name(receiver: Id, queue: &str) -> String {
    let queue: String = queue
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("rx_{}_{}", receiver.as_uuid().simple(), queue)
}

#[async_trait]
impl MessageServer for NatsBus {
    async fn put(&self, producer: Id, queue: &str, message: &Message) -> Result<()> {
        let js = self.context().await?;
        let envelope = Envelope::seal(producer, queue, message)?;
        let subject = self.subject(queue);
        let payload = serde_json::to_vec(&envelope)?;

        let ack = js
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to publish to {}: {}", subject, e))?;
        ack.await
            .map_err(|e| anyhow::anyhow!("Publish to {} was not acknowledged: {}", subject, e))?;

        debug!(subject = %subject, message = %message.name, "envelope published");
        Ok(())
    }

    async fn get(&self, receiver: Id, queue: &str, wait: Duration) -> Result<mpsc::Receiver<Envelope>> {
        let js = self.context().await?;
        let subject = self.subject(queue);
        let name = consumer_name(receiver, queue);

        let stream = js
            .get_stream(&self.inner.settings.stream)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open stream: {}", e))?;
        let consumer = stream
            .get_or_create_consumer(
                &name,
                consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: subject.clone(),
                    deliver_policy: consumer::DeliverPolicy::All,
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create consumer {}: {}", name, e))?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open consumer {}: {}", name, e))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                let next = match tokio::time::timeout(wait, messages.next()).await {
                    Ok(Some(Ok(msg))) => msg,
                    Ok(Some(Err(e))) => {
                        warn!(consumer = %name, error = %e, "consumer error, closing stream");
                        return;
                    }
                    Ok(None) | Err(_) => {
                        debug!(consumer = %name, "stream idle, closing");
                        return;
                    }
                };

                let envelope = match serde_json::from_slice::<Envelope>(&next.payload) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(consumer = %name, error = %e, "skipping undecodable envelope");
                        let _ = next.ack().await;
                        continue;
                    }
                };
                if let Err(e) = next.ack().await {
                    warn!(consumer = %name, error = %e, "failed to ack envelope");
                }
                if tx.send(envelope).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl ServiceBus for NatsBus {
    async fn message_server(&self) -> Result<Arc<dyn MessageServer>> {
        self.context().await?;
        Ok(Arc::new(self.clone()))
    }
}
