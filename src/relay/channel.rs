//! Realtime publish/subscribe transports used by the signaling relay
//!
//! A channel delivers opaque payloads to every subscriber of a key. Delivery is
//! at-least-once and unordered as far as the relay is concerned; ordering and
//! deduplication happen in [`RelaySubscription`](crate::relay::RelaySubscription).

use crate::error::{MatchError, Result};
use amqprs::{
    channel::{
        BasicCancelArguments, BasicConsumeArguments, BasicPublishArguments, Channel,
        ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Payload stream type carried by a subscription
pub type PayloadStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Publish/subscribe transport keyed by string
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    /// Publish a payload to every current subscriber of `key`
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Start receiving payloads published under `key`
    async fn subscribe(&self, key: &str) -> Result<ChannelSubscription>;
}

/// A live subscription; dropping it releases the transport listener
pub struct ChannelSubscription {
    stream: PayloadStream,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ChannelSubscription {
    pub fn new(stream: PayloadStream) -> Self {
        Self {
            stream,
            release: None,
        }
    }

    /// Attach a hook run once when the subscription is dropped
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Next payload; `None` once the transport closed the subscription
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.stream.next().await
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("has_release_hook", &self.release.is_some())
            .finish()
    }
}

type SubscriberMap = HashMap<String, Vec<Subscriber>>;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// In-process fan-out channel
#[derive(Default)]
pub struct InMemoryChannel {
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_id: AtomicU64,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open subscriptions on `key`
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| {
                subscribers
                    .get(key)
                    .map(|senders| senders.iter().filter(|s| !s.tx.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    /// Number of keys with at least one registered subscriber
    pub fn key_count(&self) -> usize {
        self.subscribers
            .read()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

/// Drop subscriber `id` and any closed senders under `key`, forgetting the key once empty
fn release_subscriber(subscribers: &RwLock<SubscriberMap>, key: &str, id: u64) {
    let Ok(mut subscribers) = subscribers.write() else {
        warn!("Channel subscribers lock poisoned, {} not released", key);
        return;
    };
    if let Some(senders) = subscribers.get_mut(key) {
        senders.retain(|s| s.id != id && !s.tx.is_closed());
        if senders.is_empty() {
            subscribers.remove(key);
            debug!("Released last subscriber of {}", key);
        }
    }
}

#[async_trait]
impl RealtimeChannel for InMemoryChannel {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let mut subscribers = self
            .subscribers
            .write()
            .map_err(|_| MatchError::lock_poisoned("channel subscribers"))?;

        if let Some(senders) = subscribers.get_mut(key) {
            senders.retain(|s| s.tx.send(payload.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(key);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<ChannelSubscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .map_err(|_| MatchError::lock_poisoned("channel subscribers"))?
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        let subscribers = Arc::downgrade(&self.subscribers);
        let key = key.to_string();
        Ok(
            ChannelSubscription::new(Box::pin(UnboundedReceiverStream::new(rx))).on_release(
                move || {
                    if let Some(subscribers) = subscribers.upgrade() {
                        release_subscriber(&subscribers, &key, id);
                    }
                },
            ),
        )
    }
}

/// Realtime channel over an AMQP topic exchange
///
/// Each subscription gets its own exclusive, auto-deleted, server-named queue
/// bound to the exchange with the subscription key.
pub struct AmqpRealtimeChannel {
    channel: Channel,
    exchange: String,
}

impl AmqpRealtimeChannel {
    /// Wrap an AMQP channel and declare the signals exchange
    pub async fn new(channel: Channel, exchange: &str) -> Result<Self> {
        let args = ExchangeDeclareArguments::new(exchange, "topic");
        channel
            .exchange_declare(args)
            .await
            .map_err(|e| MatchError::AmqpConnectionFailed {
                message: format!("Failed to declare signals exchange {}: {}", exchange, e),
            })?;

        info!("Realtime channel using exchange {}", exchange);
        Ok(Self {
            channel,
            exchange: exchange.to_string(),
        })
    }
}

#[async_trait]
impl RealtimeChannel for AmqpRealtimeChannel {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let args = BasicPublishArguments::new(&self.exchange, key);
        let mut properties = BasicProperties::default();
        properties.with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchError::ChannelFailed {
                message: format!("Failed to publish to {}: {}", key, e),
            })?;
        Ok(())
    }

    async fn subscribe(&self, key: &str) -> Result<ChannelSubscription> {
        let declare = QueueDeclareArguments::default()
            .exclusive(true)
            .auto_delete(true)
            .finish();
        let (queue, _, _) = self
            .channel
            .queue_declare(declare)
            .await
            .map_err(|e| MatchError::ChannelFailed {
                message: format!("Failed to declare subscription queue: {}", e),
            })?
            .ok_or_else(|| MatchError::ChannelFailed {
                message: "Broker did not return a queue name".to_string(),
            })?;

        self.channel
            .queue_bind(QueueBindArguments::new(&queue, &self.exchange, key))
            .await
            .map_err(|e| MatchError::ChannelFailed {
                message: format!("Failed to bind {} to {}: {}", queue, key, e),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer_tag = format!("relay-{}", uuid::Uuid::new_v4());
        let args = BasicConsumeArguments::new(&queue, &consumer_tag)
            .manual_ack(false)
            .finish();
        self.channel
            .basic_consume(ForwardingConsumer { tx }, args)
            .await
            .map_err(|e| MatchError::ChannelFailed {
                message: format!("Failed to consume {}: {}", queue, e),
            })?;

        debug!("Subscribed queue {} to {} ({})", queue, key, consumer_tag);

        let channel = self.channel.clone();
        Ok(
            ChannelSubscription::new(Box::pin(UnboundedReceiverStream::new(rx))).on_release(
                move || {
                    // The auto-delete queue goes away with its last consumer
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            if let Err(e) = channel
                                .basic_cancel(BasicCancelArguments::new(&consumer_tag))
                                .await
                            {
                                warn!("Failed to cancel relay consumer {}: {}", consumer_tag, e);
                            }
                        });
                    }
                },
            ),
        )
    }
}

/// Forwards deliveries into the subscription's stream
struct ForwardingConsumer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl AsyncConsumer for ForwardingConsumer {
    async fn consume(
        &mut self,
        _channel: &Channel,
        _deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        if self.tx.send(content).is_err() {
            debug!("Relay subscription dropped, discarding delivery");
        }
    }
}
