//! AMQP event publisher for outbound matchmaking events

use crate::amqp::messages::{MessageEnvelope, MessageUtils, MATCH_EVENTS_EXCHANGE};
use crate::error::{MatchError, Result};
use crate::types::*;
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Trait for publishing matchmaking events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a UserQueued event
    async fn publish_user_queued(&self, event: UserQueued) -> Result<()>;

    /// Publish a SessionMatched event
    async fn publish_session_matched(&self, event: SessionMatched) -> Result<()>;

    /// Publish a SessionActivated event
    async fn publish_session_activated(&self, event: SessionActivated) -> Result<()>;

    /// Publish a SessionEnded event
    async fn publish_session_ended(&self, event: SessionEnded) -> Result<()>;
}

/// Configuration for event publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
    /// Number of recently published correlation ids remembered
    pub dedup_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: MATCH_EVENTS_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
            dedup_capacity: 10_000,
        }
    }
}

#[derive(Default)]
struct PublishedIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl PublishedIds {
    fn insert(&mut self, id: String, capacity: usize) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// AMQP-based event publisher implementation
pub struct AmqpEventPublisher {
    channel: Channel,
    config: PublisherConfig,
    published_messages: std::sync::Mutex<PublishedIds>,
}

impl AmqpEventPublisher {
    /// Create a new event publisher and declare its exchange
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let publisher = Self {
            channel,
            config,
            published_messages: std::sync::Mutex::new(PublishedIds::default()),
        };

        publisher.setup_exchange().await?;

        Ok(publisher)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange, "topic")
            .durable(true)
            .finish();
        self.channel
            .exchange_declare(args)
            .await
            .map_err(|e| MatchError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare events exchange {}: {}",
                    self.config.exchange, e
                ),
            })?;

        info!("Declared match events exchange {}", self.config.exchange);
        Ok(())
    }

    async fn publish_event(&self, event: MatchmakingEvent) -> Result<()> {
        let routing_key = MessageUtils::get_routing_key(&event);
        let envelope = MessageEnvelope::new(event, routing_key.to_string());
        self.publish_with_retry(&envelope).await
    }

    /// Publish with retry and exponential backoff
    async fn publish_with_retry(&self, envelope: &MessageEnvelope<MatchmakingEvent>) -> Result<()> {
        if self.config.enable_deduplication {
            let published = self
                .published_messages
                .lock()
                .map_err(|_| MatchError::lock_poisoned("published messages"))?;
            if published.ids.contains(&envelope.correlation_id) {
                debug!(
                    "Message {} already published, skipping",
                    envelope.correlation_id
                );
                return Ok(());
            }
        }

        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(_) => {
                    if self.config.enable_deduplication {
                        let mut published = self
                            .published_messages
                            .lock()
                            .map_err(|_| MatchError::lock_poisoned("published messages"))?;
                        published.insert(
                            envelope.correlation_id.clone(),
                            self.config.dedup_capacity,
                        );
                    }

                    debug!(
                        "Published {} as {} to exchange {}",
                        envelope.routing_key, envelope.correlation_id, self.config.exchange
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    /// Single publish attempt
    async fn try_publish(&self, envelope: &MessageEnvelope<MatchmakingEvent>) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.config.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| MatchError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    /// Number of cached message IDs (for monitoring)
    pub fn cached_message_count(&self) -> usize {
        self.published_messages
            .lock()
            .map(|cache| cache.ids.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventPublisher for AmqpEventPublisher {
    async fn publish_user_queued(&self, event: UserQueued) -> Result<()> {
        self.publish_event(MatchmakingEvent::UserQueued(event)).await
    }

    async fn publish_session_matched(&self, event: SessionMatched) -> Result<()> {
        self.publish_event(MatchmakingEvent::SessionMatched(event))
            .await
    }

    async fn publish_session_activated(&self, event: SessionActivated) -> Result<()> {
        self.publish_event(MatchmakingEvent::SessionActivated(event))
            .await
    }

    async fn publish_session_ended(&self, event: SessionEnded) -> Result<()> {
        self.publish_event(MatchmakingEvent::SessionEnded(event))
            .await
    }
}

/// Mock event publisher that records everything, for tests and simulations
#[derive(Debug, Default)]
pub struct MockEventPublisher {
    published_events: std::sync::Mutex<Vec<MatchmakingEvent>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all published event types, in order
    pub fn get_published_events(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|event| {
                match event {
                    MatchmakingEvent::UserQueued(_) => "UserQueued",
                    MatchmakingEvent::SessionMatched(_) => "SessionMatched",
                    MatchmakingEvent::SessionActivated(_) => "SessionActivated",
                    MatchmakingEvent::SessionEnded(_) => "SessionEnded",
                }
                .to_string()
            })
            .collect()
    }

    /// All published events, in order
    pub fn events(&self) -> Vec<MatchmakingEvent> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Ok(mut events) = self.published_events.lock() {
            events.clear();
        }
    }

    fn record(&self, event: MatchmakingEvent) {
        if let Ok(mut events) = self.published_events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish_user_queued(&self, event: UserQueued) -> Result<()> {
        self.record(MatchmakingEvent::UserQueued(event));
        Ok(())
    }

    async fn publish_session_matched(&self, event: SessionMatched) -> Result<()> {
        self.record(MatchmakingEvent::SessionMatched(event));
        Ok(())
    }

    async fn publish_session_activated(&self, event: SessionActivated) -> Result<()> {
        self.record(MatchmakingEvent::SessionActivated(event));
        Ok(())
    }

    async fn publish_session_ended(&self, event: SessionEnded) -> Result<()> {
        self.record(MatchmakingEvent::SessionEnded(event));
        Ok(())
    }
}

/// Publisher for broker-less runs: events only go to the log
#[derive(Debug, Default)]
pub struct LoggingEventPublisher;

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self
    }

    fn log(&self, event: &MatchmakingEvent) {
        debug!(
            "Event {} (not published, AMQP disabled): {:?}",
            MessageUtils::get_routing_key(event),
            event
        );
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish_user_queued(&self, event: UserQueued) -> Result<()> {
        self.log(&MatchmakingEvent::UserQueued(event));
        Ok(())
    }

    async fn publish_session_matched(&self, event: SessionMatched) -> Result<()> {
        self.log(&MatchmakingEvent::SessionMatched(event));
        Ok(())
    }

    async fn publish_session_activated(&self, event: SessionActivated) -> Result<()> {
        self.log(&MatchmakingEvent::SessionActivated(event));
        Ok(())
    }

    async fn publish_session_ended(&self, event: SessionEnded) -> Result<()> {
        self.log(&MatchmakingEvent::SessionEnded(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.exchange, MATCH_EVENTS_EXCHANGE);
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_deduplication);
    }

    #[test]
    fn test_published_ids_are_bounded() {
        let mut published = PublishedIds::default();
        for i in 0..5 {
            published.insert(format!("id-{}", i), 3);
        }
        assert_eq!(published.ids.len(), 3);
        assert!(!published.ids.contains("id-0"));
        assert!(published.ids.contains("id-4"));

        // Re-inserting a known id does not grow the cache
        published.insert("id-4".to_string(), 3);
        assert_eq!(published.order.len(), 3);
    }

    #[tokio::test]
    async fn test_mock_publisher_records_in_order() {
        let publisher = MockEventPublisher::new();
        publisher
            .publish_user_queued(UserQueued {
                user_id: "alice".to_string(),
                searching: 1,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
        publisher
            .publish_session_ended(SessionEnded {
                session_id: uuid::Uuid::new_v4(),
                participant_ids: vec![],
                ended_by: None,
                reason: EndReason::Abandoned,
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();

        assert_eq!(
            publisher.get_published_events(),
            vec!["UserQueued", "SessionEnded"]
        );

        publisher.clear_events();
        assert!(publisher.events().is_empty());
    }
}
