//! AMQP consumer for remote search commands
//!
//! Front ends that are not in-process publish [`SearchCommand`]s to the
//! command queue; the consumer validates them and hands them to a
//! [`MessageHandler`].

use crate::amqp::messages::MessageUtils;
use crate::error::{MatchError, Result};
use crate::metrics::MetricsCollector;
use crate::types::SearchCommand;
use amqprs::{
    channel::{BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, Channel},
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Trait defining the interface for handling AMQP messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle a search command from a remote client
    async fn handle_search_command(&self, command: SearchCommand) -> Result<()>;

    /// Handle a message that could not be processed
    async fn handle_error(&self, error: &anyhow::Error, message_data: &[u8]);
}

/// Consumer for the search command queue
pub struct SearchCommandConsumer {
    handler: Arc<dyn MessageHandler>,
    channel: Channel,
    consumer_tag: String,
    metrics_collector: Option<Arc<MetricsCollector>>,
}

impl SearchCommandConsumer {
    pub fn new(handler: Arc<dyn MessageHandler>, channel: Channel) -> Self {
        let consumer_tag = format!("search-consumer-{}", uuid::Uuid::new_v4());

        Self {
            handler,
            channel,
            consumer_tag,
            metrics_collector: None,
        }
    }

    pub fn with_metrics(mut self, metrics_collector: Arc<MetricsCollector>) -> Self {
        self.metrics_collector = Some(metrics_collector);
        self
    }

    /// Start consuming messages from the queue
    pub async fn start_consuming(&self, queue_name: &str) -> Result<()> {
        let args = BasicConsumeArguments::new(queue_name, &self.consumer_tag)
            .manual_ack(true)
            .finish();

        self.channel
            .basic_consume(
                CommandConsumer {
                    handler: self.handler.clone(),
                    metrics_collector: self.metrics_collector.clone(),
                },
                args,
            )
            .await
            .map_err(|e| MatchError::AmqpConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Started consuming search commands from {}", queue_name);
        Ok(())
    }

    /// Stop consuming messages
    pub async fn stop_consuming(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);

        self.channel.basic_cancel(args).await.map_err(|e| {
            MatchError::AmqpConnectionFailed {
                message: format!("Failed to stop consuming: {}", e),
            }
        })?;

        info!("Stopped consuming search commands");
        Ok(())
    }
}

struct CommandConsumer {
    handler: Arc<dyn MessageHandler>,
    metrics_collector: Option<Arc<MetricsCollector>>,
}

#[async_trait]
impl AsyncConsumer for CommandConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();
        debug!(
            "Search command received - delivery_tag: {}, size: {} bytes",
            delivery_tag,
            content.len()
        );

        let started = Instant::now();
        let result = self.process_message(&content).await;
        let elapsed = started.elapsed();

        if let Some(metrics) = &self.metrics_collector {
            metrics.record_amqp_operation("consume", result.is_ok(), elapsed);
            metrics.record_command_processed(elapsed);
        }

        match &result {
            Ok(()) => debug!(
                "Search command {} processed in {:.2}ms",
                delivery_tag,
                elapsed.as_secs_f64() * 1000.0
            ),
            Err(e) => {
                error!("Search command {} failed: {}", delivery_tag, e);
                self.handler.handle_error(e, &content).await;
            }
        }

        // Failed commands are not redelivered; the client retries on its own
        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            warn!("Failed to ack search command {}: {}", delivery_tag, e);
        }
    }
}

impl CommandConsumer {
    async fn process_message(&self, content: &[u8]) -> Result<()> {
        let command = MessageUtils::deserialize_search_command(content)?;
        MessageUtils::validate_search_command(&command)?;

        debug!(
            "Search command parsed - user: '{}', action: {:?}",
            command.user_id, command.action
        );
        self.handler.handle_search_command(command).await
    }
}

/// Message handler that records commands, for tests
#[derive(Default)]
pub struct MockMessageHandler {
    pub received_commands: Arc<tokio::sync::Mutex<Vec<SearchCommand>>>,
    pub errors: Arc<tokio::sync::Mutex<Vec<String>>>,
}

impl MockMessageHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageHandler for MockMessageHandler {
    async fn handle_search_command(&self, command: SearchCommand) -> Result<()> {
        self.received_commands.lock().await.push(command);
        Ok(())
    }

    async fn handle_error(&self, error: &anyhow::Error, _message_data: &[u8]) {
        self.errors.lock().await.push(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SearchAction, SearchFilters};
    use crate::utils::current_timestamp;

    fn consumer(handler: Arc<MockMessageHandler>) -> CommandConsumer {
        CommandConsumer {
            handler,
            metrics_collector: None,
        }
    }

    #[tokio::test]
    async fn test_valid_command_reaches_handler() {
        let handler = Arc::new(MockMessageHandler::new());
        let command = SearchCommand {
            user_id: "alice".to_string(),
            action: SearchAction::Start,
            filters: Some(SearchFilters::any()),
            session_id: None,
            signal: None,
            payload: None,
            timestamp: current_timestamp(),
        };
        let bytes = MessageUtils::serialize_search_command(&command).unwrap();

        consumer(handler.clone())
            .process_message(&bytes)
            .await
            .unwrap();

        let received = handler.received_commands.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].user_id, "alice");
    }

    #[tokio::test]
    async fn test_invalid_commands_are_rejected() {
        let handler = Arc::new(MockMessageHandler::new());
        let consumer = consumer(handler.clone());

        assert!(consumer.process_message(b"not json").await.is_err());

        let end_without_session = SearchCommand {
            user_id: "alice".to_string(),
            action: SearchAction::End,
            filters: None,
            session_id: None,
            signal: None,
            payload: None,
            timestamp: current_timestamp(),
        };
        // Encoded directly so the consumer's validation is what rejects it
        let bytes = serde_json::to_vec(&end_without_session).unwrap();
        let err = consumer.process_message(&bytes).await.unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::InvalidCommand { .. })
        ));

        assert!(handler.received_commands.lock().await.is_empty());
    }
}
