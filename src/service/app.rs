//! Main application state and service coordination
//!
//! This module contains the production AppState that wires the matchmaker,
//! the signaling relay, the optional AMQP plumbing and the background tasks.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::{MessageHandler, SearchCommandConsumer};
use crate::amqp::publisher::{
    AmqpEventPublisher, EventPublisher, LoggingEventPublisher, PublisherConfig,
};
use crate::config::{AppConfig, RelayTransport};
use crate::error::{MatchError, Result as MatchResult};
use crate::matchmaker::{Matchmaker, MatchmakerSettings};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::relay::{AmqpRealtimeChannel, InMemoryChannel, RealtimeChannel, SignalingRelay};
use crate::service::health::{HealthCheck, HealthContext, HealthStatus};
use crate::types::{EndReason, SearchAction, SearchCommand, SessionId, SignalMessage};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Applies remote search commands to the matchmaker and relay
pub struct MatchmakerCommandHandler {
    matchmaker: Matchmaker,
    relay: Arc<SignalingRelay>,
}

impl MatchmakerCommandHandler {
    pub fn new(matchmaker: Matchmaker, relay: Arc<SignalingRelay>) -> Self {
        Self { matchmaker, relay }
    }

    async fn apply(&self, command: SearchCommand) -> MatchResult<()> {
        let user_id = command.user_id.as_str();

        match command.action {
            SearchAction::Start => {
                let filters = command.filters.unwrap_or_default();
                match self.matchmaker.enqueue(user_id, filters).await {
                    Ok(ticket) => {
                        info!(
                            "Remote search started - user: '{}', queued at {}",
                            user_id, ticket.entry.enqueued_at
                        );
                        Ok(())
                    }
                    // A redelivered start is not a failure
                    Err(e)
                        if matches!(
                            MatchError::kind_of(&e),
                            Some(MatchError::AlreadySearching { .. })
                        ) =>
                    {
                        debug!("User '{}' already searching, start ignored", user_id);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            SearchAction::Cancel => {
                if self.matchmaker.cancel(user_id).await?.is_none() {
                    debug!("Cancel for '{}' found no queue entry", user_id);
                }
                Ok(())
            }
            SearchAction::Join => {
                let session_id = required_session(&command)?;
                let outcome = self.matchmaker.join_session(session_id, user_id).await?;
                info!(
                    "Remote user '{}' joined session {} ({:?}, {})",
                    user_id,
                    session_id,
                    outcome.session.state,
                    if outcome.offerer { "offerer" } else { "answerer" }
                );
                Ok(())
            }
            SearchAction::Signal => {
                let session_id = required_session(&command)?;
                let (Some(kind), Some(payload)) = (command.signal, command.payload.clone()) else {
                    return Err(MatchError::InvalidCommand {
                        reason: "signal requires a kind and payload".to_string(),
                    }
                    .into());
                };
                let message = SignalMessage::new(session_id, user_id, kind, payload);
                self.relay.send(session_id, user_id, message).await?;
                Ok(())
            }
            SearchAction::Chat => {
                let session_id = required_session(&command)?;
                let text = command.payload.as_deref().unwrap_or_default();
                self.relay.send_chat(session_id, user_id, text).await?;
                Ok(())
            }
            SearchAction::Reveal => {
                let session_id = required_session(&command)?;
                self.relay.reveal_profile(session_id, user_id).await?;
                Ok(())
            }
            SearchAction::End => {
                let session_id = required_session(&command)?;
                self.matchmaker
                    .end_session(session_id, Some(user_id), EndReason::Hangup)
                    .await?;
                Ok(())
            }
        }
    }
}

fn required_session(command: &SearchCommand) -> MatchResult<SessionId> {
    command.session_id.ok_or_else(|| {
        MatchError::InvalidCommand {
            reason: format!("{:?} requires a session id", command.action),
        }
        .into()
    })
}

#[async_trait]
impl MessageHandler for MatchmakerCommandHandler {
    async fn handle_search_command(&self, command: SearchCommand) -> MatchResult<()> {
        let start_time = std::time::Instant::now();
        let user_id = command.user_id.clone();
        let action = command.action;

        let result = self.apply(command).await;

        let processing_time = start_time.elapsed();
        match &result {
            Ok(()) => debug!(
                "Search command applied - user: '{}', action: {:?}, time: {:.2}ms",
                user_id,
                action,
                processing_time.as_secs_f64() * 1000.0
            ),
            Err(e) => warn!(
                "Search command rejected - user: '{}', action: {:?}, error: {}",
                user_id, action, e
            ),
        }
        result
    }

    async fn handle_error(&self, error: &anyhow::Error, message_data: &[u8]) {
        error!(
            "Search command handling failed - error: '{}', message_size: {} bytes",
            error,
            message_data.len()
        );

        if !message_data.is_empty() {
            let preview_len = std::cmp::min(100, message_data.len());
            let preview = String::from_utf8_lossy(&message_data[..preview_len]);
            error!("Message preview: {:?}", preview);
        }
    }
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,

    matchmaker: Matchmaker,
    relay: Arc<SignalingRelay>,

    /// Absent when AMQP is disabled
    amqp_connection: Option<Arc<AmqpConnection>>,

    metrics_service: Arc<MetricsService>,
    health_context: Arc<HealthContext>,

    background_tasks: Vec<JoinHandle<()>>,
    command_consumer: Option<SearchCommandConsumer>,

    is_running: Arc<RwLock<bool>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Initialize the application with all dependencies
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing {} service", config.service.name);
        info!(
            "Configuration: amqp_enabled={}, relay_transport={:?}, poll_interval={:?}",
            config.amqp.enabled,
            config.relay.transport,
            config.poll_interval()
        );

        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let amqp_connection = if config.amqp.enabled {
            Some(Self::initialize_amqp(&config).await?)
        } else {
            info!("AMQP disabled - running with in-memory transport only");
            None
        };

        let publisher = Self::initialize_publisher(&config, amqp_connection.as_deref()).await?;
        let matchmaker = Matchmaker::new(
            publisher,
            metrics_collector.clone(),
            MatchmakerSettings::from_config(&config),
        );

        let channel = Self::initialize_relay_channel(&config, amqp_connection.as_deref()).await?;
        let relay = Arc::new(SignalingRelay::new(
            matchmaker.registry(),
            channel,
            metrics_collector.clone(),
            config.relay.clone(),
        ));

        let is_running = Arc::new(RwLock::new(false));
        let health_context = Arc::new(HealthContext::new(
            &config.service.name,
            matchmaker.clone(),
            amqp_connection.clone(),
            is_running.clone(),
        ));

        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.health_port,
                host: "0.0.0.0".to_string(),
            },
            metrics_collector.clone(),
        )
        .with_health_context(health_context.clone());
        let metrics_service = Arc::new(MetricsService::new(
            metrics_collector,
            Arc::new(health_server),
        ));

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self {
            config,
            matchmaker,
            relay,
            amqp_connection,
            metrics_service,
            health_context,
            background_tasks: Vec::new(),
            command_consumer: None,
            is_running,
            shutdown_tx,
        })
    }

    /// Start all background services and message consumption
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} service", self.config.service.name);

        *self.is_running.write().await = true;

        self.start_metrics_service().await?;

        if self.amqp_connection.is_some() {
            self.start_command_consumption().await?;
        }

        self.start_background_tasks();

        info!("✅ {} service started successfully", self.config.service.name);
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);

        *self.is_running.write().await = false;
        let _ = self.shutdown_tx.send(());

        if let Some(consumer) = self.command_consumer.take() {
            if let Err(e) = consumer.stop_consuming().await {
                warn!("Failed to stop search command consumer: {}", e);
            } else {
                info!("✅ Search command consumption stopped");
            }
        }

        self.stop_background_tasks().await;

        info!("Stopping metrics service...");
        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        } else {
            info!("✅ Metrics service stopped");
        }

        let final_stats = self
            .matchmaker
            .stats()
            .map_err(|e| ServiceError::BackgroundTask {
                message: format!("Failed to get final stats: {}", e),
            })?;
        info!("Final service statistics: {:?}", final_stats);

        if let Some(connection) = &self.amqp_connection {
            if let Err(e) = connection.close().await {
                warn!("Failed to close AMQP connection: {}", e);
            } else {
                info!("✅ AMQP connection closed");
            }
        }

        info!("✅ {} shutdown completed", self.config.service.name);
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn matchmaker(&self) -> Matchmaker {
        self.matchmaker.clone()
    }

    pub fn relay(&self) -> Arc<SignalingRelay> {
        self.relay.clone()
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    pub fn health_context(&self) -> Arc<HealthContext> {
        self.health_context.clone()
    }

    pub fn amqp_connection(&self) -> Option<Arc<AmqpConnection>> {
        self.amqp_connection.clone()
    }

    /// Full health report for the running service
    pub async fn health(&self) -> Result<HealthCheck> {
        HealthCheck::check(self.health_context.clone()).await
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        info!("Connecting to AMQP broker");

        let amqp_config = AmqpConfig::from_url(&config.amqp.url)
            .map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {}", e),
            })?
            .with_retry(
                config.amqp.max_retry_attempts,
                config.amqp_retry_delay(),
                config.amqp_connection_timeout(),
            );

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {}", e),
                })?;

        Ok(Arc::new(connection))
    }

    async fn initialize_publisher(
        config: &AppConfig,
        connection: Option<&AmqpConnection>,
    ) -> Result<Arc<dyn EventPublisher>, ServiceError> {
        let Some(connection) = connection else {
            return Ok(Arc::new(LoggingEventPublisher::new()));
        };

        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open publisher channel: {}", e),
            })?;
        let publisher_config = PublisherConfig {
            exchange: config.amqp.events_exchange.clone(),
            max_retries: config.amqp.max_retry_attempts,
            retry_delay_ms: config.amqp.retry_delay_ms,
            ..PublisherConfig::default()
        };
        let publisher = AmqpEventPublisher::new(channel, publisher_config)
            .await
            .map_err(|e| ServiceError::Initialization {
                message: format!("Failed to initialize event publisher: {}", e),
            })?;

        Ok(Arc::new(publisher))
    }

    async fn initialize_relay_channel(
        config: &AppConfig,
        connection: Option<&AmqpConnection>,
    ) -> Result<Arc<dyn RealtimeChannel>, ServiceError> {
        match (config.relay.transport, connection) {
            (RelayTransport::Memory, _) => {
                info!("Signaling relay using in-memory transport");
                Ok(Arc::new(InMemoryChannel::new()))
            }
            (RelayTransport::Amqp, Some(connection)) => {
                let channel =
                    connection
                        .open_channel()
                        .await
                        .map_err(|e| ServiceError::AmqpConnection {
                            message: format!("Failed to open relay channel: {}", e),
                        })?;
                let realtime = AmqpRealtimeChannel::new(channel, &config.amqp.signals_exchange)
                    .await
                    .map_err(|e| ServiceError::Initialization {
                        message: format!("Failed to initialize relay transport: {}", e),
                    })?;
                info!(
                    "Signaling relay using AMQP exchange '{}'",
                    config.amqp.signals_exchange
                );
                Ok(Arc::new(realtime))
            }
            (RelayTransport::Amqp, None) => Err(ServiceError::Configuration {
                message: "AMQP relay transport requires AMQP to be enabled".to_string(),
            }),
        }
    }

    async fn start_metrics_service(&mut self) -> Result<(), ServiceError> {
        info!("Starting metrics and health endpoints");

        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.health_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            } else {
                info!("Metrics service task completed");
            }
        });
        self.background_tasks.push(metrics_handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("✅ Metrics service started on port {}", port);
        Ok(())
    }

    async fn start_command_consumption(&mut self) -> Result<(), ServiceError> {
        let Some(connection) = &self.amqp_connection else {
            return Ok(());
        };
        let queue_name = self.config.amqp.command_queue.clone();

        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open consumer channel: {}", e),
            })?;

        let queue_declare_args = amqprs::channel::QueueDeclareArguments::new(&queue_name)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(queue_declare_args)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue_name, e),
            })?;
        info!("Queue '{}' declared", queue_name);

        let handler = Arc::new(MatchmakerCommandHandler::new(
            self.matchmaker.clone(),
            self.relay.clone(),
        ));
        let consumer = SearchCommandConsumer::new(handler, channel)
            .with_metrics(self.metrics_service.collector());
        consumer
            .start_consuming(&queue_name)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming search commands: {}", e),
            })?;

        self.command_consumer = Some(consumer);
        info!("Listening for search commands on '{}'", queue_name);
        Ok(())
    }

    fn start_background_tasks(&mut self) {
        info!("Starting background maintenance tasks...");

        let pairing_task = {
            let matchmaker = self.matchmaker.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                matchmaker.run(shutdown).await;
            })
        };

        let cleanup_task = {
            let matchmaker = self.matchmaker.clone();
            let relay = self.relay.clone();
            let cleanup_interval = self.config.cleanup_interval();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(cleanup_interval);
                info!("Cleanup task started ({:?} interval)", cleanup_interval);

                while *is_running.read().await {
                    interval.tick().await;

                    match matchmaker.cleanup().await {
                        Ok(0) => debug!("Cleanup check completed - nothing stale"),
                        Ok(cleaned) => info!("Cleaned up {} stale entries and sessions", cleaned),
                        Err(e) => warn!("Matchmaker cleanup failed: {}", e),
                    }
                    match relay.prune_ended() {
                        Ok(0) => {}
                        Ok(pruned) => debug!("Pruned {} relay logs", pruned),
                        Err(e) => warn!("Relay log pruning failed: {}", e),
                    }
                }

                info!("Cleanup task stopped");
            })
        };

        let metrics_task = {
            let matchmaker = self.matchmaker.clone();
            let metrics_collector = self.metrics_service.collector();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(15));
                info!("Metrics update task started");

                while *is_running.read().await {
                    interval.tick().await;

                    match matchmaker.stats() {
                        Ok(stats) => {
                            debug!(
                                "Updating metrics - searching: {}, forming: {}, active: {}",
                                stats.users_searching, stats.forming_sessions, stats.active_sessions
                            );
                            metrics_collector.update_from_stats(&stats);
                        }
                        Err(e) => warn!("Failed to get matchmaker stats for metrics update: {}", e),
                    }
                }

                info!("Metrics update task stopped");
            })
        };

        let health_metrics_task = {
            let metrics_collector = self.metrics_service.collector();
            let health_context = self.health_context.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                info!("Health metrics task started");

                while *is_running.read().await {
                    interval.tick().await;

                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(health_context.uptime_seconds() as i64);

                    match HealthCheck::check(health_context.clone()).await {
                        Ok(health) => {
                            let status = match health.status {
                                HealthStatus::Healthy => 2,
                                HealthStatus::Degraded => 1,
                                HealthStatus::Unhealthy => 0,
                            };
                            metrics_collector.update_health_status(status);
                            for check in &health.checks {
                                metrics_collector.update_component_health(
                                    &check.name,
                                    check.status != HealthStatus::Unhealthy,
                                );
                            }
                        }
                        Err(e) => warn!("Health check for metrics failed: {}", e),
                    }
                }

                info!("Health metrics task stopped");
            })
        };

        self.background_tasks.push(pairing_task);
        self.background_tasks.push(cleanup_task);
        self.background_tasks.push(metrics_task);
        self.background_tasks.push(health_metrics_task);

        info!("4 background maintenance tasks started");
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);

        for (i, task) in self.background_tasks.drain(..).enumerate() {
            debug!("Aborting background task {}/{}", i + 1, task_count);
            task.abort();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("✅ All {} background tasks stopped", task_count);
    }
}
