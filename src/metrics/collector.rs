//! Metrics collection using Prometheus
//!
//! Metric groups cover the waiting queue, the session lifecycle, the signaling
//! relay, and the service itself. Every metric is registered on the collector's
//! own registry so several collectors can coexist in one process (tests,
//! simulations).

use crate::matchmaker::MatchmakerStats;
use crate::types::{EndReason, SignalKind};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the pairing service
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    service_metrics: ServiceMetrics,
    queue_metrics: QueueMetrics,
    session_metrics: SessionMetrics,
    relay_metrics: RelayMetrics,
    performance_metrics: PerformanceMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Total AMQP messages processed
    pub amqp_messages_total: IntCounterVec,

    /// AMQP message processing errors
    pub amqp_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Waiting queue metrics
#[derive(Clone)]
pub struct QueueMetrics {
    /// Total searches started
    pub users_queued_total: IntCounter,

    /// Users currently searching without a pairing
    pub users_searching: IntGauge,

    /// Searches cancelled before a session became active
    pub searches_cancelled_total: IntCounter,

    /// Entries dropped for exceeding the maximum search time
    pub stale_entries_removed_total: IntCounter,

    /// Time from enqueue to an active session
    pub search_wait_time_seconds: Histogram,
}

/// Session lifecycle metrics
#[derive(Clone)]
pub struct SessionMetrics {
    /// Sessions created by pairing rounds
    pub sessions_created_total: IntCounter,

    /// Sessions that reached Active
    pub sessions_activated_total: IntCounter,

    /// Sessions ended, by reason
    pub sessions_ended_total: IntCounterVec,

    /// Sessions currently in each non-terminal state
    pub sessions_current: IntGaugeVec,

    /// Duration of active calls
    pub call_duration_seconds: Histogram,
}

/// Signaling relay metrics
#[derive(Clone)]
pub struct RelayMetrics {
    /// Messages published, by kind
    pub messages_sent_total: IntCounterVec,

    /// Messages delivered to subscribers, by kind
    pub messages_delivered_total: IntCounterVec,

    /// Transport duplicates discarded by subscribers
    pub duplicates_dropped_total: IntCounter,

    /// Deliveries that arrived ahead of their predecessors
    pub out_of_order_total: IntCounter,

    /// Sends rejected, by reason
    pub sends_rejected_total: IntCounterVec,

    /// Open relay subscriptions
    pub active_subscriptions: IntGauge,
}

/// Performance metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Duration of one pairing round
    pub pairing_round_duration: Histogram,

    /// Search command processing time
    pub command_processing_duration: Histogram,

    /// AMQP operation durations
    pub amqp_operation_duration: HistogramVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let queue_metrics = QueueMetrics::new(&registry)?;
        let session_metrics = SessionMetrics::new(&registry)?;
        let relay_metrics = RelayMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            queue_metrics,
            session_metrics,
            relay_metrics,
            performance_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn queue(&self) -> &QueueMetrics {
        &self.queue_metrics
    }

    pub fn session(&self) -> &SessionMetrics {
        &self.session_metrics
    }

    pub fn relay(&self) -> &RelayMetrics {
        &self.relay_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Refresh the point-in-time gauges from matchmaker stats
    pub fn update_from_stats(&self, stats: &MatchmakerStats) {
        self.queue_metrics
            .users_searching
            .set(stats.users_searching as i64);
        self.session_metrics
            .sessions_current
            .with_label_values(&["forming"])
            .set(stats.forming_sessions as i64);
        self.session_metrics
            .sessions_current
            .with_label_values(&["active"])
            .set(stats.active_sessions as i64);
    }

    /// Record a search entering the queue
    pub fn record_user_queued(&self) {
        self.queue_metrics.users_queued_total.inc();
    }

    /// Record a search cancelled by its user
    pub fn record_search_cancelled(&self) {
        self.queue_metrics.searches_cancelled_total.inc();
    }

    /// Record entries dropped by the staleness sweep
    pub fn record_stale_entries(&self, count: usize) {
        self.queue_metrics
            .stale_entries_removed_total
            .inc_by(count as u64);
    }

    /// Record a new Forming session
    pub fn record_session_created(&self) {
        self.session_metrics.sessions_created_total.inc();
    }

    /// Record a session turning Active, with the wait of its longest-waiting participant
    pub fn record_session_activated(&self, search_wait: Duration) {
        self.session_metrics.sessions_activated_total.inc();
        self.queue_metrics
            .search_wait_time_seconds
            .observe(search_wait.as_secs_f64());
    }

    /// Record a session ending; `call_duration` is set when the session had been Active
    pub fn record_session_ended(&self, reason: EndReason, call_duration: Option<Duration>) {
        self.session_metrics
            .sessions_ended_total
            .with_label_values(&[&reason.to_string()])
            .inc();

        if let Some(duration) = call_duration {
            self.session_metrics
                .call_duration_seconds
                .observe(duration.as_secs_f64());
        }
    }

    /// Record a relay publish
    pub fn record_relay_sent(&self, kind: &str) {
        self.relay_metrics
            .messages_sent_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record a relay delivery to a subscriber
    pub fn record_relay_delivered(&self, kind: &str) {
        self.relay_metrics
            .messages_delivered_total
            .with_label_values(&[kind])
            .inc();
    }

    /// Record a rejected relay send
    pub fn record_relay_rejected(&self, reason: &str) {
        self.relay_metrics
            .sends_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Record a transport duplicate discarded by a subscriber
    pub fn record_duplicate_dropped(&self) {
        self.relay_metrics.duplicates_dropped_total.inc();
    }

    /// Record a delivery held back until its predecessors arrived
    pub fn record_out_of_order(&self) {
        self.relay_metrics.out_of_order_total.inc();
    }

    pub fn subscription_opened(&self) {
        self.relay_metrics.active_subscriptions.inc();
    }

    pub fn subscription_closed(&self) {
        self.relay_metrics.active_subscriptions.dec();
    }

    /// Record a pairing round duration
    pub fn record_pairing_round(&self, duration: Duration) {
        self.performance_metrics
            .pairing_round_duration
            .observe(duration.as_secs_f64());
    }

    /// Record a search command processed from AMQP
    pub fn record_command_processed(&self, duration: Duration) {
        self.performance_metrics
            .command_processing_duration
            .observe(duration.as_secs_f64());
    }

    /// Record AMQP operation
    pub fn record_amqp_operation(&self, operation: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .amqp_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .amqp_errors_total
                .with_label_values(&[operation])
                .inc();
        }

        self.performance_metrics
            .amqp_operation_duration
            .with_label_values(&[operation, status])
            .observe(duration.as_secs_f64());
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Label value used for signal metrics
pub fn signal_label(kind: SignalKind) -> &'static str {
    kind.as_str()
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("pairline_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let amqp_messages_total = IntCounterVec::new(
            Opts::new(
                "pairline_amqp_messages_total",
                "Total AMQP messages processed",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_messages_total.clone()))?;

        let amqp_errors_total = IntCounterVec::new(
            Opts::new("pairline_amqp_errors_total", "Total AMQP errors"),
            &["operation"],
        )?;
        registry.register(Box::new(amqp_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "pairline_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("pairline_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            amqp_messages_total,
            amqp_errors_total,
            health_status,
            component_health,
        })
    }
}

impl QueueMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let users_queued_total =
            IntCounter::new("pairline_users_queued_total", "Total searches started")?;
        registry.register(Box::new(users_queued_total.clone()))?;

        let users_searching = IntGauge::new(
            "pairline_users_searching",
            "Users currently searching without a pairing",
        )?;
        registry.register(Box::new(users_searching.clone()))?;

        let searches_cancelled_total = IntCounter::new(
            "pairline_searches_cancelled_total",
            "Searches cancelled before a call started",
        )?;
        registry.register(Box::new(searches_cancelled_total.clone()))?;

        let stale_entries_removed_total = IntCounter::new(
            "pairline_stale_entries_removed_total",
            "Queue entries dropped for exceeding the maximum search time",
        )?;
        registry.register(Box::new(stale_entries_removed_total.clone()))?;

        let search_wait_time_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pairline_search_wait_time_seconds",
                "Time from search start to an active call",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(search_wait_time_seconds.clone()))?;

        Ok(Self {
            users_queued_total,
            users_searching,
            searches_cancelled_total,
            stale_entries_removed_total,
            search_wait_time_seconds,
        })
    }
}

impl SessionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let sessions_created_total =
            IntCounter::new("pairline_sessions_created_total", "Total sessions created")?;
        registry.register(Box::new(sessions_created_total.clone()))?;

        let sessions_activated_total = IntCounter::new(
            "pairline_sessions_activated_total",
            "Total sessions that became active",
        )?;
        registry.register(Box::new(sessions_activated_total.clone()))?;

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("pairline_sessions_ended_total", "Total sessions ended"),
            &["reason"],
        )?;
        registry.register(Box::new(sessions_ended_total.clone()))?;

        let sessions_current = IntGaugeVec::new(
            Opts::new("pairline_sessions_current", "Sessions currently open"),
            &["state"],
        )?;
        registry.register(Box::new(sessions_current.clone()))?;

        let call_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("pairline_call_duration_seconds", "Active call duration")
                .buckets(vec![5.0, 15.0, 30.0, 60.0, 180.0, 600.0, 1800.0]),
        )?;
        registry.register(Box::new(call_duration_seconds.clone()))?;

        Ok(Self {
            sessions_created_total,
            sessions_activated_total,
            sessions_ended_total,
            sessions_current,
            call_duration_seconds,
        })
    }
}

impl RelayMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let messages_sent_total = IntCounterVec::new(
            Opts::new("pairline_relay_messages_sent_total", "Relay messages sent"),
            &["kind"],
        )?;
        registry.register(Box::new(messages_sent_total.clone()))?;

        let messages_delivered_total = IntCounterVec::new(
            Opts::new(
                "pairline_relay_messages_delivered_total",
                "Relay messages delivered to subscribers",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(messages_delivered_total.clone()))?;

        let duplicates_dropped_total = IntCounter::new(
            "pairline_relay_duplicates_dropped_total",
            "Duplicate relay deliveries discarded",
        )?;
        registry.register(Box::new(duplicates_dropped_total.clone()))?;

        let out_of_order_total = IntCounter::new(
            "pairline_relay_out_of_order_total",
            "Relay deliveries buffered until their predecessors arrived",
        )?;
        registry.register(Box::new(out_of_order_total.clone()))?;

        let sends_rejected_total = IntCounterVec::new(
            Opts::new("pairline_relay_sends_rejected_total", "Relay sends rejected"),
            &["reason"],
        )?;
        registry.register(Box::new(sends_rejected_total.clone()))?;

        let active_subscriptions = IntGauge::new(
            "pairline_relay_active_subscriptions",
            "Open relay subscriptions",
        )?;
        registry.register(Box::new(active_subscriptions.clone()))?;

        Ok(Self {
            messages_sent_total,
            messages_delivered_total,
            duplicates_dropped_total,
            out_of_order_total,
            sends_rejected_total,
            active_subscriptions,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let pairing_round_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pairline_pairing_round_duration_seconds",
                "Pairing round duration",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;
        registry.register(Box::new(pairing_round_duration.clone()))?;

        let command_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pairline_command_processing_duration_seconds",
                "Search command processing time",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(command_processing_duration.clone()))?;

        let amqp_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "pairline_amqp_operation_duration_seconds",
                "AMQP operation duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation", "status"],
        )?;
        registry.register(Box::new(amqp_operation_duration.clone()))?;

        Ok(Self {
            pairing_round_duration,
            command_processing_duration,
            amqp_operation_duration,
        })
    }
}
