//! Metrics and monitoring for the pairline service
//!
//! Prometheus collectors for queue, session and relay activity, plus the
//! HTTP server that exposes them alongside the health probes.

pub mod collector;
pub mod health;

pub use collector::{
    signal_label, MetricsCollector, MetricsTimer, PerformanceMetrics, QueueMetrics, RelayMetrics,
    ServiceMetrics, SessionMetrics,
};
pub use health::{HealthEndpoints, HealthServer, HealthServerConfig};

use std::sync::Arc;

/// Unified metrics service that combines all monitoring capabilities
#[derive(Clone)]
pub struct MetricsService {
    collector: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
}

impl MetricsService {
    pub fn new(collector: Arc<MetricsCollector>, health_server: Arc<HealthServer>) -> Self {
        Self {
            collector,
            health_server,
        }
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn health_server(&self) -> Arc<HealthServer> {
        self.health_server.clone()
    }

    /// Serve health endpoints until [`MetricsService::stop`] is called
    pub async fn start(&self) -> anyhow::Result<()> {
        self.health_server.start().await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.health_server.stop().await
    }
}
