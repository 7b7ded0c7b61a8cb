//! Health check endpoints and monitoring
//!
//! This module provides health check functionality for the pairline service,
//! including readiness and liveness probes.

use crate::amqp::AmqpConnection;
use crate::matchmaker::Matchmaker;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// What the probes look at: shared with the running service
pub struct HealthContext {
    service_name: String,
    matchmaker: Matchmaker,
    amqp_connection: Option<Arc<AmqpConnection>>,
    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
}

impl HealthContext {
    pub fn new(
        service_name: &str,
        matchmaker: Matchmaker,
        amqp_connection: Option<Arc<AmqpConnection>>,
        is_running: Arc<RwLock<bool>>,
    ) -> Self {
        Self {
            service_name: service_name.to_string(),
            matchmaker,
            amqp_connection,
            is_running,
            started_at: Instant::now(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Optional error message if not healthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Users searching without a pairing
    pub users_searching: usize,
    pub forming_sessions: usize,
    pub active_sessions: usize,
    /// Totals since service start
    pub sessions_created: u64,
    pub sessions_activated: u64,
    pub sessions_ended: u64,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(context: Arc<HealthContext>) -> Result<Self> {
        let mut checks = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        let service_check = Self::check_service_running(&context).await;
        if service_check.status != HealthStatus::Healthy {
            overall_status = HealthStatus::Unhealthy;
        }
        checks.push(service_check);

        for check in [
            Self::check_matchmaker(&context),
            Self::check_amqp_health(&context),
        ] {
            if check.status == HealthStatus::Unhealthy {
                overall_status = HealthStatus::Unhealthy;
            } else if check.status == HealthStatus::Degraded
                && overall_status == HealthStatus::Healthy
            {
                overall_status = HealthStatus::Degraded;
            }
            checks.push(check);
        }

        Ok(HealthCheck {
            status: overall_status,
            service: context.service_name().to_string(),
            version: std::env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            timestamp: chrono::Utc::now(),
            checks,
            stats: Self::gather_service_stats(&context),
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(context: Arc<HealthContext>) -> Result<HealthStatus> {
        if context.is_running().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - verify service can handle requests
    pub async fn readiness_check(context: Arc<HealthContext>) -> Result<HealthStatus> {
        if !context.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }

        let matchmaker = Self::check_matchmaker(&context).status;
        let amqp = Self::check_amqp_health(&context).status;
        Ok(match (matchmaker, amqp) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            _ => HealthStatus::Degraded,
        })
    }

    async fn check_service_running(context: &HealthContext) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = if context.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_matchmaker(context: &HealthContext) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = match context.matchmaker.stats() {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Matchmaker stats check failed: {}", e);
                (
                    HealthStatus::Degraded,
                    Some(format!("Stats check failed: {}", e)),
                )
            }
        };

        ComponentCheck {
            name: "matchmaker".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_amqp_health(context: &HealthContext) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = match &context.amqp_connection {
            None => (HealthStatus::Healthy, Some("AMQP disabled".to_string())),
            Some(connection) if connection.is_alive() => (HealthStatus::Healthy, None),
            Some(_) => (
                HealthStatus::Unhealthy,
                Some("AMQP connection is closed".to_string()),
            ),
        };

        ComponentCheck {
            name: "amqp_connection".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn gather_service_stats(context: &HealthContext) -> ServiceStats {
        match context.matchmaker.stats() {
            Ok(stats) => ServiceStats {
                users_searching: stats.users_searching,
                forming_sessions: stats.forming_sessions,
                active_sessions: stats.active_sessions,
                sessions_created: stats.sessions_created,
                sessions_activated: stats.sessions_activated,
                sessions_ended: stats.sessions_ended,
                uptime_seconds: context.uptime_seconds(),
            },
            Err(e) => {
                debug!("Failed to get matchmaker stats for health check: {}", e);
                ServiceStats {
                    uptime_seconds: context.uptime_seconds(),
                    ..ServiceStats::default()
                }
            }
        }
    }
}

impl HealthCheck {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
