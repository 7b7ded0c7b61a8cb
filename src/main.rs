//! Main entry point for the pairline service
//!
//! Loads configuration, initializes logging, runs the matchmaker, relay and
//! health endpoints, and shuts down gracefully on SIGINT/SIGTERM.

use anyhow::Result;
use clap::Parser;
use pairline::config::AppConfig;
use pairline::service::{AppState, HealthCheck, HealthContext, HealthStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Pairline - anonymous peer matchmaking and call signaling
#[derive(Parser)]
#[command(
    name = "pairline",
    version,
    about = "Anonymous one-to-one matchmaking and call signaling service",
    long_about = "Pairline queues searching users, pairs them two at a time into call sessions \
                 and relays offers, answers and ICE candidates between the two participants. \
                 Search commands and matchmaking events travel over AMQP when a broker is configured."
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Perform health check and exit
    #[arg(long, help = "Perform a health check and exit with status code")]
    health_check: bool,

    /// Log level override
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Override log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// AMQP URL override
    #[arg(long, value_name = "URL", help = "Override AMQP connection URL")]
    amqp_url: Option<String>,

    /// Run without a broker
    #[arg(long, help = "Disable AMQP and run fully in memory")]
    no_amqp: bool,

    /// Health port override
    #[arg(long, value_name = "PORT", help = "Override health and metrics port")]
    health_port: Option<u16>,

    /// Enable debug mode
    #[arg(short, long, help = "Enable debug mode with verbose logging")]
    debug: bool,

    /// Dry run mode (validate config and exit)
    #[arg(
        long,
        help = "Validate configuration and exit without starting service"
    )]
    dry_run: bool,
}

/// Initialize structured logging with the configured level
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Perform health check and exit with a status code
async fn perform_health_check(config: AppConfig) -> Result<()> {
    info!("Performing health check...");

    let mut app_state = AppState::new(config).await?;
    app_state.start().await?;
    let health = app_state.health().await;
    app_state.shutdown().await?;

    match health {
        Ok(health) => {
            println!("Health Check: {}", health.status);
            println!("  Users Searching: {}", health.stats.users_searching);
            println!("  Forming Sessions: {}", health.stats.forming_sessions);
            println!("  Active Sessions: {}", health.stats.active_sessions);
            for check in &health.checks {
                println!("  {}: {}", check.name, check.status);
            }

            if health.status == HealthStatus::Healthy {
                std::process::exit(0);
            } else {
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("Health check failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Wait for shutdown signals (SIGINT, SIGTERM)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C) signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

/// Log a health summary every 30 seconds
async fn health_check_task(health_context: Arc<HealthContext>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    while health_context.is_running().await {
        interval.tick().await;

        match HealthCheck::check(health_context.clone()).await {
            Ok(health) => {
                info!(
                    "Health check: {} - {} searching, {} active sessions, {} calls total",
                    health.status,
                    health.stats.users_searching,
                    health.stats.active_sessions,
                    health.stats.sessions_activated
                );
            }
            Err(e) => {
                warn!("Health check failed: {}", e);
            }
        }
    }
}

fn display_startup_banner(config: &AppConfig) {
    info!("🚀 Pairline");
    info!("   Service: {}", config.service.name);
    info!("   Log level: {}", config.service.log_level);
    info!("   Health port: {}", config.service.health_port);
    if config.amqp.enabled {
        info!("   AMQP: enabled");
        info!("   Command queue: {}", config.amqp.command_queue);
    } else {
        info!("   AMQP: disabled");
    }
    info!("   Relay transport: {:?}", config.relay.transport);
    info!("   Poll interval: {:?}", config.poll_interval());
    info!("   Forming timeout: {:?}", config.forming_timeout());
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}

/// Load configuration from file or environment, then apply CLI overrides
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = if let Some(config_path) = &args.config {
        AppConfig::from_file(config_path)?
    } else {
        AppConfig::from_env()?
    };

    if let Some(log_level) = &args.log_level {
        config.service.log_level = log_level.clone();
    }

    if args.debug {
        config.service.log_level = "debug".to_string();
    }

    if let Some(amqp_url) = &args.amqp_url {
        config.amqp.url = amqp_url.clone();
    }

    if args.no_amqp {
        config.amqp.enabled = false;
        config.relay.transport = pairline::config::RelayTransport::Memory;
    }

    if let Some(health_port) = args.health_port {
        config.service.health_port = health_port;
    }

    pairline::config::validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.service.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    if args.health_check {
        return perform_health_check(config).await;
    }

    if args.dry_run {
        info!("Configuration validation successful");
        display_startup_banner(&config);
        info!("Dry run completed - exiting without starting service");
        return Ok(());
    }

    display_startup_banner(&config);

    info!("Initializing service components...");
    let mut app_state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting service...");
    if let Err(e) = app_state.start().await {
        error!("Failed to start service: {}", e);
        std::process::exit(1);
    }

    let health_task = tokio::spawn(health_check_task(app_state.health_context()));

    info!("✅ Pairline is running");
    info!("Press Ctrl+C to shutdown gracefully...");

    wait_for_shutdown_signal().await;

    info!("🛑 Shutdown signal received, beginning graceful shutdown...");
    health_task.abort();

    match tokio::time::timeout(config.shutdown_timeout(), app_state.shutdown()).await {
        Ok(Ok(())) => info!("✅ Graceful shutdown completed successfully"),
        Ok(Err(e)) => warn!("Shutdown finished with errors: {}", e),
        Err(_) => warn!("⚠️  Shutdown timeout exceeded, forcing exit"),
    }

    info!("🛑 Pairline stopped");
    Ok(())
}
