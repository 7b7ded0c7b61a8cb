//! Pairing simulator
//!
//! Runs the matchmaker, relay and a crowd of client controllers in one
//! process, with scripted media negotiators standing in for real cameras.
//!
//! Usage:
//!   cargo run --bin pair-sim -- --help
//!   cargo run --bin pair-sim crowd --clients 10
//!   cargo run --bin pair-sim scenario --name skip
//!   cargo run --bin pair-sim all-scenarios

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use pairline::amqp::LoggingEventPublisher;
use pairline::client::{
    ClientSessionController, ControllerEvent, ControllerHandle, ControllerSettings,
    ControllerState, MockNegotiator,
};
use pairline::config::{AppConfig, RelaySettings};
use pairline::directory::StaticDirectory;
use pairline::matchmaker::{Matchmaker, MatchmakerSettings};
use pairline::metrics::MetricsCollector;
use pairline::relay::{InMemoryChannel, SignalingRelay};
use pairline::types::{PeerProfile, SearchFilters};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "pair-sim")]
#[command(about = "In-process pairing and signaling simulator for pairline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Pairing poll interval in milliseconds
    #[arg(long, default_value = "50")]
    poll_ms: u64,

    /// Seconds to wait for each expected state change
    #[arg(long, default_value = "5")]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Start many clients at once and wait for them to pair up
    Crowd {
        /// Number of clients
        #[arg(short, long, default_value = "10")]
        clients: usize,
    },
    /// Run a named scenario (pair, skip, cancel, chat)
    Scenario {
        #[arg(short, long)]
        name: String,
    },
    /// Run every scenario
    AllScenarios,
}

/// Everything one simulated deployment needs
struct Simulation {
    matchmaker: Matchmaker,
    relay: Arc<SignalingRelay>,
    directory: Arc<StaticDirectory>,
    metrics: Arc<MetricsCollector>,
    settings: ControllerSettings,
    wait: Duration,
    shutdown: broadcast::Sender<()>,
}

impl Simulation {
    fn new(poll: Duration, wait: Duration) -> Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);
        let matchmaker = Matchmaker::new(
            Arc::new(LoggingEventPublisher::new()),
            metrics.clone(),
            MatchmakerSettings {
                poll_interval: poll,
                ..MatchmakerSettings::from_config(&AppConfig::default())
            },
        );
        let relay = Arc::new(SignalingRelay::new(
            matchmaker.registry(),
            Arc::new(InMemoryChannel::new()),
            metrics.clone(),
            RelaySettings::default(),
        ));

        let (shutdown, rx) = broadcast::channel(1);
        let runner = matchmaker.clone();
        tokio::spawn(async move { runner.run(rx).await });

        Ok(Self {
            matchmaker,
            relay,
            directory: Arc::new(StaticDirectory::new()),
            metrics,
            settings: ControllerSettings {
                poll_interval: poll,
                ..ControllerSettings::default()
            },
            wait,
            shutdown,
        })
    }

    fn client(&self, user_id: &str) -> Result<(ControllerHandle, MockNegotiator)> {
        self.directory.insert(
            user_id,
            PeerProfile {
                display_name: user_id.to_string(),
                course_of_study: "BS Computer Science".to_string(),
                campus: "Diliman".to_string(),
                year: "3".to_string(),
                ..PeerProfile::default()
            },
        )?;
        let negotiator = MockNegotiator::new(user_id);
        let (handle, _) = ClientSessionController::spawn(
            user_id,
            self.matchmaker.clone(),
            self.relay.clone(),
            self.directory.clone(),
            negotiator.clone(),
            self.settings.clone(),
        );
        Ok((handle, negotiator))
    }

    async fn wait_negotiated(&self, negotiators: &[&MockNegotiator]) -> Result<()> {
        let deadline = Instant::now() + self.wait;
        while !negotiators.iter().all(|n| n.log().is_negotiated()) {
            if Instant::now() > deadline {
                return Err(anyhow!("media negotiation did not finish in {:?}", self.wait));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    fn report(&self) -> Result<()> {
        let stats = self.matchmaker.stats()?;
        println!("📊 Matchmaker statistics:");
        println!("  Users queued: {}", stats.users_queued);
        println!("  Sessions created: {}", stats.sessions_created);
        println!("  Sessions activated: {}", stats.sessions_activated);
        println!("  Sessions ended: {}", stats.sessions_ended);
        println!("  Searches cancelled: {}", stats.searches_cancelled);
        println!("  Still searching: {}", stats.users_searching);
        println!("  Active sessions: {}", stats.active_sessions);
        println!(
            "  Registered metric families: {}",
            self.metrics.registry().gather().len()
        );
        Ok(())
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

async fn crowd(sim: &Simulation, clients: usize) -> Result<bool> {
    let started = Instant::now();
    let mut handles = Vec::with_capacity(clients);
    for i in 0..clients {
        let (handle, _) = sim.client(&format!("student-{:03}", i))?;
        handle.start_search(SearchFilters::any()).await?;
        handles.push(handle);
    }

    let expected_pairs = clients / 2;
    let deadline = Instant::now() + sim.wait;
    loop {
        let connected = handles
            .iter()
            .filter(|h| h.state() == ControllerState::Connected)
            .count();
        if connected == expected_pairs * 2 {
            break;
        }
        if Instant::now() > deadline {
            println!(
                "❌ Only {} of {} clients connected in {:?}",
                connected,
                expected_pairs * 2,
                sim.wait
            );
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!(
        "✅ {} pairs connected in {:.2}ms",
        expected_pairs,
        started.elapsed().as_secs_f64() * 1000.0
    );
    for handle in &handles {
        handle.shutdown().await?;
    }
    Ok(true)
}

async fn scenario_pair(sim: &Simulation) -> Result<bool> {
    let (alice, alice_media) = sim.client("alice")?;
    let (bob, bob_media) = sim.client("bob")?;

    alice.start_search(SearchFilters::any()).await?;
    bob.start_search(SearchFilters::any()).await?;
    alice.wait_for_state(ControllerState::Connected, sim.wait).await?;
    bob.wait_for_state(ControllerState::Connected, sim.wait).await?;
    sim.wait_negotiated(&[&alice_media, &bob_media]).await?;

    let (a, b) = (alice_media.log(), bob_media.log());
    Ok(a.local_description == b.remote_description && b.local_description == a.remote_description)
}

async fn scenario_skip(sim: &Simulation) -> Result<bool> {
    let (alice, _) = sim.client("alice")?;
    let (bob, _) = sim.client("bob")?;
    let (carol, _) = sim.client("carol")?;

    alice.start_search(SearchFilters::any()).await?;
    bob.start_search(SearchFilters::any()).await?;
    alice.wait_for_state(ControllerState::Connected, sim.wait).await?;
    bob.wait_for_state(ControllerState::Connected, sim.wait).await?;

    // Alice moves on; carol should be the next peer
    alice.skip().await?;
    carol.start_search(SearchFilters::any()).await?;
    bob.wait_for_state(ControllerState::Idle, sim.wait).await?;
    alice.wait_for_state(ControllerState::Connected, sim.wait).await?;
    carol.wait_for_state(ControllerState::Connected, sim.wait).await?;
    Ok(true)
}

async fn scenario_cancel(sim: &Simulation) -> Result<bool> {
    let (alice, _) = sim.client("alice")?;

    alice.start_search(SearchFilters::any()).await?;
    alice.wait_for_state(ControllerState::Searching, sim.wait).await?;
    alice.cancel().await?;
    alice.wait_for_state(ControllerState::Idle, sim.wait).await?;

    Ok(sim.matchmaker.searching_count()? == 0)
}

async fn scenario_chat(sim: &Simulation) -> Result<bool> {
    let (alice, _) = sim.client("alice")?;
    let (bob, _) = sim.client("bob")?;
    let mut bob_events = bob.events();

    alice.start_search(SearchFilters::any()).await?;
    bob.start_search(SearchFilters::any()).await?;
    alice.wait_for_state(ControllerState::Connected, sim.wait).await?;
    bob.wait_for_state(ControllerState::Connected, sim.wait).await?;

    alice.send_chat("hi from the library").await?;
    alice.reveal_profile().await?;

    let mut chatted = false;
    let mut revealed = false;
    let deadline = tokio::time::Instant::now() + sim.wait;
    while !(chatted && revealed) {
        match tokio::time::timeout_at(deadline, bob_events.recv()).await {
            Ok(Ok(ControllerEvent::ChatReceived { text })) => {
                println!("  bob received: {:?}", text);
                chatted = true;
            }
            Ok(Ok(ControllerEvent::PeerRevealed { profile })) => {
                println!(
                    "  bob sees: {}",
                    profile.map(|p| p.display_name).unwrap_or_default()
                );
                revealed = true;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(anyhow!("event stream failed: {}", e)),
            Err(_) => return Ok(false),
        }
    }
    Ok(true)
}

async fn run_scenario(name: &str, poll: Duration, wait: Duration) -> Result<bool> {
    let sim = Simulation::new(poll, wait)?;
    let result = match name {
        "pair" => scenario_pair(&sim).await,
        "skip" => scenario_skip(&sim).await,
        "cancel" => scenario_cancel(&sim).await,
        "chat" => scenario_chat(&sim).await,
        _ => {
            return Err(anyhow!(
                "Unknown scenario '{}'. Available: pair, skip, cancel, chat",
                name
            ))
        }
    };
    sim.report()?;
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let poll = Duration::from_millis(cli.poll_ms);
    let wait = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Crowd { clients } => {
            println!("🧪 Simulating {} clients", clients);
            let sim = Simulation::new(poll, wait)?;
            let ok = crowd(&sim, clients).await?;
            sim.report()?;
            if !ok {
                std::process::exit(1);
            }
        }

        Commands::Scenario { name } => {
            println!("🧪 Running scenario: {}", name);
            match run_scenario(&name, poll, wait).await {
                Ok(true) => println!("✅ Scenario completed successfully!"),
                Ok(false) => {
                    println!("❌ Scenario failed.");
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("❌ Error running scenario: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::AllScenarios => {
            let mut passed = 0;
            let mut failed = 0;

            println!("🧪 Running all scenarios...\n");
            for name in ["pair", "skip", "cancel", "chat"] {
                println!("Running '{}' scenario...", name);
                match run_scenario(name, poll, wait).await {
                    Ok(true) => {
                        println!("✅ PASSED\n");
                        passed += 1;
                    }
                    Ok(false) => {
                        println!("❌ FAILED\n");
                        failed += 1;
                    }
                    Err(e) => {
                        println!("❌ FAILED ({})\n", e);
                        failed += 1;
                    }
                }
            }

            println!("📊 Results: {} passed, {} failed", passed, failed);
            if failed > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
