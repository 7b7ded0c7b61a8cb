//! Pairline - anonymous peer matchmaking and call signaling
//!
//! This crate pairs searching users two at a time, tracks the resulting call
//! sessions and relays signaling between the two participants until one of
//! them leaves.

pub mod amqp;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod matchmaker;
pub mod metrics;
pub mod queue;
pub mod relay;
pub mod service;
pub mod session;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{MatchError, Result};
pub use types::*;

// Re-export key components
pub use amqp::publisher::EventPublisher;
pub use client::{ClientSessionController, ControllerHandle, MediaNegotiator};
pub use directory::{Directory, StaticDirectory};
pub use matchmaker::{Matchmaker, MatchmakerSettings};
pub use queue::WaitingQueue;
pub use relay::{RealtimeChannel, SignalingRelay};
pub use session::SessionRegistry;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
