//! Matchmaking: pairing searching users into sessions
//!
//! The [`Matchmaker`] owns every state transition of queue entries and
//! sessions. Which users get paired is decided by a [`PairingStrategy`].

pub mod manager;
pub mod matching;

pub use manager::{JoinOutcome, Matchmaker, MatchmakerSettings, MatchmakerStats, SearchTicket};
pub use matching::{FifoPairingStrategy, MatchingConfig, PairingStrategy};
