//! Utility functions for the matchmaking service

use crate::types::{MessageId, SessionId};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Generate a new globally unique session ID
pub fn generate_session_id() -> SessionId {
    Uuid::new_v4()
}

/// Generate a new unique relay message ID
pub fn generate_message_id() -> MessageId {
    Uuid::new_v4()
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Time elapsed since `since`, clamped at zero for clock skew
pub fn elapsed_since(since: DateTime<Utc>) -> Duration {
    (current_timestamp() - since).to_std().unwrap_or(Duration::ZERO)
}

/// Channel key the relay publishes a session's traffic under
pub fn session_channel_key(session_id: SessionId) -> String {
    format!("session.{}", session_id)
}
