//! AMQP message definitions and serialization

use crate::error::{MatchError, Result};
use crate::types::*;
use serde_json;

/// Default AMQP queue and exchange names
pub const SEARCH_COMMAND_QUEUE: &str = "pairline.search_commands";
pub const MATCH_EVENTS_EXCHANGE: &str = "pairline.match_events";
pub const SIGNALS_EXCHANGE: &str = "pairline.signals";

/// Routing keys for events
pub const USER_QUEUED_ROUTING_KEY: &str = "user.queued";
pub const SESSION_MATCHED_ROUTING_KEY: &str = "session.matched";
pub const SESSION_ACTIVATED_ROUTING_KEY: &str = "session.activated";
pub const SESSION_ENDED_ROUTING_KEY: &str = "session.ended";

/// Message envelope with metadata
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MessageEnvelope<T> {
    pub payload: T,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub routing_key: String,
}

impl<T> MessageEnvelope<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    /// Create a new message envelope
    pub fn new(payload: T, routing_key: String) -> Self {
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            routing_key,
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchError::InvalidCommand {
                reason: format!("Failed to deserialize message: {}", e),
            }
            .into()
        })
    }
}

/// Message serialization and validation utilities
pub struct MessageUtils;

impl MessageUtils {
    /// Serialize a search command to bytes
    pub fn serialize_search_command(command: &SearchCommand) -> Result<Vec<u8>> {
        Self::validate_search_command(command)?;
        serde_json::to_vec(command).map_err(|e| {
            MatchError::InternalError {
                message: format!("Failed to serialize search command: {}", e),
            }
            .into()
        })
    }

    /// Deserialize a search command from bytes
    pub fn deserialize_search_command(bytes: &[u8]) -> Result<SearchCommand> {
        let command: SearchCommand =
            serde_json::from_slice(bytes).map_err(|e| MatchError::InvalidCommand {
                reason: format!("Failed to deserialize search command: {}", e),
            })?;

        Self::validate_search_command(&command)?;
        Ok(command)
    }

    /// Validate a search command
    pub fn validate_search_command(command: &SearchCommand) -> Result<()> {
        if command.user_id.trim().is_empty() {
            return Err(MatchError::InvalidCommand {
                reason: "User ID cannot be empty".to_string(),
            }
            .into());
        }

        if command.action.needs_session() && command.session_id.is_none() {
            return Err(MatchError::InvalidCommand {
                reason: format!("{:?} commands must name the session", command.action),
            }
            .into());
        }

        match command.action {
            SearchAction::Signal if command.signal.is_none() || command.payload.is_none() => {
                return Err(MatchError::InvalidCommand {
                    reason: "Signal commands need a signal kind and payload".to_string(),
                }
                .into());
            }
            SearchAction::Chat
                if command
                    .payload
                    .as_deref()
                    .map_or(true, |text| text.trim().is_empty()) =>
            {
                return Err(MatchError::InvalidCommand {
                    reason: "Chat text cannot be empty".to_string(),
                }
                .into());
            }
            _ => {}
        }

        if let Some(Campus::Other(name)) = command.filters.as_ref().map(|f| &f.campus) {
            if name.trim().is_empty() {
                return Err(MatchError::InvalidCommand {
                    reason: "Campus name cannot be empty".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Serialize any AMQP message to bytes
    pub fn serialize_message<T: serde::Serialize>(message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| {
            MatchError::InternalError {
                message: format!("Failed to serialize message: {}", e),
            }
            .into()
        })
    }

    /// Get routing key for an outbound event
    pub fn get_routing_key(event: &MatchmakingEvent) -> &'static str {
        match event {
            MatchmakingEvent::UserQueued(_) => USER_QUEUED_ROUTING_KEY,
            MatchmakingEvent::SessionMatched(_) => SESSION_MATCHED_ROUTING_KEY,
            MatchmakingEvent::SessionActivated(_) => SESSION_ACTIVATED_ROUTING_KEY,
            MatchmakingEvent::SessionEnded(_) => SESSION_ENDED_ROUTING_KEY,
        }
    }
}
