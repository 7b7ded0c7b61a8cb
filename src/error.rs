//! Error types for the matchmaking and signaling service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application. Callers that need to branch on a specific failure
//! use [`MatchError::kind_of`] to recover the typed error.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking and relay scenarios
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchError {
    #[error("User is already searching: {user_id}")]
    AlreadySearching { user_id: String },

    #[error("User is already in an active session: {user_id}")]
    AlreadyInSession { user_id: String },

    #[error("User is not searching: {user_id}")]
    NotSearching { user_id: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session is full: {session_id}")]
    SessionFull { session_id: String },

    #[error("User {user_id} is not a participant of session {session_id}")]
    NotParticipant { session_id: String, user_id: String },

    #[error("Session is not active: {session_id}")]
    SessionNotActive { session_id: String },

    #[error("Camera or microphone unavailable: {reason}")]
    MediaUnavailable { reason: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Realtime channel failure: {message}")]
    ChannelFailed { message: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchError {
    /// Recover the typed error from an `anyhow::Error`, if it carries one
    pub fn kind_of(error: &anyhow::Error) -> Option<&MatchError> {
        error.downcast_ref::<MatchError>()
    }

    /// Whether the failure comes from a stale or racing session operation
    ///
    /// These are recovered by falling back to searching and re-polling.
    pub fn is_stale_session(&self) -> bool {
        matches!(
            self,
            MatchError::SessionNotFound { .. } | MatchError::SessionFull { .. }
        )
    }

    /// Whether the failure means the call this operation belonged to is over
    pub fn ends_call(&self) -> bool {
        matches!(
            self,
            MatchError::NotParticipant { .. } | MatchError::SessionNotActive { .. }
        )
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        MatchError::InternalError {
            message: format!("Failed to acquire {} lock", what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of_recovers_typed_error() {
        let err: anyhow::Error = MatchError::SessionFull {
            session_id: "abc".to_string(),
        }
        .into();

        let kind = MatchError::kind_of(&err).expect("typed error");
        assert!(kind.is_stale_session());
        assert!(!kind.ends_call());
    }

    #[test]
    fn test_kind_of_plain_anyhow() {
        let err = anyhow::anyhow!("something else");
        assert!(MatchError::kind_of(&err).is_none());
    }

    #[test]
    fn test_call_ending_errors() {
        let not_active = MatchError::SessionNotActive {
            session_id: "s".to_string(),
        };
        let foreign = MatchError::NotParticipant {
            session_id: "s".to_string(),
            user_id: "u".to_string(),
        };
        assert!(not_active.ends_call());
        assert!(foreign.ends_call());
        assert!(!not_active.is_stale_session());
    }
}
