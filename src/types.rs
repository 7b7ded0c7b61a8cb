//! Common types used throughout the matchmaking and signaling service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque identifier for users, supplied by the authentication layer
pub type UserId = String;

/// Unique identifier for sessions
pub type SessionId = Uuid;

/// Unique identifier for relayed messages
pub type MessageId = Uuid;

/// Campus preference used by search filters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Campus {
    #[default]
    Any,
    Diliman,
    LosBanos,
    Manila,
    Cebu,
    Other(String),
}

impl std::fmt::Display for Campus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Campus::Any => write!(f, "Any"),
            Campus::Diliman => write!(f, "Diliman"),
            Campus::LosBanos => write!(f, "Los Baños"),
            Campus::Manila => write!(f, "Manila"),
            Campus::Cebu => write!(f, "Cebu"),
            Campus::Other(name) => write!(f, "{}", name),
        }
    }
}

/// What kind of conversation a user is looking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Any,
    StudyBuddy,
    Dating,
    Casual,
}

/// Filters a searching user attaches to their queue entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub campus: Campus,
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Interest tags such as "#Math21Study"; advisory only
    #[serde(default)]
    pub interests: Vec<String>,
}

impl SearchFilters {
    /// Filters that accept anyone
    pub fn any() -> Self {
        Self::default()
    }

    /// Two searches are compatible when every hard constraint is `Any` on
    /// either side or equal on both
    pub fn is_compatible_with(&self, other: &SearchFilters) -> bool {
        let campus_ok =
            self.campus == Campus::Any || other.campus == Campus::Any || self.campus == other.campus;
        let connection_ok = self.connection_type == ConnectionType::Any
            || other.connection_type == ConnectionType::Any
            || self.connection_type == other.connection_type;
        campus_ok && connection_ok
    }

    /// Number of interest tags both sides share (case-insensitive)
    pub fn shared_interests(&self, other: &SearchFilters) -> usize {
        self.interests
            .iter()
            .filter(|tag| {
                other
                    .interests
                    .iter()
                    .any(|theirs| theirs.eq_ignore_ascii_case(tag))
            })
            .count()
    }
}

/// A user's standing request to be matched with a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub user_id: UserId,
    pub enqueued_at: DateTime<Utc>,
    /// Set by the matchmaker once the entry has been assigned to a session
    pub session_id: Option<SessionId>,
    pub filters: SearchFilters,
}

impl QueueEntry {
    pub fn is_paired(&self) -> bool {
        self.session_id.is_some()
    }
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created at pairing time, waiting for both participants to attach
    Forming,
    /// Both participants attached; signaling may flow
    Active,
    /// Terminal
    Ended,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Forming => write!(f, "Forming"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Ended => write!(f, "Ended"),
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndReason {
    /// A participant hung up
    Hangup,
    /// A participant skipped to the next peer
    Skip,
    /// A participant cancelled while the session was forming
    Cancelled,
    /// The session stayed in Forming past the configured timeout
    Abandoned,
    /// The relay reported the peer gone
    PeerLeft,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndReason::Hangup => write!(f, "hangup"),
            EndReason::Skip => write!(f, "skip"),
            EndReason::Cancelled => write!(f, "cancelled"),
            EndReason::Abandoned => write!(f, "abandoned"),
            EndReason::PeerLeft => write!(f, "peer_left"),
        }
    }
}

/// A matched pair's shared context for signaling a real-time connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    /// Participants; once active, ordered by search start and the first
    /// entry initiates negotiation
    pub participant_ids: Vec<UserId>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<UserId>,
    pub end_reason: Option<EndReason>,
}

impl Session {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|id| id == user_id)
    }

    /// The participant that is not `user_id`, if attached
    pub fn other_participant(&self, user_id: &str) -> Option<&UserId> {
        self.participant_ids.iter().find(|id| id.as_str() != user_id)
    }

    pub fn is_full(&self) -> bool {
        self.participant_ids.len() >= 2
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_ended(&self) -> bool {
        self.state == SessionState::Ended
    }
}

/// Kind of negotiation message carried by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice_candidate",
        }
    }
}

/// Session-negotiation or connectivity message exchanged between two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub session_id: SessionId,
    pub kind: SignalKind,
    /// Opaque negotiation blob; never inspected by the relay
    pub payload: String,
    pub sender_id: UserId,
}

impl SignalMessage {
    pub fn new(
        session_id: SessionId,
        sender_id: impl Into<UserId>,
        kind: SignalKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            kind,
            payload: payload.into(),
            sender_id: sender_id.into(),
        }
    }
}

/// Events delivered to a relay subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayEvent {
    Signal(SignalMessage),
    Chat { sender_id: UserId, text: String },
    ProfileRevealed { sender_id: UserId },
    /// Terminal: the other participant ended the session
    PeerLeft { user_id: UserId },
}

/// Display profile returned by the directory
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerProfile {
    pub display_name: String,
    pub course_of_study: String,
    pub campus: String,
    pub year: String,
    pub interests: Vec<String>,
    /// Network name -> handle, e.g. "instagram" -> "@someone"
    pub social_handles: BTreeMap<String, String>,
}

/// Event emitted when a user enters the waiting queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserQueued {
    pub user_id: UserId,
    pub searching: usize,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when two entries are assigned to a new or forming session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMatched {
    pub session_id: SessionId,
    pub user_ids: Vec<UserId>,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when both participants attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionActivated {
    pub session_id: SessionId,
    pub participant_ids: Vec<UserId>,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted when a session ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnded {
    pub session_id: SessionId,
    pub participant_ids: Vec<UserId>,
    pub ended_by: Option<UserId>,
    pub reason: EndReason,
    pub timestamp: DateTime<Utc>,
}

/// Union type for all outbound matchmaking events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MatchmakingEvent {
    UserQueued(UserQueued),
    SessionMatched(SessionMatched),
    SessionActivated(SessionActivated),
    SessionEnded(SessionEnded),
}

/// Action requested by a remote client over AMQP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchAction {
    Start,
    Cancel,
    /// Attach to the session the user was paired into
    Join,
    /// Relay an offer, answer or ICE candidate to the peer
    Signal,
    Chat,
    Reveal,
    End,
}

impl SearchAction {
    /// Actions that address an existing session
    pub fn needs_session(&self) -> bool {
        !matches!(self, SearchAction::Start | SearchAction::Cancel)
    }
}

/// Inbound command consumed from the search command queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCommand {
    pub user_id: UserId,
    pub action: SearchAction,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
    /// Required for every action except `Start` and `Cancel`
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Required for `Signal`
    #[serde(default)]
    pub signal: Option<SignalKind>,
    /// Signal blob for `Signal`, text for `Chat`
    #[serde(default)]
    pub payload: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_filters_are_compatible_with_everything() {
        let picky = SearchFilters {
            campus: Campus::Cebu,
            connection_type: ConnectionType::Dating,
            interests: vec![],
        };
        assert!(SearchFilters::any().is_compatible_with(&picky));
        assert!(picky.is_compatible_with(&SearchFilters::any()));
    }

    #[test]
    fn test_conflicting_filters() {
        let a = SearchFilters {
            campus: Campus::Diliman,
            ..SearchFilters::default()
        };
        let b = SearchFilters {
            campus: Campus::Manila,
            ..SearchFilters::default()
        };
        assert!(!a.is_compatible_with(&b));

        let c = SearchFilters {
            connection_type: ConnectionType::StudyBuddy,
            ..SearchFilters::default()
        };
        let d = SearchFilters {
            connection_type: ConnectionType::Casual,
            ..SearchFilters::default()
        };
        assert!(!c.is_compatible_with(&d));
    }

    #[test]
    fn test_shared_interests_ignore_case() {
        let a = SearchFilters {
            interests: vec!["#UPFair".to_string(), "#Math21Study".to_string()],
            ..SearchFilters::default()
        };
        let b = SearchFilters {
            interests: vec!["#upfair".to_string()],
            ..SearchFilters::default()
        };
        assert_eq!(a.shared_interests(&b), 1);
    }

    #[test]
    fn test_session_participant_helpers() {
        let session = Session {
            session_id: Uuid::new_v4(),
            participant_ids: vec!["alice".to_string(), "bob".to_string()],
            state: SessionState::Active,
            created_at: Utc::now(),
            activated_at: Some(Utc::now()),
            ended_at: None,
            ended_by: None,
            end_reason: None,
        };
        assert!(session.is_participant("alice"));
        assert!(!session.is_participant("carol"));
        assert_eq!(session.other_participant("alice").map(String::as_str), Some("bob"));
        assert!(session.is_full());
    }

    #[test]
    fn test_relay_event_tagging() {
        let event = RelayEvent::Chat {
            sender_id: "alice".to_string(),
            text: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Chat");
    }
}
