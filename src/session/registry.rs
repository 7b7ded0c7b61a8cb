//! Session registry
//!
//! Maps session ids to their participants and lifecycle state. Each session
//! carries a state watch; ending a session flips it to `Ended`, which is what
//! tears down relay subscriptions for that session.

use crate::error::{MatchError, Result};
use crate::types::{EndReason, Session, SessionId, SessionState, UserId};
use crate::utils::{current_timestamp, elapsed_since, generate_session_id};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

struct SessionSlot {
    session: Session,
    state: watch::Sender<SessionState>,
}

/// Result of [`SessionRegistry::end`]
#[derive(Debug, Clone)]
pub struct EndOutcome {
    pub session: Session,
    /// True when this call performed the transition to `Ended`
    pub newly_ended: bool,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionSlot>>,
}

fn not_found(session_id: SessionId) -> anyhow::Error {
    MatchError::SessionNotFound {
        session_id: session_id.to_string(),
    }
    .into()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty `Forming` session with a fresh id
    pub fn create(&self) -> Result<Session> {
        let session = Session {
            session_id: generate_session_id(),
            participant_ids: Vec::new(),
            state: SessionState::Forming,
            created_at: current_timestamp(),
            activated_at: None,
            ended_at: None,
            ended_by: None,
            end_reason: None,
        };
        let (state, _) = watch::channel(SessionState::Forming);

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        sessions.insert(
            session.session_id,
            SessionSlot {
                session: session.clone(),
                state,
            },
        );

        debug!("Created session {}", session.session_id);
        Ok(session)
    }

    /// Attach a participant; the second distinct participant activates the session
    pub fn attach(&self, session_id: SessionId, user_id: &str) -> Result<Session> {
        self.attach_in_order(session_id, user_id, &[])
    }

    /// Attach a participant, ranking participants by `order` on activation
    ///
    /// The active session lists participants in `order`; users missing from it
    /// keep their attach order after the ranked ones.
    pub fn attach_in_order(
        &self,
        session_id: SessionId,
        user_id: &str,
        order: &[UserId],
    ) -> Result<Session> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        let slot = sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found(session_id))?;

        if slot.session.is_ended() {
            return Err(MatchError::SessionNotActive {
                session_id: session_id.to_string(),
            }
            .into());
        }
        if slot.session.is_participant(user_id) {
            return Ok(slot.session.clone());
        }
        if slot.session.is_full() {
            return Err(MatchError::SessionFull {
                session_id: session_id.to_string(),
            }
            .into());
        }

        slot.session.participant_ids.push(user_id.to_string());
        if slot.session.is_full() {
            slot.session.participant_ids.sort_by_key(|id| {
                order
                    .iter()
                    .position(|ranked| ranked == id)
                    .unwrap_or(usize::MAX)
            });
            slot.session.state = SessionState::Active;
            slot.session.activated_at = Some(current_timestamp());
            slot.state.send_replace(SessionState::Active);
            info!(
                "Session {} active with participants {:?}",
                session_id, slot.session.participant_ids
            );
        } else {
            debug!("User {} attached to forming session {}", user_id, session_id);
        }

        Ok(slot.session.clone())
    }

    /// Remove a participant from a `Forming` session
    pub fn detach(&self, session_id: SessionId, user_id: &str) -> Result<Session> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        let slot = sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found(session_id))?;

        if slot.session.state != SessionState::Forming {
            return Err(MatchError::InvalidCommand {
                reason: format!(
                    "cannot detach from session {} in state {}",
                    session_id, slot.session.state
                ),
            }
            .into());
        }

        slot.session.participant_ids.retain(|id| id != user_id);
        Ok(slot.session.clone())
    }

    pub fn get(&self, session_id: SessionId) -> Result<Session> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        sessions
            .get(&session_id)
            .map(|slot| slot.session.clone())
            .ok_or_else(|| not_found(session_id))
    }

    /// End a session; ending an already ended session returns it unchanged
    pub fn end(
        &self,
        session_id: SessionId,
        ended_by: Option<&str>,
        reason: EndReason,
    ) -> Result<EndOutcome> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        let slot = sessions
            .get_mut(&session_id)
            .ok_or_else(|| not_found(session_id))?;

        if slot.session.is_ended() {
            return Ok(EndOutcome {
                session: slot.session.clone(),
                newly_ended: false,
            });
        }

        slot.session.state = SessionState::Ended;
        slot.session.ended_at = Some(current_timestamp());
        slot.session.ended_by = ended_by.map(str::to_string);
        slot.session.end_reason = Some(reason);
        slot.state.send_replace(SessionState::Ended);

        info!(
            "Session {} ended ({}) by {}",
            session_id,
            reason,
            ended_by.unwrap_or("system")
        );
        Ok(EndOutcome {
            session: slot.session.clone(),
            newly_ended: true,
        })
    }

    /// Watch a session's lifecycle state
    pub fn watch(&self, session_id: SessionId) -> Result<watch::Receiver<SessionState>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        sessions
            .get(&session_id)
            .map(|slot| slot.state.subscribe())
            .ok_or_else(|| not_found(session_id))
    }

    /// The Active session the user belongs to, if any
    pub fn active_session_for(&self, user_id: &str) -> Result<Option<Session>> {
        self.find_for(user_id, SessionState::Active)
    }

    /// The Forming session the user is attached to, if any
    pub fn forming_session_for(&self, user_id: &str) -> Result<Option<Session>> {
        self.find_for(user_id, SessionState::Forming)
    }

    fn find_for(&self, user_id: &str, state: SessionState) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        Ok(sessions
            .values()
            .find(|slot| slot.session.state == state && slot.session.is_participant(user_id))
            .map(|slot| slot.session.clone()))
    }

    /// All `Forming` sessions, oldest first
    pub fn forming_sessions(&self) -> Result<Vec<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        let mut forming: Vec<Session> = sessions
            .values()
            .filter(|slot| slot.session.state == SessionState::Forming)
            .map(|slot| slot.session.clone())
            .collect();
        forming.sort_by_key(|session| session.created_at);
        Ok(forming)
    }

    /// Number of sessions in `state`
    pub fn count(&self, state: SessionState) -> Result<usize> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;
        Ok(sessions
            .values()
            .filter(|slot| slot.session.state == state)
            .count())
    }

    /// Forget sessions that ended more than `older_than` ago
    pub fn purge_ended(&self, older_than: Duration) -> Result<Vec<SessionId>> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchError::lock_poisoned("session registry"))?;

        let expired: Vec<SessionId> = sessions
            .values()
            .filter(|slot| {
                slot.session
                    .ended_at
                    .is_some_and(|ended_at| elapsed_since(ended_at) > older_than)
            })
            .map(|slot| slot.session.session_id)
            .collect();
        for session_id in &expired {
            sessions.remove(session_id);
        }
        Ok(expired)
    }

    /// Participant ids of a session, for callers that only need the mapping
    pub fn participants(&self, session_id: SessionId) -> Result<Vec<UserId>> {
        Ok(self.get(session_id)?.participant_ids)
    }
}
