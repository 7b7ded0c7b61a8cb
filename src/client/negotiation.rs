//! Media negotiation seam used by the client controller
//!
//! The controller never looks inside session descriptions or candidates; it
//! only moves them between the [`MediaNegotiator`] and the relay.

use crate::error::{MatchError, Result};
use crate::types::{SignalKind, SignalMessage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Local half of a negotiation: a session description plus the connectivity
/// candidates gathered for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDescription {
    pub sdp: String,
    pub candidates: Vec<String>,
}

/// Camera/microphone access and peer connection negotiation
#[async_trait]
pub trait MediaNegotiator: Send {
    /// Make sure local capture devices are available; fails with `MediaUnavailable`
    async fn acquire_media(&mut self) -> Result<()>;

    /// Start a negotiation as the initiating side
    async fn create_offer(&mut self) -> Result<LocalDescription>;

    /// Apply the remote offer and produce the answer
    async fn accept_offer(&mut self, offer: &str) -> Result<LocalDescription>;

    /// Apply the remote answer to a previously created offer
    async fn apply_answer(&mut self, answer: &str) -> Result<()>;

    /// Add a remote connectivity candidate; requires the remote description
    async fn add_ice_candidate(&mut self, candidate: &str) -> Result<()>;

    /// Tear down the peer connection; the negotiator can be reused afterwards
    async fn close(&mut self);
}

/// Holds remote negotiation messages that arrive before the remote
/// description has been applied, then hands them back in arrival order
#[derive(Debug, Default)]
pub struct NegotiationBuffer {
    remote_applied: bool,
    pending: VecDeque<SignalMessage>,
}

impl NegotiationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// Whether `message` must wait for the remote description
    pub fn must_wait(&self, message: &SignalMessage) -> bool {
        !self.remote_applied && message.kind == SignalKind::IceCandidate
    }

    pub fn push(&mut self, message: SignalMessage) {
        self.pending.push_back(message);
    }

    /// Mark the remote description applied and take everything held so far
    pub fn mark_remote_applied(&mut self) -> Vec<SignalMessage> {
        self.remote_applied = true;
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What a [`MockNegotiator`] has seen; shared between clones
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationLog {
    pub media_acquired: bool,
    pub local_description: Option<String>,
    pub remote_description: Option<String>,
    pub local_candidates: Vec<String>,
    pub remote_candidates: Vec<String>,
    pub closed: usize,
}

impl NegotiationLog {
    /// Both descriptions exchanged
    pub fn is_negotiated(&self) -> bool {
        self.local_description.is_some() && self.remote_description.is_some()
    }
}

/// Scripted negotiator for tests and the simulator
///
/// Descriptions and candidates are derived from the label so the other side's
/// log shows exactly what was relayed.
#[derive(Debug, Clone)]
pub struct MockNegotiator {
    label: String,
    media_available: bool,
    candidate_count: usize,
    log: Arc<Mutex<NegotiationLog>>,
}

impl MockNegotiator {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            media_available: true,
            candidate_count: 2,
            log: Arc::new(Mutex::new(NegotiationLog::default())),
        }
    }

    /// A negotiator whose camera is missing
    pub fn without_media(label: &str) -> Self {
        Self {
            media_available: false,
            ..Self::new(label)
        }
    }

    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidate_count = count;
        self
    }

    /// Snapshot of the negotiation so far
    pub fn log(&self) -> NegotiationLog {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn update<T>(&self, f: impl FnOnce(&mut NegotiationLog) -> Result<T>) -> Result<T> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| MatchError::lock_poisoned("negotiation log"))?;
        f(&mut log)
    }

    fn local(&self, kind: &str) -> LocalDescription {
        LocalDescription {
            sdp: format!("{}:{}", kind, self.label),
            candidates: (0..self.candidate_count)
                .map(|i| format!("candidate:{}:{}", self.label, i))
                .collect(),
        }
    }
}

#[async_trait]
impl MediaNegotiator for MockNegotiator {
    async fn acquire_media(&mut self) -> Result<()> {
        if !self.media_available {
            return Err(MatchError::MediaUnavailable {
                reason: format!("no capture device for {}", self.label),
            }
            .into());
        }
        self.update(|log| {
            log.media_acquired = true;
            Ok(())
        })
    }

    async fn create_offer(&mut self) -> Result<LocalDescription> {
        let local = self.local("offer");
        self.update(|log| {
            log.local_description = Some(local.sdp.clone());
            log.local_candidates = local.candidates.clone();
            Ok(())
        })?;
        Ok(local)
    }

    async fn accept_offer(&mut self, offer: &str) -> Result<LocalDescription> {
        let local = self.local("answer");
        self.update(|log| {
            log.remote_description = Some(offer.to_string());
            log.local_description = Some(local.sdp.clone());
            log.local_candidates = local.candidates.clone();
            Ok(())
        })?;
        Ok(local)
    }

    async fn apply_answer(&mut self, answer: &str) -> Result<()> {
        self.update(|log| {
            if log.local_description.is_none() {
                return Err(MatchError::InvalidCommand {
                    reason: "answer without a local offer".to_string(),
                }
                .into());
            }
            log.remote_description = Some(answer.to_string());
            Ok(())
        })
    }

    async fn add_ice_candidate(&mut self, candidate: &str) -> Result<()> {
        self.update(|log| {
            if log.remote_description.is_none() {
                return Err(MatchError::InvalidCommand {
                    reason: "candidate before remote description".to_string(),
                }
                .into());
            }
            log.remote_candidates.push(candidate.to_string());
            Ok(())
        })
    }

    async fn close(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.local_description = None;
            log.remote_description = None;
            log.local_candidates.clear();
            log.remote_candidates.clear();
            log.closed += 1;
        }
    }
}
