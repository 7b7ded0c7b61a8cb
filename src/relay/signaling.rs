//! Signaling relay between the two participants of a session
//!
//! Senders are checked against the session registry and every message is
//! wrapped in a [`RelayEnvelope`] carrying a unique message id and a
//! per-sender sequence number. Subscribers use both to undo whatever the
//! transport did: duplicates are dropped by id and out-of-order deliveries are
//! held until their predecessors arrive.
//!
//! The relay also keeps a short replay log per session so a participant that
//! subscribes after its peer already sent (typically the answerer receiving the
//! offer) still sees everything.

use crate::config::RelaySettings;
use crate::error::{MatchError, Result};
use crate::metrics::collector::signal_label;
use crate::metrics::MetricsCollector;
use crate::relay::channel::{ChannelSubscription, RealtimeChannel};
use crate::session::SessionRegistry;
use crate::types::{MessageId, RelayEvent, SessionId, SessionState, SignalKind, SignalMessage, UserId};
use crate::utils::{current_timestamp, generate_message_id, session_channel_key};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// Content of a relayed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayBody {
    Signal { kind: SignalKind, payload: String },
    Chat { text: String },
    ProfileRevealed,
}

impl RelayBody {
    fn label(&self) -> &'static str {
        match self {
            RelayBody::Signal { kind, .. } => signal_label(*kind),
            RelayBody::Chat { .. } => "chat",
            RelayBody::ProfileRevealed => "profile_revealed",
        }
    }
}

/// Wire format of everything the relay publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    /// Starts at 1 for each sender within a session
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
    pub body: RelayBody,
}

impl RelayEnvelope {
    pub fn new(session_id: SessionId, sender_id: &str, seq: u64, body: RelayBody) -> Self {
        Self {
            message_id: generate_message_id(),
            session_id,
            sender_id: sender_id.to_string(),
            seq,
            sent_at: current_timestamp(),
            body,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            MatchError::InternalError {
                message: format!("Failed to serialize relay envelope: {}", e),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            MatchError::ChannelFailed {
                message: format!("Malformed relay envelope: {}", e),
            }
            .into()
        })
    }

    fn into_event(self) -> RelayEvent {
        match self.body {
            RelayBody::Signal { kind, payload } => RelayEvent::Signal(SignalMessage {
                session_id: self.session_id,
                kind,
                payload,
                sender_id: self.sender_id,
            }),
            RelayBody::Chat { text } => RelayEvent::Chat {
                sender_id: self.sender_id,
                text,
            },
            RelayBody::ProfileRevealed => RelayEvent::ProfileRevealed {
                sender_id: self.sender_id,
            },
        }
    }
}

#[derive(Default)]
struct SessionLog {
    next_seq: HashMap<UserId, u64>,
    replay: VecDeque<Vec<u8>>,
    /// Held across publish-and-commit and across subscribe-and-snapshot
    gate: Arc<AsyncMutex<()>>,
}

/// Per-session relay over a [`RealtimeChannel`]
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
    channel: Arc<dyn RealtimeChannel>,
    metrics_collector: Arc<MetricsCollector>,
    settings: RelaySettings,
    logs: Mutex<HashMap<SessionId, SessionLog>>,
}

impl SignalingRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        channel: Arc<dyn RealtimeChannel>,
        metrics_collector: Arc<MetricsCollector>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            registry,
            channel,
            metrics_collector,
            settings,
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Relay a negotiation message to the other participant
    pub async fn send(
        &self,
        session_id: SessionId,
        sender_id: &str,
        message: SignalMessage,
    ) -> Result<MessageId> {
        if message.session_id != session_id || message.sender_id != sender_id {
            self.metrics_collector.record_relay_rejected("mismatched");
            return Err(MatchError::InvalidCommand {
                reason: format!(
                    "signal for session {} from {} sent as {} in {}",
                    message.session_id, message.sender_id, sender_id, session_id
                ),
            }
            .into());
        }

        self.publish(
            session_id,
            sender_id,
            RelayBody::Signal {
                kind: message.kind,
                payload: message.payload,
            },
        )
        .await
    }

    /// Relay an in-call chat line
    pub async fn send_chat(
        &self,
        session_id: SessionId,
        sender_id: &str,
        text: &str,
    ) -> Result<MessageId> {
        self.publish(
            session_id,
            sender_id,
            RelayBody::Chat {
                text: text.to_string(),
            },
        )
        .await
    }

    /// Tell the peer the sender chose to reveal their profile
    pub async fn reveal_profile(&self, session_id: SessionId, sender_id: &str) -> Result<MessageId> {
        self.publish(session_id, sender_id, RelayBody::ProfileRevealed)
            .await
    }

    async fn publish(
        &self,
        session_id: SessionId,
        sender_id: &str,
        body: RelayBody,
    ) -> Result<MessageId> {
        self.authorize_send(session_id, sender_id)?;
        let label = body.label();

        let gate = self.gate(session_id)?;
        let _turn = gate.lock().await;

        let seq = self
            .logs
            .lock()
            .map_err(|_| MatchError::lock_poisoned("relay log"))?
            .get(&session_id)
            .and_then(|log| log.next_seq.get(sender_id).copied())
            .unwrap_or(0)
            + 1;
        let envelope = RelayEnvelope::new(session_id, sender_id, seq, body);
        let message_id = envelope.message_id;
        let bytes = envelope.to_bytes()?;

        // Nothing is recorded unless the transport took the message
        self.channel
            .publish(&session_channel_key(session_id), bytes.clone())
            .await?;

        {
            let mut logs = self
                .logs
                .lock()
                .map_err(|_| MatchError::lock_poisoned("relay log"))?;
            if let Some(log) = logs.get_mut(&session_id) {
                log.next_seq.insert(sender_id.to_string(), seq);
                log.replay.push_back(bytes);
                while log.replay.len() > self.settings.replay_log_size {
                    log.replay.pop_front();
                }
            }
        }
        self.metrics_collector.record_relay_sent(label);
        debug!(
            "Relayed {} {} from {} in session {}",
            label, message_id, sender_id, session_id
        );
        Ok(message_id)
    }

    fn authorize_send(&self, session_id: SessionId, sender_id: &str) -> Result<()> {
        let session = self.registry.get(session_id)?;

        if !session.is_participant(sender_id) {
            self.metrics_collector.record_relay_rejected("not_participant");
            return Err(MatchError::NotParticipant {
                session_id: session_id.to_string(),
                user_id: sender_id.to_string(),
            }
            .into());
        }
        if !session.is_active() {
            self.metrics_collector.record_relay_rejected("not_active");
            if session.is_ended() {
                self.forget(session_id);
            }
            return Err(MatchError::SessionNotActive {
                session_id: session_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Receive the other participant's messages for a session
    pub async fn subscribe(&self, session_id: SessionId, user_id: &str) -> Result<RelaySubscription> {
        let session = self.registry.get(session_id)?;
        if !session.is_participant(user_id) {
            return Err(MatchError::NotParticipant {
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
            }
            .into());
        }
        if session.is_ended() {
            return Err(MatchError::SessionNotActive {
                session_id: session_id.to_string(),
            }
            .into());
        }

        let state = self.registry.watch(session_id)?;
        let gate = self.gate(session_id)?;
        let _turn = gate.lock().await;
        // No send can land between the transport subscription and the log snapshot
        let transport = self
            .channel
            .subscribe(&session_channel_key(session_id))
            .await?;
        let replay: VecDeque<Vec<u8>> = self
            .logs
            .lock()
            .map_err(|_| MatchError::lock_poisoned("relay log"))?
            .get(&session_id)
            .map(|log| log.replay.clone())
            .unwrap_or_default();

        self.metrics_collector.subscription_opened();
        debug!(
            "User {} subscribed to session {} ({} replayed)",
            user_id,
            session_id,
            replay.len()
        );

        Ok(RelaySubscription {
            session_id,
            user_id: user_id.to_string(),
            registry: self.registry.clone(),
            metrics_collector: self.metrics_collector.clone(),
            state,
            transport,
            replay,
            ready: VecDeque::new(),
            seen: DedupWindow::new(self.settings.dedup_window),
            expected: HashMap::new(),
            held: HashMap::new(),
            max_held: self.settings.max_reorder_buffer,
            finished: false,
        })
    }

    fn gate(&self, session_id: SessionId) -> Result<Arc<AsyncMutex<()>>> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| MatchError::lock_poisoned("relay log"))?;
        Ok(logs.entry(session_id).or_default().gate.clone())
    }

    fn forget(&self, session_id: SessionId) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.remove(&session_id);
        }
    }

    /// Drop replay logs of sessions that ended or were purged
    pub fn prune_ended(&self) -> Result<usize> {
        let mut logs = self
            .logs
            .lock()
            .map_err(|_| MatchError::lock_poisoned("relay log"))?;
        let before = logs.len();
        logs.retain(|session_id, _| {
            self.registry
                .get(*session_id)
                .is_ok_and(|session| !session.is_ended())
        });
        Ok(before - logs.len())
    }
}

/// Bounded set of recently seen message ids
struct DedupWindow {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the id was already seen
    fn insert(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// One participant's view of a session's relay traffic
///
/// Yields only the other participant's messages, in the order they were sent.
/// Once the session ends the subscription yields `PeerLeft` (if the other side
/// ended it) and then `None`; anything still undelivered at that point is
/// discarded.
pub struct RelaySubscription {
    session_id: SessionId,
    user_id: UserId,
    registry: Arc<SessionRegistry>,
    metrics_collector: Arc<MetricsCollector>,
    state: watch::Receiver<SessionState>,
    transport: ChannelSubscription,
    replay: VecDeque<Vec<u8>>,
    ready: VecDeque<RelayEvent>,
    seen: DedupWindow,
    expected: HashMap<UserId, u64>,
    held: HashMap<UserId, BTreeMap<u64, RelayEnvelope>>,
    max_held: usize,
    finished: bool,
}

impl RelaySubscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event from the peer; `None` once the session is over
    ///
    /// Cancel-safe: dropping the future between polls loses nothing.
    pub async fn next(&mut self) -> Option<RelayEvent> {
        loop {
            if self.finished {
                return self.ready.pop_front();
            }
            if *self.state.borrow() == SessionState::Ended {
                self.finish();
                continue;
            }
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            if let Some(bytes) = self.replay.pop_front() {
                self.ingest(&bytes);
                continue;
            }

            tokio::select! {
                biased;
                changed = self.state.changed() => {
                    if changed.is_err() {
                        self.finish();
                    }
                }
                payload = self.transport.recv() => match payload {
                    Some(bytes) => self.ingest(&bytes),
                    None => {
                        warn!(
                            "Relay transport closed for {} in session {}",
                            self.user_id, self.session_id
                        );
                        self.finish();
                    }
                },
            }
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let envelope = match RelayEnvelope::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping relay payload in session {}: {}", self.session_id, e);
                return;
            }
        };
        if envelope.session_id != self.session_id || envelope.sender_id == self.user_id {
            return;
        }
        if !self.seen.insert(envelope.message_id) {
            self.metrics_collector.record_duplicate_dropped();
            return;
        }

        let sender = envelope.sender_id.clone();
        let expected = *self.expected.get(&sender).unwrap_or(&1);
        if envelope.seq < expected {
            self.metrics_collector.record_duplicate_dropped();
            return;
        }
        if envelope.seq > expected {
            self.metrics_collector.record_out_of_order();
        }

        let held = self.held.entry(sender.clone()).or_default();
        held.insert(envelope.seq, envelope);
        if held.len() > self.max_held {
            // Give up on the gap and resume from the oldest held message
            if let Some(oldest) = held.keys().next().copied() {
                warn!(
                    "Skipping relay gap from {} in session {} ({} -> {})",
                    sender, self.session_id, expected, oldest
                );
                self.expected.insert(sender.clone(), oldest);
            }
        }
        self.release_in_order(&sender);
    }

    fn release_in_order(&mut self, sender: &str) {
        loop {
            let expected = *self.expected.get(sender).unwrap_or(&1);
            let Some(envelope) = self
                .held
                .get_mut(sender)
                .and_then(|held| held.remove(&expected))
            else {
                break;
            };

            self.metrics_collector
                .record_relay_delivered(envelope.body.label());
            self.ready.push_back(envelope.into_event());
            self.expected.insert(sender.to_string(), expected + 1);
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.ready.clear();
        self.replay.clear();
        self.held.clear();

        if let Ok(session) = self.registry.get(self.session_id) {
            if let Some(ended_by) = session.ended_by {
                if ended_by != self.user_id {
                    self.ready.push_back(RelayEvent::PeerLeft { user_id: ended_by });
                }
            }
        }
        debug!(
            "Relay subscription of {} in session {} finished",
            self.user_id, self.session_id
        );
    }
}

impl Drop for RelaySubscription {
    fn drop(&mut self) {
        self.metrics_collector.subscription_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::channel::InMemoryChannel;
    use crate::types::EndReason;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        channel: Arc<InMemoryChannel>,
        relay: SignalingRelay,
        session_id: SessionId,
    }

    fn active_fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let channel = Arc::new(InMemoryChannel::new());
        let relay = SignalingRelay::new(
            registry.clone(),
            channel.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
            RelaySettings::default(),
        );
        let session = registry.create().unwrap();
        registry.attach(session.session_id, "alice").unwrap();
        registry.attach(session.session_id, "bob").unwrap();
        Fixture {
            registry,
            channel,
            relay,
            session_id: session.session_id,
        }
    }

    fn offer(session_id: SessionId, sender: &str, payload: &str) -> SignalMessage {
        SignalMessage::new(session_id, sender, SignalKind::Offer, payload)
    }

    async fn next_within(subscription: &mut RelaySubscription) -> Option<RelayEvent> {
        tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("relay event within a second")
    }

    /// Channel that refuses publishes while `failing` is set
    struct SwitchableChannel {
        inner: InMemoryChannel,
        failing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RealtimeChannel for SwitchableChannel {
        async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MatchError::ChannelFailed {
                    message: "transport down".to_string(),
                }
                .into());
            }
            self.inner.publish(key, payload).await
        }

        async fn subscribe(&self, key: &str) -> Result<ChannelSubscription> {
            self.inner.subscribe(key).await
        }
    }

    fn signal_payload(event: Option<RelayEvent>) -> String {
        match event {
            Some(RelayEvent::Signal(signal)) => signal.payload,
            other => panic!("expected a signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_publish_leaves_no_trace() {
        let registry = Arc::new(SessionRegistry::new());
        let channel = Arc::new(SwitchableChannel {
            inner: InMemoryChannel::new(),
            failing: AtomicBool::new(false),
        });
        let relay = SignalingRelay::new(
            registry.clone(),
            channel.clone(),
            Arc::new(MetricsCollector::new().unwrap()),
            RelaySettings::default(),
        );
        let session_id = registry.create().unwrap().session_id;
        registry.attach(session_id, "alice").unwrap();
        registry.attach(session_id, "bob").unwrap();
        let mut live = relay.subscribe(session_id, "bob").await.unwrap();

        relay
            .send(session_id, "alice", offer(session_id, "alice", "first"))
            .await
            .unwrap();
        channel.failing.store(true, Ordering::SeqCst);
        assert!(relay
            .send(session_id, "alice", offer(session_id, "alice", "lost"))
            .await
            .is_err());
        channel.failing.store(false, Ordering::SeqCst);
        relay
            .send(session_id, "alice", offer(session_id, "alice", "second"))
            .await
            .unwrap();

        // The live subscriber is not stuck behind the failed message
        assert_eq!(signal_payload(next_within(&mut live).await), "first");
        assert_eq!(signal_payload(next_within(&mut live).await), "second");

        // A late subscriber replays only what the transport accepted
        let mut late = relay.subscribe(session_id, "bob").await.unwrap();
        assert_eq!(signal_payload(next_within(&mut late).await), "first");
        assert_eq!(signal_payload(next_within(&mut late).await), "second");
        let quiet = tokio::time::timeout(Duration::from_millis(50), late.next()).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_message_reaches_peer_only() {
        let f = active_fixture();
        let mut alice = f.relay.subscribe(f.session_id, "alice").await.unwrap();
        let mut bob = f.relay.subscribe(f.session_id, "bob").await.unwrap();

        f.relay
            .send(f.session_id, "alice", offer(f.session_id, "alice", "sdp-a"))
            .await
            .unwrap();
        f.relay
            .send_chat(f.session_id, "bob", "hello")
            .await
            .unwrap();

        match next_within(&mut bob).await {
            Some(RelayEvent::Signal(signal)) => {
                assert_eq!(signal.kind, SignalKind::Offer);
                assert_eq!(signal.payload, "sdp-a");
                assert_eq!(signal.sender_id, "alice");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // Alice never sees her own offer, only Bob's chat
        assert_eq!(
            next_within(&mut alice).await,
            Some(RelayEvent::Chat {
                sender_id: "bob".to_string(),
                text: "hello".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay() {
        let f = active_fixture();
        f.relay
            .send(f.session_id, "alice", offer(f.session_id, "alice", "early"))
            .await
            .unwrap();

        let mut bob = f.relay.subscribe(f.session_id, "bob").await.unwrap();
        assert!(matches!(
            next_within(&mut bob).await,
            Some(RelayEvent::Signal(SignalMessage { ref payload, .. })) if payload == "early"
        ));
    }

    #[tokio::test]
    async fn test_duplicates_and_reordering_are_undone() {
        let f = active_fixture();
        let mut bob = f.relay.subscribe(f.session_id, "bob").await.unwrap();
        let key = session_channel_key(f.session_id);

        let chat = |seq: u64, text: &str| {
            RelayEnvelope::new(
                f.session_id,
                "alice",
                seq,
                RelayBody::Chat {
                    text: text.to_string(),
                },
            )
        };
        let first = chat(1, "one");
        let second = chat(2, "two");
        let third = chat(3, "three");

        for envelope in [&third, &first, &first, &second, &third] {
            f.channel
                .publish(&key, envelope.to_bytes().unwrap())
                .await
                .unwrap();
        }

        let mut texts = Vec::new();
        for _ in 0..3 {
            if let Some(RelayEvent::Chat { text, .. }) = next_within(&mut bob).await {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["one", "two", "three"]);

        let nothing = tokio::time::timeout(Duration::from_millis(30), bob.next()).await;
        assert!(nothing.is_err(), "duplicates must not be delivered");
    }

    #[tokio::test]
    async fn test_end_yields_peer_left_then_nothing() {
        let f = active_fixture();
        let mut bob = f.relay.subscribe(f.session_id, "bob").await.unwrap();

        f.relay
            .send_chat(f.session_id, "alice", "bye")
            .await
            .unwrap();
        f.registry
            .end(f.session_id, Some("alice"), EndReason::Hangup)
            .unwrap();

        // The undelivered chat is discarded once the session is over
        assert_eq!(
            next_within(&mut bob).await,
            Some(RelayEvent::PeerLeft {
                user_id: "alice".to_string()
            })
        );
        assert_eq!(next_within(&mut bob).await, None);
        assert_eq!(next_within(&mut bob).await, None);
    }

    #[tokio::test]
    async fn test_own_end_yields_no_peer_left() {
        let f = active_fixture();
        let mut alice = f.relay.subscribe(f.session_id, "alice").await.unwrap();

        f.registry
            .end(f.session_id, Some("alice"), EndReason::Skip)
            .unwrap();
        assert_eq!(next_within(&mut alice).await, None);
    }

    #[tokio::test]
    async fn test_send_after_end_is_rejected() {
        let f = active_fixture();
        f.registry
            .end(f.session_id, Some("bob"), EndReason::Hangup)
            .unwrap();

        let err = f
            .relay
            .send_chat(f.session_id, "alice", "anyone?")
            .await
            .unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::SessionNotActive { .. })
        ));
        assert!(f.relay.subscribe(f.session_id, "alice").await.is_err());
    }

    #[tokio::test]
    async fn test_outsiders_are_rejected() {
        let f = active_fixture();

        let err = f
            .relay
            .send(f.session_id, "mallory", offer(f.session_id, "mallory", "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::NotParticipant { .. })
        ));
        assert!(f.relay.subscribe(f.session_id, "mallory").await.is_err());

        // Spoofed sender field
        let err = f
            .relay
            .send(f.session_id, "alice", offer(f.session_id, "bob", "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::InvalidCommand { .. })
        ));
    }

    #[tokio::test]
    async fn test_forming_session_rejects_send() {
        let registry = Arc::new(SessionRegistry::new());
        let relay = SignalingRelay::new(
            registry.clone(),
            Arc::new(InMemoryChannel::new()),
            Arc::new(MetricsCollector::new().unwrap()),
            RelaySettings::default(),
        );
        let session = registry.create().unwrap();
        registry.attach(session.session_id, "alice").unwrap();

        let err = relay
            .reveal_profile(session.session_id, "alice")
            .await
            .unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::SessionNotActive { .. })
        ));
    }

    #[tokio::test]
    async fn test_prune_ended_drops_logs() {
        let f = active_fixture();
        f.relay
            .send_chat(f.session_id, "alice", "hi")
            .await
            .unwrap();
        assert_eq!(f.relay.prune_ended().unwrap(), 0);

        f.registry
            .end(f.session_id, None, EndReason::Hangup)
            .unwrap();
        assert_eq!(f.relay.prune_ended().unwrap(), 1);
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = RelayEnvelope::new(
            uuid::Uuid::new_v4(),
            "alice",
            1,
            RelayBody::Signal {
                kind: SignalKind::IceCandidate,
                payload: "candidate:1".to_string(),
            },
        );
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["seq"], 1);
        assert_eq!(json["body"]["type"], "signal");
        assert_eq!(json["body"]["kind"], "IceCandidate");
    }
}
