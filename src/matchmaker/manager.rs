//! The matchmaker: turns waiting users into sessions
//!
//! Every state change to queue entries and session lifecycle goes through this
//! type. Mutations are serialized by a single async mutex, and entries are only
//! marked through the queue's compare-and-swap, so no entry can be selected
//! for two sessions.
//!
//! Pairing is two-phase. A round reserves two entries for a new `Forming`
//! session; each side then attaches through [`Matchmaker::join_session`] and the
//! second attach activates the session and consumes both entries. If one side
//! cancels while the session is forming, the other keeps its reservation and the
//! next round fills the empty seat with the oldest compatible searcher.

use crate::amqp::publisher::EventPublisher;
use crate::config::AppConfig;
use crate::error::{MatchError, Result};
use crate::matchmaker::matching::{FifoPairingStrategy, PairingStrategy};
use crate::metrics::MetricsCollector;
use crate::queue::WaitingQueue;
use crate::session::SessionRegistry;
use crate::types::{
    EndReason, QueueEntry, SearchFilters, Session, SessionActivated, SessionEnded, SessionId,
    SessionMatched, SessionState, UserId, UserQueued,
};
use crate::utils::{current_timestamp, elapsed_since};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Timing settings for the matchmaker
#[derive(Debug, Clone)]
pub struct MatchmakerSettings {
    /// Fallback tick between pairing rounds
    pub poll_interval: Duration,
    /// Forming sessions older than this are abandoned
    pub forming_timeout: Duration,
    /// Unpaired entries older than this are dropped
    pub max_search_time: Duration,
    /// Ended sessions are forgotten after this long
    pub session_retention: Duration,
}

impl Default for MatchmakerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl MatchmakerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            forming_timeout: config.forming_timeout(),
            max_search_time: config.max_search_time(),
            session_retention: config.session_retention(),
        }
    }
}

/// Statistics about matchmaker operations
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MatchmakerStats {
    /// Total searches started
    pub users_queued: u64,
    /// Total sessions created by pairing rounds
    pub sessions_created: u64,
    /// Total sessions that became active
    pub sessions_activated: u64,
    /// Total sessions ended for any reason
    pub sessions_ended: u64,
    /// Total forming sessions that timed out
    pub sessions_abandoned: u64,
    /// Total searches cancelled
    pub searches_cancelled: u64,
    /// Current number of unpaired searchers
    pub users_searching: usize,
    /// Current number of forming sessions
    pub forming_sessions: usize,
    /// Current number of active sessions
    pub active_sessions: usize,
}

/// A started search: the queue entry plus a watch on its pairing
#[derive(Debug)]
pub struct SearchTicket {
    pub entry: QueueEntry,
    /// Holds the session the entry is reserved for; closes when the entry leaves the queue
    pub pairing: watch::Receiver<Option<SessionId>>,
}

/// Outcome of attaching to a session
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub session: Session,
    /// The participant that searched first initiates negotiation
    pub offerer: bool,
}

/// Events gathered while holding the round lock, published after release
#[derive(Default)]
struct PendingEvents {
    matched: Vec<SessionMatched>,
    activated: Vec<SessionActivated>,
    ended: Vec<SessionEnded>,
}

/// The matchmaker
#[derive(Clone)]
pub struct Matchmaker {
    queue: Arc<WaitingQueue>,
    registry: Arc<SessionRegistry>,
    strategy: Arc<dyn PairingStrategy>,
    event_publisher: Arc<dyn EventPublisher>,
    metrics_collector: Arc<MetricsCollector>,
    settings: MatchmakerSettings,
    round_lock: Arc<Mutex<()>>,
    wakeup: Arc<Notify>,
    stats: Arc<RwLock<MatchmakerStats>>,
}

impl Matchmaker {
    /// Create a matchmaker with FIFO pairing
    pub fn new(
        event_publisher: Arc<dyn EventPublisher>,
        metrics_collector: Arc<MetricsCollector>,
        settings: MatchmakerSettings,
    ) -> Self {
        Self::with_strategy(
            Arc::new(FifoPairingStrategy::new()),
            event_publisher,
            metrics_collector,
            settings,
        )
    }

    /// Create a matchmaker with a custom pairing strategy
    pub fn with_strategy(
        strategy: Arc<dyn PairingStrategy>,
        event_publisher: Arc<dyn EventPublisher>,
        metrics_collector: Arc<MetricsCollector>,
        settings: MatchmakerSettings,
    ) -> Self {
        Self {
            queue: Arc::new(WaitingQueue::new()),
            registry: Arc::new(SessionRegistry::new()),
            strategy,
            event_publisher,
            metrics_collector,
            settings,
            round_lock: Arc::new(Mutex::new(())),
            wakeup: Arc::new(Notify::new()),
            stats: Arc::new(RwLock::new(MatchmakerStats::default())),
        }
    }

    pub fn queue(&self) -> Arc<WaitingQueue> {
        self.queue.clone()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn settings(&self) -> &MatchmakerSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics_collector.clone()
    }

    /// Start searching for a peer
    ///
    /// Fails with `AlreadyInSession` while the user is in an active call and with
    /// `AlreadySearching` while the user holds a queue entry.
    pub async fn enqueue(&self, user_id: &str, filters: SearchFilters) -> Result<SearchTicket> {
        let ticket = {
            let _guard = self.round_lock.lock().await;

            if self.registry.active_session_for(user_id)?.is_some() {
                return Err(MatchError::AlreadyInSession {
                    user_id: user_id.to_string(),
                }
                .into());
            }

            let entry = self.queue.enqueue(user_id, filters)?;
            let pairing = self.queue.pairing_watch(user_id)?;
            SearchTicket { entry, pairing }
        };

        self.update_stats(|stats| stats.users_queued += 1);
        self.metrics_collector.record_user_queued();
        let searching = self.queue.count()?;
        info!(
            "User {} started searching ({} searching)",
            user_id, searching
        );

        if let Err(e) = self
            .event_publisher
            .publish_user_queued(UserQueued {
                user_id: user_id.to_string(),
                searching,
                timestamp: current_timestamp(),
            })
            .await
        {
            warn!("Failed to publish UserQueued for {}: {}", user_id, e);
        }

        self.wakeup.notify_one();
        Ok(ticket)
    }

    /// Ticket for a user that is already searching
    pub fn ticket_for(&self, user_id: &str) -> Result<SearchTicket> {
        let entry = self
            .queue
            .get(user_id)?
            .ok_or_else(|| MatchError::NotSearching {
                user_id: user_id.to_string(),
            })?;
        let pairing = self.queue.pairing_watch(user_id)?;
        Ok(SearchTicket { entry, pairing })
    }

    /// Number of users searching without a pairing
    pub fn searching_count(&self) -> Result<usize> {
        self.queue.count()
    }

    /// Run one pairing round; returns the sessions that received new reservations
    pub async fn run_round(&self) -> Result<Vec<SessionId>> {
        let timer = self.metrics_collector.start_timer();
        let mut events = PendingEvents::default();

        let touched = {
            let _guard = self.round_lock.lock().await;
            let mut touched = self.fill_forming_sessions(&mut events)?;
            touched.extend(self.pair_waiting_users(&mut events)?);
            touched
        };

        self.metrics_collector.record_pairing_round(timer.stop());
        self.publish_events(events).await;
        Ok(touched)
    }

    /// Seat the oldest compatible searcher in forming sessions that lost a participant
    fn fill_forming_sessions(&self, events: &mut PendingEvents) -> Result<Vec<SessionId>> {
        let mut touched = Vec::new();

        for session in self.registry.forming_sessions()? {
            let reserved = self.queue.reserved_for(session.session_id)?;
            if reserved.len() >= 2 {
                continue;
            }
            if reserved.is_empty() {
                // Nobody is left to hold the session open
                if let Some(ended) =
                    self.end_locked(session.session_id, None, EndReason::Cancelled)?
                {
                    events.ended.push(ended);
                }
                continue;
            }

            let unpaired = self.queue.list_unpaired()?;
            let Some(joiner) = self.strategy.select_joiner(&reserved, &unpaired) else {
                continue;
            };

            if self
                .queue
                .assign_session(&joiner.user_id, None, Some(session.session_id))?
            {
                let user_ids: Vec<UserId> = reserved
                    .iter()
                    .map(|entry| entry.user_id.clone())
                    .chain(std::iter::once(joiner.user_id.clone()))
                    .collect();
                info!(
                    "Seated {} in forming session {} with {:?}",
                    joiner.user_id, session.session_id, user_ids
                );
                events.matched.push(SessionMatched {
                    session_id: session.session_id,
                    user_ids,
                    timestamp: current_timestamp(),
                });
                touched.push(session.session_id);
            }
        }

        Ok(touched)
    }

    /// Pair unpaired searchers into new forming sessions until no pair remains
    fn pair_waiting_users(&self, events: &mut PendingEvents) -> Result<Vec<SessionId>> {
        let mut created = Vec::new();

        loop {
            let unpaired = self.queue.list_unpaired()?;
            let Some((first, second)) = self.strategy.select_pair(&unpaired) else {
                break;
            };

            let session = self.registry.create()?;
            let session_id = session.session_id;

            if !self
                .queue
                .assign_session(&first.user_id, None, Some(session_id))?
            {
                self.registry.end(session_id, None, EndReason::Cancelled)?;
                continue;
            }
            if !self
                .queue
                .assign_session(&second.user_id, None, Some(session_id))?
            {
                self.queue
                    .assign_session(&first.user_id, Some(session_id), None)?;
                self.registry.end(session_id, None, EndReason::Cancelled)?;
                continue;
            }

            info!(
                "Paired {} and {} into session {}",
                first.user_id, second.user_id, session_id
            );
            self.update_stats(|stats| stats.sessions_created += 1);
            self.metrics_collector.record_session_created();
            events.matched.push(SessionMatched {
                session_id,
                user_ids: vec![first.user_id, second.user_id],
                timestamp: current_timestamp(),
            });
            created.push(session_id);
        }

        Ok(created)
    }

    /// Attach to the session the user's entry is reserved for
    ///
    /// The second participant to attach activates the session, which consumes
    /// both queue entries. Joining a session the user is not reserved for fails
    /// with `SessionNotFound`, which callers treat as a stale pairing.
    pub async fn join_session(&self, session_id: SessionId, user_id: &str) -> Result<JoinOutcome> {
        let mut events = PendingEvents::default();

        let outcome = {
            let _guard = self.round_lock.lock().await;

            let current = self.registry.get(session_id)?;
            if current.is_active() && current.is_participant(user_id) {
                return Ok(JoinOutcome {
                    offerer: current.participant_ids.first().map(String::as_str) == Some(user_id),
                    session: current,
                });
            }

            let reserved = self
                .queue
                .get(user_id)?
                .is_some_and(|entry| entry.session_id == Some(session_id));
            // Oldest search first; it decides who offers
            let order: Vec<UserId> = self
                .queue
                .reserved_for(session_id)?
                .into_iter()
                .map(|entry| entry.user_id)
                .collect();
            if !reserved {
                debug!(
                    "User {} is not reserved for session {}, treating as stale",
                    user_id, session_id
                );
                return Err(MatchError::SessionNotFound {
                    session_id: session_id.to_string(),
                }
                .into());
            }

            let session = self.registry.attach_in_order(session_id, user_id, &order)?;

            if session.is_active() {
                let mut longest_wait = Duration::ZERO;
                for participant in &session.participant_ids {
                    if let Some(entry) = self.queue.dequeue(participant)? {
                        longest_wait = longest_wait.max(elapsed_since(entry.enqueued_at));
                    }
                }
                self.update_stats(|stats| stats.sessions_activated += 1);
                self.metrics_collector.record_session_activated(longest_wait);
                events.activated.push(SessionActivated {
                    session_id,
                    participant_ids: session.participant_ids.clone(),
                    timestamp: current_timestamp(),
                });
            }

            JoinOutcome {
                offerer: order.first().map(String::as_str) == Some(user_id),
                session,
            }
        };

        self.publish_events(events).await;
        Ok(outcome)
    }

    /// Watch a session's lifecycle state
    pub fn session_watch(&self, session_id: SessionId) -> Result<watch::Receiver<SessionState>> {
        self.registry.watch(session_id)
    }

    pub fn session(&self, session_id: SessionId) -> Result<Session> {
        self.registry.get(session_id)
    }

    /// Stop searching
    ///
    /// Removes the user's entry. If the entry was reserved for a forming session
    /// the user is detached and the remaining participant keeps its seat; a
    /// forming session left with nobody is ended. Cancelling without an entry
    /// is a no-op.
    pub async fn cancel(&self, user_id: &str) -> Result<Option<QueueEntry>> {
        let mut events = PendingEvents::default();

        let removed = {
            let _guard = self.round_lock.lock().await;

            let Some(entry) = self.queue.dequeue(user_id)? else {
                return Ok(None);
            };

            if let Some(session_id) = entry.session_id {
                match self.registry.get(session_id) {
                    Ok(session) if session.state == SessionState::Forming => {
                        self.registry.detach(session_id, user_id)?;
                        if self.queue.reserved_for(session_id)?.is_empty() {
                            if let Some(ended) = self.end_locked(
                                session_id,
                                Some(user_id),
                                EndReason::Cancelled,
                            )? {
                                events.ended.push(ended);
                            }
                        } else {
                            info!(
                                "User {} left forming session {}, seat reopened",
                                user_id, session_id
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Cancelled entry pointed at missing session: {}", e),
                }
            }

            entry
        };

        self.update_stats(|stats| stats.searches_cancelled += 1);
        self.metrics_collector.record_search_cancelled();
        info!("User {} cancelled their search", user_id);

        self.publish_events(events).await;
        self.wakeup.notify_one();
        Ok(Some(removed))
    }

    /// End a session
    ///
    /// `user_id` must belong to the session when given. Ending is idempotent:
    /// ending an ended session returns it unchanged.
    pub async fn end_session(
        &self,
        session_id: SessionId,
        user_id: Option<&str>,
        reason: EndReason,
    ) -> Result<Session> {
        let mut events = PendingEvents::default();

        let session = {
            let _guard = self.round_lock.lock().await;

            let current = self.registry.get(session_id)?;
            if let Some(user_id) = user_id {
                let reserved = self
                    .queue
                    .get(user_id)?
                    .is_some_and(|entry| entry.session_id == Some(session_id));
                let ended_by_user = current.ended_by.as_deref() == Some(user_id);
                if !current.is_participant(user_id) && !reserved && !ended_by_user {
                    return Err(MatchError::NotParticipant {
                        session_id: session_id.to_string(),
                        user_id: user_id.to_string(),
                    }
                    .into());
                }
            }

            if let Some(ended) = self.end_locked(session_id, user_id, reason)? {
                events.ended.push(ended);
            }
            self.registry.get(session_id)?
        };

        self.publish_events(events).await;
        self.wakeup.notify_one();
        Ok(session)
    }

    /// Transition to Ended and clean up queue entries; returns the event when newly ended
    fn end_locked(
        &self,
        session_id: SessionId,
        ended_by: Option<&str>,
        reason: EndReason,
    ) -> Result<Option<SessionEnded>> {
        let was_active = self.registry.get(session_id)?.is_active();
        let outcome = self.registry.end(session_id, ended_by, reason)?;
        if !outcome.newly_ended {
            return Ok(None);
        }

        if let Some(user_id) = ended_by {
            self.queue.dequeue(user_id)?;
        }
        if was_active {
            for participant in &outcome.session.participant_ids {
                self.queue.dequeue(participant)?;
            }
        }
        let released = self.queue.release_session(session_id)?;
        if !released.is_empty() {
            debug!(
                "Released {:?} back to searching after session {} ended",
                released, session_id
            );
        }

        let call_duration = outcome
            .session
            .activated_at
            .map(elapsed_since);
        self.update_stats(|stats| {
            stats.sessions_ended += 1;
            if reason == EndReason::Abandoned {
                stats.sessions_abandoned += 1;
            }
        });
        self.metrics_collector
            .record_session_ended(reason, call_duration);

        Ok(Some(SessionEnded {
            session_id,
            participant_ids: outcome.session.participant_ids,
            ended_by: ended_by.map(str::to_string),
            reason,
            timestamp: current_timestamp(),
        }))
    }

    /// End forming sessions older than `timeout`, releasing their reservations
    pub async fn expire_forming(&self, timeout: Duration) -> Result<Vec<SessionId>> {
        let mut events = PendingEvents::default();

        let expired = {
            let _guard = self.round_lock.lock().await;
            let mut expired = Vec::new();
            for session in self.registry.forming_sessions()? {
                if elapsed_since(session.created_at) <= timeout {
                    continue;
                }
                warn!(
                    "Forming session {} timed out with participants {:?}",
                    session.session_id, session.participant_ids
                );
                if let Some(ended) =
                    self.end_locked(session.session_id, None, EndReason::Abandoned)?
                {
                    events.ended.push(ended);
                }
                expired.push(session.session_id);
            }
            expired
        };

        self.publish_events(events).await;
        if !expired.is_empty() {
            self.wakeup.notify_one();
        }
        Ok(expired)
    }

    /// Drop searches past the maximum search time and forget old ended sessions
    pub async fn cleanup(&self) -> Result<usize> {
        let _guard = self.round_lock.lock().await;

        let stale = self.queue.remove_stale(self.settings.max_search_time)?;
        if !stale.is_empty() {
            info!("Removed {} stale searches", stale.len());
            self.metrics_collector.record_stale_entries(stale.len());
        }

        let purged = self.registry.purge_ended(self.settings.session_retention)?;
        if !purged.is_empty() {
            debug!("Purged {} ended sessions", purged.len());
        }

        Ok(stale.len() + purged.len())
    }

    /// Background loop: rounds on every wakeup and on each poll tick
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Matchmaker running (poll every {:?}, forming timeout {:?})",
            self.settings.poll_interval, self.settings.forming_timeout
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Matchmaker loop stopping");
                    break;
                }
                _ = self.wakeup.notified() => {}
                _ = ticker.tick() => {
                    if let Err(e) = self.expire_forming(self.settings.forming_timeout).await {
                        error!("Forming session expiry failed: {}", e);
                    }
                }
            }

            if let Err(e) = self.run_round().await {
                error!("Pairing round failed: {}", e);
            }
        }
    }

    /// Current statistics
    pub fn stats(&self) -> Result<MatchmakerStats> {
        let mut stats = self
            .stats
            .read()
            .map_err(|_| MatchError::lock_poisoned("stats"))?
            .clone();
        stats.users_searching = self.queue.count()?;
        stats.forming_sessions = self.registry.count(SessionState::Forming)?;
        stats.active_sessions = self.registry.count(SessionState::Active)?;
        Ok(stats)
    }

    fn update_stats(&self, update: impl FnOnce(&mut MatchmakerStats)) {
        match self.stats.write() {
            Ok(mut stats) => update(&mut stats),
            Err(_) => warn!("Failed to acquire stats lock"),
        }
    }

    async fn publish_events(&self, events: PendingEvents) {
        for event in events.matched {
            let session_id = event.session_id;
            if let Err(e) = self.event_publisher.publish_session_matched(event).await {
                warn!("Failed to publish SessionMatched for {}: {}", session_id, e);
            }
        }
        for event in events.activated {
            let session_id = event.session_id;
            if let Err(e) = self.event_publisher.publish_session_activated(event).await {
                warn!("Failed to publish SessionActivated for {}: {}", session_id, e);
            }
        }
        for event in events.ended {
            let session_id = event.session_id;
            if let Err(e) = self.event_publisher.publish_session_ended(event).await {
                warn!("Failed to publish SessionEnded for {}: {}", session_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::types::{Campus, MatchmakingEvent};

    fn create_test_matchmaker() -> (Matchmaker, Arc<MockEventPublisher>) {
        let publisher = Arc::new(MockEventPublisher::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let matchmaker = Matchmaker::new(publisher.clone(), metrics, MatchmakerSettings::default());
        (matchmaker, publisher)
    }

    async fn paired_session(matchmaker: &Matchmaker, a: &str, b: &str) -> SessionId {
        matchmaker.enqueue(a, SearchFilters::any()).await.unwrap();
        matchmaker.enqueue(b, SearchFilters::any()).await.unwrap();
        let created = matchmaker.run_round().await.unwrap();
        assert_eq!(created.len(), 1);
        created[0]
    }

    #[tokio::test]
    async fn test_single_user_is_not_paired() {
        let (matchmaker, _) = create_test_matchmaker();
        let ticket = matchmaker
            .enqueue("alice", SearchFilters::any())
            .await
            .unwrap();

        assert!(matchmaker.run_round().await.unwrap().is_empty());
        assert_eq!(*ticket.pairing.borrow(), None);
        assert_eq!(matchmaker.searching_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_round_reserves_both_entries() {
        let (matchmaker, publisher) = create_test_matchmaker();
        let mut alice = matchmaker
            .enqueue("alice", SearchFilters::any())
            .await
            .unwrap();
        let mut bob = matchmaker.enqueue("bob", SearchFilters::any()).await.unwrap();

        let created = matchmaker.run_round().await.unwrap();
        assert_eq!(created.len(), 1);
        let session_id = created[0];

        assert_eq!(*alice.pairing.borrow_and_update(), Some(session_id));
        assert_eq!(*bob.pairing.borrow_and_update(), Some(session_id));
        assert_eq!(
            matchmaker.session(session_id).unwrap().state,
            SessionState::Forming
        );
        assert_eq!(matchmaker.searching_count().unwrap(), 0);
        assert!(publisher
            .get_published_events()
            .contains(&"SessionMatched".to_string()));
    }

    #[tokio::test]
    async fn test_two_joins_activate_and_consume_entries() {
        let (matchmaker, publisher) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;

        // bob attaches first, but alice searched first and offers
        let first = matchmaker.join_session(session_id, "bob").await.unwrap();
        assert!(!first.offerer);
        assert_eq!(first.session.state, SessionState::Forming);

        let second = matchmaker.join_session(session_id, "alice").await.unwrap();
        assert!(second.offerer);
        assert_eq!(second.session.state, SessionState::Active);
        assert_eq!(second.session.participant_ids, vec!["alice", "bob"]);

        assert!(matchmaker.queue().is_empty().unwrap());
        assert!(publisher
            .get_published_events()
            .contains(&"SessionActivated".to_string()));

        // Re-joining an active session is idempotent
        let again = matchmaker.join_session(session_id, "bob").await.unwrap();
        assert!(!again.offerer);
    }

    #[tokio::test]
    async fn test_join_without_reservation_is_stale() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.enqueue("carol", SearchFilters::any()).await.unwrap();

        let err = matchmaker
            .join_session(session_id, "carol")
            .await
            .unwrap_err();
        assert!(MatchError::kind_of(&err).is_some_and(|e| e.is_stale_session()));
    }

    #[tokio::test]
    async fn test_enqueue_rejected_during_active_call() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.join_session(session_id, "alice").await.unwrap();
        matchmaker.join_session(session_id, "bob").await.unwrap();

        let err = matchmaker
            .enqueue("alice", SearchFilters::any())
            .await
            .unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::AlreadyInSession { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_forming_reseats_peer() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.join_session(session_id, "alice").await.unwrap();

        // Bob walks away before attaching
        matchmaker.cancel("bob").await.unwrap();
        let session = matchmaker.session(session_id).unwrap();
        assert_eq!(session.state, SessionState::Forming);
        assert_eq!(
            matchmaker.queue().get("alice").unwrap().unwrap().session_id,
            Some(session_id)
        );

        // Carol takes the open seat on the next round
        let mut carol = matchmaker
            .enqueue("carol", SearchFilters::any())
            .await
            .unwrap();
        let touched = matchmaker.run_round().await.unwrap();
        assert_eq!(touched, vec![session_id]);
        assert_eq!(*carol.pairing.borrow_and_update(), Some(session_id));

        let joined = matchmaker.join_session(session_id, "carol").await.unwrap();
        assert_eq!(joined.session.state, SessionState::Active);
        assert_eq!(joined.session.participant_ids, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_cancel_by_attached_user_detaches() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.join_session(session_id, "alice").await.unwrap();

        matchmaker.cancel("alice").await.unwrap();
        let session = matchmaker.session(session_id).unwrap();
        assert!(session.participant_ids.is_empty());
        assert_eq!(session.state, SessionState::Forming);
    }

    #[tokio::test]
    async fn test_cancel_by_both_ends_forming_session() {
        let (matchmaker, publisher) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;

        matchmaker.cancel("alice").await.unwrap();
        matchmaker.cancel("bob").await.unwrap();

        let session = matchmaker.session(session_id).unwrap();
        assert_eq!(session.state, SessionState::Ended);
        assert_eq!(session.end_reason, Some(EndReason::Cancelled));
        assert!(publisher
            .get_published_events()
            .contains(&"SessionEnded".to_string()));
    }

    #[tokio::test]
    async fn test_lone_user_cancel_empties_queue() {
        let (matchmaker, _) = create_test_matchmaker();
        matchmaker.enqueue("alice", SearchFilters::any()).await.unwrap();
        assert!(matchmaker.run_round().await.unwrap().is_empty());

        assert!(matchmaker.cancel("alice").await.unwrap().is_some());
        assert!(matchmaker.queue().is_empty().unwrap());
        // Second cancel is a no-op
        assert!(matchmaker.cancel("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let (matchmaker, publisher) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.join_session(session_id, "alice").await.unwrap();
        matchmaker.join_session(session_id, "bob").await.unwrap();

        let first = matchmaker
            .end_session(session_id, Some("alice"), EndReason::Hangup)
            .await
            .unwrap();
        let second = matchmaker
            .end_session(session_id, Some("bob"), EndReason::Hangup)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.ended_by.as_deref(), Some("alice"));

        let ended_events = publisher
            .events()
            .into_iter()
            .filter(|event| matches!(event, MatchmakingEvent::SessionEnded(_)))
            .count();
        assert_eq!(ended_events, 1);

        // Both can search again
        matchmaker.enqueue("alice", SearchFilters::any()).await.unwrap();
        matchmaker.enqueue("bob", SearchFilters::any()).await.unwrap();
    }

    #[tokio::test]
    async fn test_end_session_rejects_outsiders() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;

        let err = matchmaker
            .end_session(session_id, Some("mallory"), EndReason::Hangup)
            .await
            .unwrap_err();
        assert!(matches!(
            MatchError::kind_of(&err),
            Some(MatchError::NotParticipant { .. })
        ));
    }

    #[tokio::test]
    async fn test_expire_forming_releases_reservations() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.join_session(session_id, "alice").await.unwrap();

        // Not yet expired
        assert!(matchmaker
            .expire_forming(Duration::from_secs(10))
            .await
            .unwrap()
            .is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let expired = matchmaker
            .expire_forming(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(expired, vec![session_id]);

        let session = matchmaker.session(session_id).unwrap();
        assert_eq!(session.end_reason, Some(EndReason::Abandoned));
        assert_eq!(matchmaker.searching_count().unwrap(), 2);

        // Released users pair again
        let created = matchmaker.run_round().await.unwrap();
        assert_eq!(created.len(), 1);
        assert_ne!(created[0], session_id);
        assert_eq!(matchmaker.stats().unwrap().sessions_abandoned, 1);
    }

    #[tokio::test]
    async fn test_filters_keep_incompatible_users_apart() {
        let (matchmaker, _) = create_test_matchmaker();
        let diliman = SearchFilters {
            campus: Campus::Diliman,
            ..SearchFilters::default()
        };
        let cebu = SearchFilters {
            campus: Campus::Cebu,
            ..SearchFilters::default()
        };
        matchmaker.enqueue("alice", diliman.clone()).await.unwrap();
        matchmaker.enqueue("bob", cebu).await.unwrap();
        assert!(matchmaker.run_round().await.unwrap().is_empty());

        matchmaker.enqueue("carol", diliman).await.unwrap();
        let created = matchmaker.run_round().await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(
            matchmaker.queue().get("bob").unwrap().unwrap().session_id,
            None
        );
    }

    #[tokio::test]
    async fn test_stats_tracking() {
        let (matchmaker, _) = create_test_matchmaker();
        let session_id = paired_session(&matchmaker, "alice", "bob").await;
        matchmaker.enqueue("carol", SearchFilters::any()).await.unwrap();

        let stats = matchmaker.stats().unwrap();
        assert_eq!(stats.users_queued, 3);
        assert_eq!(stats.sessions_created, 1);
        assert_eq!(stats.users_searching, 1);
        assert_eq!(stats.forming_sessions, 1);

        matchmaker.join_session(session_id, "alice").await.unwrap();
        matchmaker.join_session(session_id, "bob").await.unwrap();
        let stats = matchmaker.stats().unwrap();
        assert_eq!(stats.sessions_activated, 1);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.forming_sessions, 0);
    }

    #[tokio::test]
    async fn test_run_loop_pairs_on_enqueue() {
        let (matchmaker, _) = create_test_matchmaker();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = matchmaker.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        let mut alice = matchmaker
            .enqueue("alice", SearchFilters::any())
            .await
            .unwrap();
        matchmaker.enqueue("bob", SearchFilters::any()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), alice.pairing.wait_for(Option::is_some))
            .await
            .expect("paired within the poll interval")
            .unwrap();

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
