//! Per-user client session controller
//!
//! One controller task runs per connected user. It owns the user's current
//! phase (idle, searching, or in a call) and drives the matchmaker, the relay
//! and the media negotiator in response to user commands and to pairing and
//! relay notifications. Front ends talk to it only through a
//! [`ControllerHandle`].

use crate::client::negotiation::{MediaNegotiator, NegotiationBuffer};
use crate::config::AppConfig;
use crate::directory::Directory;
use crate::error::{MatchError, Result};
use crate::matchmaker::Matchmaker;
use crate::relay::{RelaySubscription, SignalingRelay};
use crate::types::{
    EndReason, PeerProfile, RelayEvent, SearchFilters, Session, SessionId, SessionState,
    SignalKind, SignalMessage, UserId,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What the user currently sees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerState {
    Idle,
    Searching,
    Connected,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "Idle"),
            ControllerState::Searching => write!(f, "Searching"),
            ControllerState::Connected => write!(f, "Connected"),
        }
    }
}

/// User intents accepted by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCommand {
    StartSearch { filters: SearchFilters },
    Cancel,
    End,
    Skip,
    SendChat { text: String },
    RevealProfile,
    Shutdown,
}

/// Everything the controller reports back to the front end
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    StateChanged(ControllerState),
    /// Number of users currently searching
    SearchProgress { searching: usize },
    /// The peer of a new call; `None` when the directory has no profile
    PeerResolved {
        session_id: SessionId,
        profile: Option<PeerProfile>,
    },
    ChatReceived { text: String },
    PeerRevealed { profile: Option<PeerProfile> },
    /// Human-readable status for toasts
    Notice(String),
    CallEnded { reason: EndReason },
}

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Fallback check for a pairing while searching
    pub poll_interval: Duration,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            command_capacity: 32,
            event_capacity: 128,
        }
    }
}

/// Cloneable front-end side of a controller
#[derive(Clone)]
pub struct ControllerHandle {
    user_id: UserId,
    commands: mpsc::Sender<ControllerCommand>,
    events: broadcast::Sender<ControllerEvent>,
    state: watch::Receiver<ControllerState>,
}

impl ControllerHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn send(&self, command: ControllerCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| {
            MatchError::InternalError {
                message: format!("Controller for {} has stopped", self.user_id),
            }
            .into()
        })
    }

    pub async fn start_search(&self, filters: SearchFilters) -> Result<()> {
        self.send(ControllerCommand::StartSearch { filters }).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.send(ControllerCommand::Cancel).await
    }

    pub async fn end(&self) -> Result<()> {
        self.send(ControllerCommand::End).await
    }

    pub async fn skip(&self) -> Result<()> {
        self.send(ControllerCommand::Skip).await
    }

    pub async fn send_chat(&self, text: &str) -> Result<()> {
        self.send(ControllerCommand::SendChat {
            text: text.to_string(),
        })
        .await
    }

    pub async fn reveal_profile(&self) -> Result<()> {
        self.send(ControllerCommand::RevealProfile).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControllerCommand::Shutdown).await
    }

    /// Receive events emitted from now on
    pub fn events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ControllerState> {
        self.state.clone()
    }

    /// Wait until the controller reaches `target`
    pub async fn wait_for_state(&self, target: ControllerState, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|current| *current == target))
            .await
            .map_err(|_| MatchError::InternalError {
                message: format!(
                    "{} did not reach {} within {:?} (now {})",
                    self.user_id,
                    target,
                    timeout,
                    self.state()
                ),
            })?
            .map_err(|_| MatchError::InternalError {
                message: format!("Controller for {} has stopped", self.user_id),
            })?;
        Ok(())
    }
}

struct PendingJoin {
    session_id: SessionId,
    state: watch::Receiver<SessionState>,
}

struct SearchContext {
    /// Closed once the queue entry is gone
    pairing: Option<watch::Receiver<Option<SessionId>>>,
    /// Attached to a forming session, waiting for the peer
    pending: Option<PendingJoin>,
}

/// Per-call resources; dropped on every exit from a call
struct CallContext {
    session_id: SessionId,
    peer_id: Option<UserId>,
    peer_profile: Option<PeerProfile>,
    offerer: bool,
    subscription: RelaySubscription,
    buffer: NegotiationBuffer,
}

enum Phase {
    Idle,
    Searching(SearchContext),
    Connected(CallContext),
}

enum Wake {
    Command(Option<ControllerCommand>),
    Pairing(bool),
    JoinProgress(bool),
    Poll,
    Relay(Option<RelayEvent>),
}

/// The controller task
pub struct ClientSessionController<N: MediaNegotiator> {
    user_id: UserId,
    matchmaker: Matchmaker,
    relay: Arc<SignalingRelay>,
    directory: Arc<dyn Directory>,
    negotiator: N,
    settings: ControllerSettings,
    commands: mpsc::Receiver<ControllerCommand>,
    events: broadcast::Sender<ControllerEvent>,
    state: watch::Sender<ControllerState>,
    phase: Phase,
    last_filters: SearchFilters,
}

impl<N: MediaNegotiator + 'static> ClientSessionController<N> {
    pub fn new(
        user_id: &str,
        matchmaker: Matchmaker,
        relay: Arc<SignalingRelay>,
        directory: Arc<dyn Directory>,
        negotiator: N,
        settings: ControllerSettings,
    ) -> (Self, ControllerHandle) {
        let (command_tx, command_rx) = mpsc::channel(settings.command_capacity);
        let (event_tx, _) = broadcast::channel(settings.event_capacity);
        let (state_tx, state_rx) = watch::channel(ControllerState::Idle);

        let handle = ControllerHandle {
            user_id: user_id.to_string(),
            commands: command_tx,
            events: event_tx.clone(),
            state: state_rx,
        };
        let controller = Self {
            user_id: user_id.to_string(),
            matchmaker,
            relay,
            directory,
            negotiator,
            settings,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            phase: Phase::Idle,
            last_filters: SearchFilters::any(),
        };
        (controller, handle)
    }

    /// Create a controller and run it on the current runtime
    pub fn spawn(
        user_id: &str,
        matchmaker: Matchmaker,
        relay: Arc<SignalingRelay>,
        directory: Arc<dyn Directory>,
        negotiator: N,
        settings: ControllerSettings,
    ) -> (ControllerHandle, JoinHandle<()>) {
        let (controller, handle) =
            Self::new(user_id, matchmaker, relay, directory, negotiator, settings);
        (handle, tokio::spawn(controller.run()))
    }

    /// Process commands and notifications until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Controller for {} started", self.user_id);

        loop {
            let wake = match &mut self.phase {
                Phase::Idle => Wake::Command(self.commands.recv().await),
                Phase::Searching(SearchContext { pairing, pending }) => tokio::select! {
                    command = self.commands.recv() => Wake::Command(command),
                    open = pairing_changed(pairing) => Wake::Pairing(open),
                    open = join_progressed(pending) => Wake::JoinProgress(open),
                    _ = ticker.tick() => Wake::Poll,
                },
                Phase::Connected(call) => tokio::select! {
                    command = self.commands.recv() => Wake::Command(command),
                    event = call.subscription.next() => Wake::Relay(event),
                },
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(ControllerCommand::Shutdown)) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Pairing(open) => self.on_pairing(open).await,
                Wake::JoinProgress(open) => self.follow_join_progress(open).await,
                Wake::Poll => self.poll_search().await,
                Wake::Relay(event) => self.on_relay(event).await,
            }
        }

        match self.phase {
            Phase::Idle => {}
            Phase::Searching(_) => self.cancel_search().await,
            Phase::Connected(_) => self.hang_up(EndReason::Hangup).await,
        }
        info!("Controller for {} stopped", self.user_id);
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        debug!("{} <- {:?}", self.user_id, command);
        let call_session = self.call_session();
        let searching = matches!(self.phase, Phase::Searching(_));

        match command {
            ControllerCommand::StartSearch { .. } if searching => self.notice("Already searching"),
            ControllerCommand::StartSearch { .. } if call_session.is_some() => {
                self.notice("Already in a call")
            }
            ControllerCommand::StartSearch { filters } => self.start_search(filters).await,

            ControllerCommand::Cancel | ControllerCommand::End if searching => {
                self.cancel_search().await
            }
            ControllerCommand::End if call_session.is_some() => {
                self.hang_up(EndReason::Hangup).await
            }
            ControllerCommand::Skip if call_session.is_some() => {
                self.hang_up(EndReason::Skip).await;
                let filters = self.last_filters.clone();
                self.start_search(filters).await;
            }

            ControllerCommand::SendChat { text } => match call_session {
                Some(session_id) => {
                    let result = self.relay.send_chat(session_id, &self.user_id, &text).await;
                    if let Err(e) = result {
                        self.on_call_error(e).await;
                    }
                }
                None => self.notice("Not in a call"),
            },
            ControllerCommand::RevealProfile => match call_session {
                Some(session_id) => {
                    let result = self.relay.reveal_profile(session_id, &self.user_id).await;
                    if let Err(e) = result {
                        self.on_call_error(e).await;
                    }
                }
                None => self.notice("Not in a call"),
            },

            command => debug!("{} ignoring {:?} in {}", self.user_id, command, self.state()),
        }
    }

    async fn start_search(&mut self, filters: SearchFilters) {
        self.last_filters = filters.clone();

        if let Err(e) = self.negotiator.acquire_media().await {
            warn!("{} cannot search: {}", self.user_id, e);
            self.notice(&e.to_string());
            return;
        }

        let ticket = match self.matchmaker.enqueue(&self.user_id, filters).await {
            Ok(ticket) => ticket,
            Err(e) => match MatchError::kind_of(&e) {
                Some(MatchError::AlreadySearching { .. }) => {
                    match self.matchmaker.ticket_for(&self.user_id) {
                        Ok(ticket) => {
                            debug!("{} resumes an existing search", self.user_id);
                            ticket
                        }
                        Err(e) => {
                            self.notice(&e.to_string());
                            return;
                        }
                    }
                }
                _ => {
                    warn!("{} could not start searching: {}", self.user_id, e);
                    self.notice(&e.to_string());
                    return;
                }
            },
        };

        let mut pairing = ticket.pairing;
        let assigned = *pairing.borrow_and_update();
        self.phase = Phase::Searching(SearchContext {
            pairing: Some(pairing),
            pending: None,
        });
        self.set_state(ControllerState::Searching);
        self.report_progress();

        if let Some(session_id) = assigned {
            self.try_join(session_id).await;
        }
    }

    async fn cancel_search(&mut self) {
        let pending = match &self.phase {
            Phase::Searching(search) => search.pending.as_ref().map(|p| p.session_id),
            _ => None,
        };

        if let Err(e) = self.matchmaker.cancel(&self.user_id).await {
            warn!("{} failed to cancel search: {}", self.user_id, e);
        }

        // The peer may have activated the session just before the cancel landed
        if let Some(session_id) = pending {
            let activated = self
                .matchmaker
                .session(session_id)
                .is_ok_and(|s| s.is_active() && s.is_participant(&self.user_id));
            if activated {
                if let Err(e) = self
                    .matchmaker
                    .end_session(session_id, Some(&self.user_id), EndReason::Cancelled)
                    .await
                {
                    warn!("{} failed to end session {}: {}", self.user_id, session_id, e);
                }
            }
        }

        self.go_idle(None);
    }

    async fn on_pairing(&mut self, open: bool) {
        let Phase::Searching(search) = &mut self.phase else {
            return;
        };

        if !open {
            search.pairing = None;
            if search.pending.is_none() {
                debug!("Search entry of {} is gone", self.user_id);
                self.go_idle(Some("Search ended"));
            } else {
                self.follow_join_progress(true).await;
            }
            return;
        }

        let assigned = search
            .pairing
            .as_mut()
            .and_then(|pairing| *pairing.borrow_and_update());
        if let Some(session_id) = assigned {
            self.try_join(session_id).await;
        }
    }

    async fn poll_search(&mut self) {
        let has_pending = match &self.phase {
            Phase::Searching(search) => search.pending.is_some(),
            _ => return,
        };

        match self.matchmaker.ticket_for(&self.user_id) {
            Ok(ticket) => {
                if let Some(session_id) = ticket.entry.session_id {
                    self.try_join(session_id).await;
                }
            }
            Err(_) if !has_pending => {
                self.go_idle(Some("Search ended"));
                return;
            }
            Err(_) => {}
        }

        if matches!(self.phase, Phase::Searching(_)) {
            self.report_progress();
        }
    }

    /// Join `session_id`, moving on to the next reservation whenever the joined
    /// session ends before it activates
    async fn try_join(&mut self, session_id: SessionId) {
        let mut next = Some(session_id);
        while let Some(session_id) = next.take() {
            next = self.join_once(session_id).await;
        }
    }

    async fn follow_join_progress(&mut self, open: bool) {
        if let Some(next) = self.on_join_progress(open).await {
            self.try_join(next).await;
        }
    }

    async fn join_once(&mut self, session_id: SessionId) -> Option<SessionId> {
        match &self.phase {
            Phase::Searching(search)
                if search
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.session_id == session_id) =>
            {
                return None
            }
            Phase::Searching(_) => {}
            _ => return None,
        }

        match self.matchmaker.join_session(session_id, &self.user_id).await {
            Ok(outcome) if outcome.session.is_active() => {
                self.connect(outcome.session).await;
                None
            }
            Ok(_) => {
                let state = match self.matchmaker.session_watch(session_id) {
                    Ok(state) => state,
                    Err(e) => {
                        debug!("Session {} vanished after join: {}", session_id, e);
                        return None;
                    }
                };
                if let Phase::Searching(search) = &mut self.phase {
                    search.pending = Some(PendingJoin { session_id, state });
                }
                debug!("{} waiting for peer in session {}", self.user_id, session_id);
                // The peer may have attached between the join and the watch
                self.on_join_progress(true).await
            }
            Err(e) => {
                match MatchError::kind_of(&e) {
                    Some(kind) if kind.is_stale_session() || kind.ends_call() => {
                        debug!("{} skipping stale pairing {}: {}", self.user_id, session_id, e)
                    }
                    _ => {
                        warn!("{} failed to join {}: {}", self.user_id, session_id, e);
                        self.notice(&format!("Could not join call: {}", e));
                    }
                }
                None
            }
        }
    }

    /// React to a state change of the pending session; returns the next
    /// session to join when the pending one ended and the entry was re-paired
    async fn on_join_progress(&mut self, open: bool) -> Option<SessionId> {
        let Phase::Searching(search) = &mut self.phase else {
            return None;
        };
        let Some(pending) = search.pending.as_mut() else {
            return None;
        };

        let session_id = pending.session_id;
        let state = if open {
            *pending.state.borrow_and_update()
        } else {
            SessionState::Ended
        };

        match state {
            SessionState::Forming => None,
            SessionState::Active => {
                match self.matchmaker.session(session_id) {
                    Ok(session) => self.connect(session).await,
                    Err(e) => {
                        debug!("Session {} disappeared: {}", session_id, e);
                        search.pending = None;
                    }
                }
                None
            }
            SessionState::Ended => {
                search.pending = None;
                debug!(
                    "Session {} ended before {} was connected",
                    session_id, self.user_id
                );
                match self.matchmaker.ticket_for(&self.user_id) {
                    Ok(mut ticket) => {
                        let assigned = *ticket.pairing.borrow_and_update();
                        search.pairing = Some(ticket.pairing);
                        assigned
                    }
                    Err(_) => {
                        self.go_idle(Some("Search ended"));
                        None
                    }
                }
            }
        }
    }

    async fn connect(&mut self, session: Session) {
        let session_id = session.session_id;

        let subscription = match self.relay.subscribe(session_id, &self.user_id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(
                    "{} could not subscribe to session {}: {}",
                    self.user_id, session_id, e
                );
                let ended = MatchError::kind_of(&e).is_some_and(MatchError::ends_call);
                if !ended {
                    if let Err(e) = self
                        .matchmaker
                        .end_session(session_id, Some(&self.user_id), EndReason::Hangup)
                        .await
                    {
                        warn!("Failed to end session {}: {}", session_id, e);
                    }
                }
                self.go_idle(Some("Call ended"));
                return;
            }
        };

        let peer_id = session.other_participant(&self.user_id).cloned();
        let peer_profile = match &peer_id {
            Some(peer) => self.directory.lookup(peer).await.unwrap_or_else(|e| {
                warn!("Directory lookup for {} failed: {}", peer, e);
                None
            }),
            None => None,
        };
        let offerer = session
            .participant_ids
            .first()
            .is_some_and(|first| *first == self.user_id);

        info!(
            "{} connected to {} in session {} as {}",
            self.user_id,
            peer_id.as_deref().unwrap_or("unknown"),
            session_id,
            if offerer { "offerer" } else { "answerer" }
        );
        self.phase = Phase::Connected(CallContext {
            session_id,
            peer_id,
            peer_profile: peer_profile.clone(),
            offerer,
            subscription,
            buffer: NegotiationBuffer::new(),
        });
        self.set_state(ControllerState::Connected);
        self.emit(ControllerEvent::PeerResolved {
            session_id,
            profile: peer_profile,
        });

        if offerer {
            if let Err(e) = self.send_offer(session_id).await {
                self.on_call_error(e).await;
            }
        }
    }

    async fn send_offer(&mut self, session_id: SessionId) -> Result<()> {
        let local = self.negotiator.create_offer().await?;
        self.send_signal(session_id, SignalKind::Offer, local.sdp)
            .await?;
        for candidate in local.candidates {
            self.send_signal(session_id, SignalKind::IceCandidate, candidate)
                .await?;
        }
        Ok(())
    }

    async fn send_signal(
        &mut self,
        session_id: SessionId,
        kind: SignalKind,
        payload: String,
    ) -> Result<()> {
        let message = SignalMessage::new(session_id, self.user_id.clone(), kind, payload);
        self.relay.send(session_id, &self.user_id, message).await?;
        Ok(())
    }

    async fn on_relay(&mut self, event: Option<RelayEvent>) {
        let (session_id, peer_profile) = match &self.phase {
            Phase::Connected(call) => (call.session_id, call.peer_profile.clone()),
            _ => return,
        };

        match event {
            Some(RelayEvent::Signal(message)) => {
                if let Err(e) = self.on_signal(message).await {
                    self.on_call_error(e).await;
                }
            }
            Some(RelayEvent::Chat { text, .. }) => {
                self.emit(ControllerEvent::ChatReceived { text })
            }
            Some(RelayEvent::ProfileRevealed { .. }) => {
                self.emit(ControllerEvent::PeerRevealed {
                    profile: peer_profile,
                })
            }
            Some(RelayEvent::PeerLeft { user_id }) => {
                info!("Peer {} left session {}", user_id, session_id);
                self.leave_call(EndReason::PeerLeft, Some("Call ended"))
                    .await
            }
            None => {
                let reason = self
                    .matchmaker
                    .session(session_id)
                    .ok()
                    .and_then(|session| session.end_reason)
                    .unwrap_or(EndReason::PeerLeft);
                self.leave_call(reason, Some("Call ended")).await
            }
        }
    }

    async fn on_signal(&mut self, message: SignalMessage) -> Result<()> {
        let Phase::Connected(call) = &mut self.phase else {
            return Ok(());
        };
        if call.buffer.must_wait(&message) {
            debug!(
                "Holding {} from {} until the remote description is set",
                message.kind.as_str(),
                message.sender_id
            );
            call.buffer.push(message);
            return Ok(());
        }

        let session_id = call.session_id;
        match (message.kind, call.offerer) {
            (SignalKind::Offer, false) => {
                let local = self.negotiator.accept_offer(&message.payload).await?;
                self.send_signal(session_id, SignalKind::Answer, local.sdp)
                    .await?;
                for candidate in local.candidates {
                    self.send_signal(session_id, SignalKind::IceCandidate, candidate)
                        .await?;
                }
                self.flush_held_candidates().await
            }
            (SignalKind::Answer, true) => {
                self.negotiator.apply_answer(&message.payload).await?;
                self.flush_held_candidates().await
            }
            (SignalKind::IceCandidate, _) => {
                self.negotiator.add_ice_candidate(&message.payload).await
            }
            (kind, _) => {
                warn!(
                    "Ignoring unexpected {} from {} in session {}",
                    kind.as_str(),
                    message.sender_id,
                    session_id
                );
                Ok(())
            }
        }
    }

    async fn flush_held_candidates(&mut self) -> Result<()> {
        let held = match &mut self.phase {
            Phase::Connected(call) => call.buffer.mark_remote_applied(),
            _ => return Ok(()),
        };
        for message in held {
            self.negotiator.add_ice_candidate(&message.payload).await?;
        }
        Ok(())
    }

    async fn on_call_error(&mut self, error: anyhow::Error) {
        if MatchError::kind_of(&error).is_some_and(MatchError::ends_call) {
            debug!("{} call is over: {}", self.user_id, error);
            let reason = self
                .call_session()
                .and_then(|id| self.matchmaker.session(id).ok())
                .and_then(|session| session.end_reason)
                .unwrap_or(EndReason::PeerLeft);
            self.leave_call(reason, Some("Call ended")).await;
        } else {
            warn!("{} call failed: {}", self.user_id, error);
            self.notice(&format!("Call failed: {}", error));
            self.hang_up(EndReason::Hangup).await;
        }
    }

    async fn hang_up(&mut self, reason: EndReason) {
        let Some(session_id) = self.call_session() else {
            return;
        };
        if let Err(e) = self
            .matchmaker
            .end_session(session_id, Some(&self.user_id), reason)
            .await
        {
            warn!("{} failed to end session {}: {}", self.user_id, session_id, e);
        }
        self.leave_call(reason, None).await;
    }

    async fn leave_call(&mut self, reason: EndReason, notice: Option<&str>) {
        let call = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connected(call) => call,
            other => {
                self.phase = other;
                return;
            }
        };

        self.negotiator.close().await;
        info!(
            "{} left session {} with {} ({})",
            self.user_id,
            call.session_id,
            call.peer_id.as_deref().unwrap_or("unknown"),
            reason
        );
        drop(call);

        self.set_state(ControllerState::Idle);
        self.emit(ControllerEvent::CallEnded { reason });
        if let Some(notice) = notice {
            self.notice(notice);
        }
    }

    fn go_idle(&mut self, notice: Option<&str>) {
        self.phase = Phase::Idle;
        self.set_state(ControllerState::Idle);
        if let Some(notice) = notice {
            self.notice(notice);
        }
    }

    fn call_session(&self) -> Option<SessionId> {
        match &self.phase {
            Phase::Connected(call) => Some(call.session_id),
            _ => None,
        }
    }

    fn report_progress(&self) {
        match self.matchmaker.searching_count() {
            Ok(searching) => self.emit(ControllerEvent::SearchProgress { searching }),
            Err(e) => debug!("Search progress unavailable: {}", e),
        }
    }

    fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ControllerState) {
        if self.state() != next {
            debug!("{}: {} -> {}", self.user_id, self.state(), next);
            self.state.send_replace(next);
            self.emit(ControllerEvent::StateChanged(next));
        }
    }

    fn notice(&self, text: &str) {
        self.emit(ControllerEvent::Notice(text.to_string()));
    }

    fn emit(&self, event: ControllerEvent) {
        // No listeners is fine
        let _ = self.events.send(event);
    }
}

async fn pairing_changed(pairing: &mut Option<watch::Receiver<Option<SessionId>>>) -> bool {
    match pairing {
        Some(pairing) => pairing.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn join_progressed(pending: &mut Option<PendingJoin>) -> bool {
    match pending {
        Some(pending) => pending.state.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::client::negotiation::MockNegotiator;
    use crate::config::RelaySettings;
    use crate::directory::StaticDirectory;
    use crate::matchmaker::MatchmakerSettings;
    use crate::metrics::MetricsCollector;
    use crate::relay::InMemoryChannel;

    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        matchmaker: Matchmaker,
        relay: Arc<SignalingRelay>,
        directory: Arc<StaticDirectory>,
        _shutdown: broadcast::Sender<()>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_settings(MatchmakerSettings {
                poll_interval: Duration::from_millis(20),
                ..MatchmakerSettings::default()
            })
        }

        fn with_settings(settings: MatchmakerSettings) -> Self {
            let metrics = Arc::new(MetricsCollector::new().unwrap());
            let matchmaker =
                Matchmaker::new(Arc::new(MockEventPublisher::new()), metrics.clone(), settings);
            let relay = Arc::new(SignalingRelay::new(
                matchmaker.registry(),
                Arc::new(InMemoryChannel::new()),
                metrics,
                RelaySettings::default(),
            ));

            let (shutdown, rx) = broadcast::channel(1);
            let runner = matchmaker.clone();
            tokio::spawn(async move { runner.run(rx).await });

            Self {
                matchmaker,
                relay,
                directory: Arc::new(StaticDirectory::new()),
                _shutdown: shutdown,
            }
        }

        fn client(&self, user_id: &str, negotiator: MockNegotiator) -> ControllerHandle {
            let settings = ControllerSettings {
                poll_interval: Duration::from_millis(20),
                ..ControllerSettings::default()
            };
            let (handle, _) = ClientSessionController::spawn(
                user_id,
                self.matchmaker.clone(),
                self.relay.clone(),
                self.directory.clone(),
                negotiator,
                settings,
            );
            handle
        }

        async fn connected_pair(&self, a: &ControllerHandle, b: &ControllerHandle) {
            a.start_search(SearchFilters::any()).await.unwrap();
            a.wait_for_state(ControllerState::Searching, WAIT)
                .await
                .unwrap();
            b.start_search(SearchFilters::any()).await.unwrap();
            a.wait_for_state(ControllerState::Connected, WAIT)
                .await
                .unwrap();
            b.wait_for_state(ControllerState::Connected, WAIT)
                .await
                .unwrap();
        }
    }

    fn profile(name: &str) -> PeerProfile {
        PeerProfile {
            display_name: name.to_string(),
            ..PeerProfile::default()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn expect_event(
        events: &mut broadcast::Receiver<ControllerEvent>,
        mut wanted: impl FnMut(&ControllerEvent) -> bool,
    ) -> ControllerEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if wanted(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("controller gone"),
                }
            }
        })
        .await
        .expect("expected controller event")
    }

    #[tokio::test]
    async fn test_two_clients_negotiate_a_call() {
        let h = Harness::new();
        let alice_media = MockNegotiator::new("a");
        let bob_media = MockNegotiator::new("b");
        let alice = h.client("alice", alice_media.clone());
        let bob = h.client("bob", bob_media.clone());

        h.connected_pair(&alice, &bob).await;

        eventually(|| {
            let (a, b) = (alice_media.log(), bob_media.log());
            a.is_negotiated()
                && b.is_negotiated()
                && a.remote_candidates.len() == 2
                && b.remote_candidates.len() == 2
        })
        .await;

        let (a, b) = (alice_media.log(), bob_media.log());
        assert_eq!(a.local_description, b.remote_description);
        assert_eq!(b.local_description, a.remote_description);
        assert_eq!(a.remote_candidates, b.local_candidates);
        assert_eq!(b.remote_candidates, a.local_candidates);
        // alice searched first, so she offers and bob answers
        assert_eq!(a.local_description.as_deref(), Some("offer:a"));
        assert_eq!(b.local_description.as_deref(), Some("answer:b"));

        let registry = h.matchmaker.registry();
        let alice_session = registry.active_session_for("alice").unwrap().unwrap();
        let bob_session = registry.active_session_for("bob").unwrap().unwrap();
        assert_eq!(alice_session.session_id, bob_session.session_id);
    }

    #[tokio::test]
    async fn test_rejoins_after_forming_session_expires() {
        let h = Harness::with_settings(MatchmakerSettings {
            poll_interval: Duration::from_millis(20),
            forming_timeout: Duration::from_millis(200),
            ..MatchmakerSettings::default()
        });
        let alice = h.client("alice", MockNegotiator::new("a"));
        alice.start_search(SearchFilters::any()).await.unwrap();
        alice
            .wait_for_state(ControllerState::Searching, WAIT)
            .await
            .unwrap();

        // bob never attaches to the first session, so it is abandoned
        let mut bob = h
            .matchmaker
            .enqueue("bob", SearchFilters::any())
            .await
            .unwrap();
        let first = tokio::time::timeout(WAIT, bob.pairing.wait_for(|p| p.is_some()))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(
            WAIT,
            bob.pairing.wait_for(|p| p.is_some_and(|id| id != first)),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(
            h.matchmaker.session(first).unwrap().end_reason,
            Some(EndReason::Abandoned)
        );

        let outcome = h.matchmaker.join_session(second, "bob").await.unwrap();
        assert!(!outcome.offerer);
        alice
            .wait_for_state(ControllerState::Connected, WAIT)
            .await
            .unwrap();

        let session = h
            .matchmaker
            .registry()
            .active_session_for("alice")
            .unwrap()
            .unwrap();
        assert_eq!(session.session_id, second);
        assert_eq!(session.participant_ids, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_missing_media_keeps_idle() {
        let h = Harness::new();
        let carol = h.client("carol", MockNegotiator::without_media("c"));
        let mut events = carol.events();

        carol.start_search(SearchFilters::any()).await.unwrap();
        let notice = expect_event(&mut events, |e| matches!(e, ControllerEvent::Notice(_))).await;

        assert!(matches!(notice, ControllerEvent::Notice(text) if text.contains("Camera")));
        assert_eq!(carol.state(), ControllerState::Idle);
        assert!(h.matchmaker.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_cancel_returns_to_idle() {
        let h = Harness::new();
        let alice = h.client("alice", MockNegotiator::new("a"));

        alice.start_search(SearchFilters::any()).await.unwrap();
        alice
            .wait_for_state(ControllerState::Searching, WAIT)
            .await
            .unwrap();
        alice.cancel().await.unwrap();
        alice
            .wait_for_state(ControllerState::Idle, WAIT)
            .await
            .unwrap();

        assert!(h.matchmaker.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_hangup_moves_peer_to_idle() {
        let h = Harness::new();
        let alice = h.client("alice", MockNegotiator::new("a"));
        let bob = h.client("bob", MockNegotiator::new("b"));
        let mut bob_events = bob.events();
        h.connected_pair(&alice, &bob).await;

        alice.end().await.unwrap();
        alice
            .wait_for_state(ControllerState::Idle, WAIT)
            .await
            .unwrap();
        bob.wait_for_state(ControllerState::Idle, WAIT)
            .await
            .unwrap();

        let ended = expect_event(&mut bob_events, |e| {
            matches!(e, ControllerEvent::CallEnded { .. })
        })
        .await;
        assert_eq!(
            ended,
            ControllerEvent::CallEnded {
                reason: EndReason::PeerLeft
            }
        );
        expect_event(&mut bob_events, |e| {
            *e == ControllerEvent::Notice("Call ended".to_string())
        })
        .await;
    }

    #[tokio::test]
    async fn test_skip_searches_again() {
        let h = Harness::new();
        let alice = h.client("alice", MockNegotiator::new("a"));
        let bob = h.client("bob", MockNegotiator::new("b"));
        h.connected_pair(&alice, &bob).await;

        alice.skip().await.unwrap();
        bob.wait_for_state(ControllerState::Idle, WAIT)
            .await
            .unwrap();
        alice
            .wait_for_state(ControllerState::Searching, WAIT)
            .await
            .unwrap();

        let entry = h.matchmaker.queue().get("alice").unwrap();
        assert!(entry.is_some());
        assert!(h.matchmaker.queue().get("bob").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chat_and_reveal_reach_peer() {
        let h = Harness::new();
        h.directory.insert("alice", profile("Alice")).unwrap();
        let alice = h.client("alice", MockNegotiator::new("a"));
        let bob = h.client("bob", MockNegotiator::new("b"));
        let mut bob_events = bob.events();
        h.connected_pair(&alice, &bob).await;

        let resolved = expect_event(&mut bob_events, |e| {
            matches!(e, ControllerEvent::PeerResolved { .. })
        })
        .await;
        assert!(matches!(
            resolved,
            ControllerEvent::PeerResolved { profile: Some(ref p), .. } if p.display_name == "Alice"
        ));

        alice.send_chat("hi from the library").await.unwrap();
        let chat = expect_event(&mut bob_events, |e| {
            matches!(e, ControllerEvent::ChatReceived { .. })
        })
        .await;
        assert_eq!(
            chat,
            ControllerEvent::ChatReceived {
                text: "hi from the library".to_string()
            }
        );

        alice.reveal_profile().await.unwrap();
        let revealed = expect_event(&mut bob_events, |e| {
            matches!(e, ControllerEvent::PeerRevealed { .. })
        })
        .await;
        assert_eq!(
            revealed,
            ControllerEvent::PeerRevealed {
                profile: Some(profile("Alice"))
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_peer_resolves_to_none() {
        let h = Harness::new();
        let alice = h.client("alice", MockNegotiator::new("a"));
        let bob = h.client("bob", MockNegotiator::new("b"));
        let mut alice_events = alice.events();
        h.connected_pair(&alice, &bob).await;

        let resolved = expect_event(&mut alice_events, |e| {
            matches!(e, ControllerEvent::PeerResolved { .. })
        })
        .await;
        assert!(matches!(
            resolved,
            ControllerEvent::PeerResolved { profile: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_while_searching_leaves_queue() {
        let h = Harness::new();
        let alice = h.client("alice", MockNegotiator::new("a"));

        alice.start_search(SearchFilters::any()).await.unwrap();
        alice
            .wait_for_state(ControllerState::Searching, WAIT)
            .await
            .unwrap();
        alice.shutdown().await.unwrap();

        let queue = h.matchmaker.queue();
        eventually(|| queue.is_empty().unwrap()).await;
    }
}
