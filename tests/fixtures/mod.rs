//! Test fixtures and mock implementations for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use pairline::amqp::publisher::EventPublisher;
use pairline::client::{
    ClientSessionController, ControllerHandle, ControllerSettings, MockNegotiator,
};
use pairline::config::RelaySettings;
use pairline::directory::StaticDirectory;
use pairline::error::Result;
use pairline::matchmaker::{Matchmaker, MatchmakerSettings};
use pairline::metrics::MetricsCollector;
use pairline::relay::{ChannelSubscription, InMemoryChannel, RealtimeChannel, SignalingRelay};
use pairline::types::{
    MatchmakingEvent, PeerProfile, SessionActivated, SessionEnded, SessionMatched, UserQueued,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// Event publisher that captures published events for testing
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    published_events: Arc<Mutex<Vec<MatchmakingEvent>>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_published_events(&self) -> Vec<MatchmakingEvent> {
        self.published_events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Count events of specific type
    pub fn count_events_of_type(&self, event_type: &str) -> usize {
        self.get_published_events()
            .iter()
            .filter(|event| match event {
                MatchmakingEvent::UserQueued(_) => event_type == "UserQueued",
                MatchmakingEvent::SessionMatched(_) => event_type == "SessionMatched",
                MatchmakingEvent::SessionActivated(_) => event_type == "SessionActivated",
                MatchmakingEvent::SessionEnded(_) => event_type == "SessionEnded",
            })
            .count()
    }

    fn record(&self, event: MatchmakingEvent) {
        if let Ok(mut events) = self.published_events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish_user_queued(&self, event: UserQueued) -> Result<()> {
        self.record(MatchmakingEvent::UserQueued(event));
        Ok(())
    }

    async fn publish_session_matched(&self, event: SessionMatched) -> Result<()> {
        self.record(MatchmakingEvent::SessionMatched(event));
        Ok(())
    }

    async fn publish_session_activated(&self, event: SessionActivated) -> Result<()> {
        self.record(MatchmakingEvent::SessionActivated(event));
        Ok(())
    }

    async fn publish_session_ended(&self, event: SessionEnded) -> Result<()> {
        self.record(MatchmakingEvent::SessionEnded(event));
        Ok(())
    }
}

/// Transport that delivers every payload twice and delays every few payloads
///
/// Delayed payloads arrive after later ones, so subscribers see duplicates and
/// reordering, but nothing is lost.
pub struct FlakyChannel {
    inner: Arc<InMemoryChannel>,
    delay_every: usize,
    delay: Duration,
    published: AtomicUsize,
}

impl FlakyChannel {
    pub fn new(delay_every: usize, delay: Duration) -> Self {
        Self {
            inner: Arc::new(InMemoryChannel::new()),
            delay_every,
            delay,
            published: AtomicUsize::new(0),
        }
    }

    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeChannel for FlakyChannel {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;

        if self.delay_every > 0 && n % self.delay_every == 0 {
            let inner = self.inner.clone();
            let key = key.to_string();
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = inner.publish(&key, payload.clone()).await;
                let _ = inner.publish(&key, payload).await;
            });
            return Ok(());
        }

        self.inner.publish(key, payload.clone()).await?;
        self.inner.publish(key, payload).await
    }

    async fn subscribe(&self, key: &str) -> Result<ChannelSubscription> {
        self.inner.subscribe(key).await
    }
}

/// A complete in-process deployment: matchmaker loop, relay and directory
pub struct TestSystem {
    pub matchmaker: Matchmaker,
    pub relay: Arc<SignalingRelay>,
    pub directory: Arc<StaticDirectory>,
    pub publisher: Arc<RecordingEventPublisher>,
    shutdown: broadcast::Sender<()>,
}

impl TestSystem {
    pub fn new() -> Self {
        Self::with_channel(Arc::new(InMemoryChannel::new()))
    }

    pub fn with_channel(channel: Arc<dyn RealtimeChannel>) -> Self {
        Self::build(channel, fast_settings())
    }

    pub fn build(channel: Arc<dyn RealtimeChannel>, settings: MatchmakerSettings) -> Self {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let publisher = Arc::new(RecordingEventPublisher::new());
        let matchmaker = Matchmaker::new(publisher.clone(), metrics.clone(), settings);
        let relay = Arc::new(SignalingRelay::new(
            matchmaker.registry(),
            channel,
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
            publisher,
            shutdown,
        }
    }

    /// Spawn a controller for `user_id` backed by `negotiator`
    pub fn client(&self, user_id: &str, negotiator: MockNegotiator) -> ControllerHandle {
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
}

impl Drop for TestSystem {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Short poll so tests do not wait on the fallback tick
pub fn fast_settings() -> MatchmakerSettings {
    MatchmakerSettings {
        poll_interval: Duration::from_millis(20),
        ..MatchmakerSettings::default()
    }
}

pub fn profile(display_name: &str, course: &str) -> PeerProfile {
    PeerProfile {
        display_name: display_name.to_string(),
        course_of_study: course.to_string(),
        campus: "Diliman".to_string(),
        year: "2".to_string(),
        ..PeerProfile::default()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
