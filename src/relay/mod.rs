//! Signaling relay and its realtime transports

pub mod channel;
pub mod signaling;

pub use channel::{AmqpRealtimeChannel, ChannelSubscription, InMemoryChannel, RealtimeChannel};
pub use signaling::{RelayBody, RelayEnvelope, RelaySubscription, SignalingRelay};
