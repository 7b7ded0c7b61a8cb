//! AMQP integration for the pairing service
//!
//! Connections, the search command consumer, and the outbound event publisher.
//! The relay's AMQP transport lives in [`crate::relay::channel`].

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

// Re-export commonly used types
pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{MessageHandler, SearchCommandConsumer};
pub use messages::*;
pub use publisher::{
    AmqpEventPublisher, EventPublisher, LoggingEventPublisher, MockEventPublisher,
    PublisherConfig,
};
