//! AMQP integration for the matchmaking service
//!
//! Outbound only: the engine publishes challenge, veto and match events to
//! topic exchanges for the web layer and other consumers.

pub mod connection;
pub mod messages;
pub mod publisher;

// Re-export commonly used types
pub use connection::{AmqpConfig, AmqpConnection};
pub use messages::*;
pub use publisher::{
    AmqpEventPublisher, EventPublisher, LoggingEventPublisher, MockEventPublisher, Notifier,
    PublisherConfig,
};
