//! Scrim Room - 5v5 matchmaking, challenges and map veto
//!
//! This crate queues solo players and pre-formed teams, pairs them into
//! five-a-side matches, arbitrates challenges between teams, runs the map
//! veto and hands the result to an external match hosting provider.

pub mod amqp;
pub mod challenge;
pub mod config;
pub mod error;
pub mod formation;
pub mod hosting;
pub mod matches;
pub mod metrics;
pub mod queue;
pub mod rating;
pub mod service;
pub mod storage;
pub mod types;
pub mod utils;
pub mod veto;

// Re-export commonly used types and traits
pub use error::{MatchmakingError, Result, StartMatchError};
pub use types::*;

// Re-export key components
pub use amqp::publisher::EventPublisher;
pub use challenge::ChallengeLifecycle;
pub use formation::MatchFormationScheduler;
pub use matches::{MatchMonitor, MatchOrchestrator};
pub use queue::QueueStore;
pub use service::{EngineDeps, EngineSettings, MatchmakingEngine};
pub use veto::MapVetoDraft;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
