//! Service layer for the scrim-room matchmaking service
//!
//! The engine facade, the production application state with its background
//! tasks, and the health checks served over HTTP.

pub mod app;
pub mod engine;
pub mod health;

pub use app::{AppState, ServiceError, ServiceHandle};
pub use engine::{
    BanResult, EngineDeps, EngineSettings, MatchmakingEngine, QueueJoinResult, ReadyResult,
};
pub use health::{HealthCheck, HealthStatus};
