//! Configuration management for the scrim-room service
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, and default values for the matchmaking service.

pub mod app;

// Re-export commonly used types
pub use app::{
    default_map_pool, validate_config, AmqpSettings, AppConfig, HostingSettings,
    MatchmakingSettings, MonitorSettings, QueueBackendKind, QueueBackendSettings, RatingSettings,
    ServiceSettings, VetoSettings,
};
