//! Hosted matches: starting them and watching them until they end

pub mod monitor;
pub mod orchestrator;

pub use monitor::{ConnectionReport, MatchMonitor, ReconcileReport, DEFAULT_CONNECTION_GRACE};
pub use orchestrator::MatchOrchestrator;
