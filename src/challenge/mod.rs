//! Challenges between teams and the rosters behind them

pub mod lifecycle;
pub mod roster;

pub use lifecycle::{AcceptOutcome, ChallengeLifecycle, ReadyOutcome, DEFAULT_CHALLENGE_TTL};
pub use roster::TeamRoster;
