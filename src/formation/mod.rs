//! Automatic match formation from the queue

pub mod grouping;
pub mod scheduler;

pub use grouping::{
    plan_all, plan_match, FirstFitPlanner, FormationError, MatchPlan, MatchPlanner, MatchSide,
    PairingKind,
};
pub use scheduler::{
    FormationReport, FormationSettings, FormedMatch, HandOff, MatchFormationScheduler,
};
