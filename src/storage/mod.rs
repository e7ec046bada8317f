//! Repositories for teams, challenges, veto entries and matches
//!
//! The production deployment keeps these rows in a relational database owned
//! by the web layer; the traits here are the narrow surface the engine needs,
//! with in-memory implementations for tests and single-process runs.

pub mod challenges;
pub mod matches;
pub mod teams;
pub mod vetoes;

pub use challenges::{ChallengeStore, InMemoryChallengeStore};
pub use matches::{InMemoryMatchStore, MatchStore};
pub use teams::{set_team_status, InMemoryTeamStore, TeamStore};
pub use vetoes::{InMemoryVetoStore, VetoStore};

use crate::rating::{InMemoryRatingStorage, RatingStorage};
use std::sync::Arc;

/// Bundle of every repository the engine touches
#[derive(Clone)]
pub struct Repositories {
    pub teams: Arc<dyn TeamStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub vetoes: Arc<dyn VetoStore>,
    pub matches: Arc<dyn MatchStore>,
    pub ratings: Arc<dyn RatingStorage>,
}

impl Repositories {
    pub fn in_memory() -> Self {
        Self {
            teams: Arc::new(InMemoryTeamStore::new()),
            challenges: Arc::new(InMemoryChallengeStore::new()),
            vetoes: Arc::new(InMemoryVetoStore::new()),
            matches: Arc::new(InMemoryMatchStore::new()),
            ratings: Arc::new(InMemoryRatingStorage::default()),
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
