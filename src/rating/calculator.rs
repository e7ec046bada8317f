//! Rating calculator trait
//!
//! Matches here are always one team against another, so the calculator works
//! on a winner/loser pair rather than an arbitrary ranking.

use crate::types::{RatingChange, TeamId, TeamRating};
use serde::{Deserialize, Serialize};

/// Result of a rating calculation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingCalculationResult {
    /// Winner first, loser second
    pub rating_changes: Vec<RatingChange>,
    /// Probability the winner was expected to win before the match
    pub expected_win_probability: f64,
}

impl RatingCalculationResult {
    pub fn change_for(&self, team_id: TeamId) -> Option<&RatingChange> {
        self.rating_changes.iter().find(|c| c.team_id == team_id)
    }

    /// An expected winner scoring below one half means the underdog won
    pub fn was_upset(&self) -> bool {
        self.expected_win_probability < 0.5
    }
}

/// Trait for calculating rating changes after a decided match
pub trait RatingCalculator: Send + Sync {
    /// Calculate new ratings for a decided head-to-head result
    ///
    /// # Arguments
    /// * `winner` - winning team and its current rating
    /// * `loser` - losing team and its current rating
    fn rate_result(
        &self,
        winner: (TeamId, &TeamRating),
        loser: (TeamId, &TeamRating),
    ) -> crate::error::Result<RatingCalculationResult>;

    /// Rating assigned to a team's first rated result
    fn initial_rating(&self) -> TeamRating;

    /// Probability that `team` beats `opponent`
    fn win_probability(&self, team: &TeamRating, opponent: &TeamRating) -> f64;
}
