//! Rating storage interface and implementations
//!
//! Team ratings are created lazily: a team has no entry until its first
//! rated result is recorded.

use crate::error::MatchmakingError;
use crate::types::{RatingChange, TeamId, TeamRating};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Storage entry for a team's rating with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingEntry {
    pub team_id: TeamId,
    pub rating: TeamRating,
    pub games_played: u64,
    pub last_updated: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RatingEntry {
    /// Create a new rating entry for an unrated team
    pub fn new(team_id: TeamId, initial_rating: TeamRating) -> Self {
        let now = Utc::now();
        Self {
            team_id,
            rating: initial_rating,
            games_played: 0,
            last_updated: now,
            created_at: now,
        }
    }

    /// Update the rating and increment games played
    pub fn update_rating(&mut self, new_rating: TeamRating) {
        self.rating = new_rating;
        self.games_played += 1;
        self.last_updated = Utc::now();
    }
}

/// Trait for rating storage operations
pub trait RatingStorage: Send + Sync {
    fn get_rating(&self, team_id: TeamId) -> crate::error::Result<Option<RatingEntry>>;

    /// Apply a set of rating changes atomically, creating missing entries
    fn apply_changes(&self, changes: &[RatingChange]) -> crate::error::Result<Vec<RatingEntry>>;

    /// Highest rated teams first
    fn leaderboard(&self, limit: usize) -> crate::error::Result<Vec<RatingEntry>>;

    fn get_team_count(&self) -> crate::error::Result<usize>;
}

/// In-memory rating storage implementation
#[derive(Debug, Default)]
pub struct InMemoryRatingStorage {
    ratings: RwLock<HashMap<TeamId, RatingEntry>>,
}

impl InMemoryRatingStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RatingStorage for InMemoryRatingStorage {
    fn get_rating(&self, team_id: TeamId) -> crate::error::Result<Option<RatingEntry>> {
        let ratings = self
            .ratings
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("ratings read"))?;

        Ok(ratings.get(&team_id).cloned())
    }

    fn apply_changes(&self, changes: &[RatingChange]) -> crate::error::Result<Vec<RatingEntry>> {
        let mut ratings = self
            .ratings
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("ratings write"))?;

        let mut updated = Vec::with_capacity(changes.len());
        for change in changes {
            let entry = ratings
                .entry(change.team_id)
                .or_insert_with(|| RatingEntry::new(change.team_id, change.old_rating.clone()));
            entry.update_rating(change.new_rating.clone());
            updated.push(entry.clone());
        }

        Ok(updated)
    }

    fn leaderboard(&self, limit: usize) -> crate::error::Result<Vec<RatingEntry>> {
        let ratings = self
            .ratings
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("ratings read"))?;

        let mut entries: Vec<RatingEntry> = ratings.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.rating
                .rating
                .partial_cmp(&a.rating.rating)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries.truncate(limit);

        Ok(entries)
    }

    fn get_team_count(&self) -> crate::error::Result<usize> {
        let ratings = self
            .ratings
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("ratings read"))?;

        Ok(ratings.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(team_id: TeamId, old: f64, new: f64) -> RatingChange {
        RatingChange {
            team_id,
            old_rating: TeamRating {
                rating: old,
                uncertainty: 200.0,
            },
            new_rating: TeamRating {
                rating: new,
                uncertainty: 190.0,
            },
            rank: if new > old { 1 } else { 2 },
        }
    }

    #[test]
    fn test_entries_created_lazily() {
        let storage = InMemoryRatingStorage::new();
        assert!(storage.get_rating(1).unwrap().is_none());

        let updated = storage
            .apply_changes(&[change(1, 1500.0, 1525.0), change(2, 1500.0, 1475.0)])
            .unwrap();

        assert_eq!(updated.len(), 2);
        let entry = storage.get_rating(1).unwrap().unwrap();
        assert_eq!(entry.rating.rating, 1525.0);
        assert_eq!(entry.games_played, 1);
        assert_eq!(storage.get_team_count().unwrap(), 2);
    }

    #[test]
    fn test_games_played_accumulates() {
        let storage = InMemoryRatingStorage::new();
        storage.apply_changes(&[change(1, 1500.0, 1525.0)]).unwrap();
        storage.apply_changes(&[change(1, 1525.0, 1540.0)]).unwrap();

        let entry = storage.get_rating(1).unwrap().unwrap();
        assert_eq!(entry.games_played, 2);
        assert_eq!(entry.rating.rating, 1540.0);
    }

    #[test]
    fn test_leaderboard_order() {
        let storage = InMemoryRatingStorage::new();
        storage
            .apply_changes(&[
                change(1, 1500.0, 1400.0),
                change(2, 1500.0, 1600.0),
                change(3, 1500.0, 1550.0),
            ])
            .unwrap();

        let top = storage.leaderboard(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].team_id, 2);
        assert_eq!(top[1].team_id, 3);
    }
}
