//! Game match storage

use crate::error::{MatchmakingError, Result};
use crate::types::{ChallengeId, GameMatch, MatchId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Trait for match storage operations
pub trait MatchStore: Send + Sync {
    /// Store a new match; the `id` field is assigned by the store
    fn insert(&self, game_match: GameMatch) -> Result<GameMatch>;

    fn get(&self, match_id: MatchId) -> Result<Option<GameMatch>>;

    /// Apply `f` to a copy of the match; finished matches are immutable
    fn update(
        &self,
        match_id: MatchId,
        f: &mut dyn FnMut(&mut GameMatch) -> Result<()>,
    ) -> Result<GameMatch>;

    /// Matches that are neither finished nor cancelled and have an external id
    fn active(&self) -> Result<Vec<GameMatch>>;

    fn for_challenge(&self, challenge_id: ChallengeId) -> Result<Option<GameMatch>>;
}

/// In-memory match storage implementation
#[derive(Debug)]
pub struct InMemoryMatchStore {
    matches: RwLock<BTreeMap<MatchId, GameMatch>>,
    next_id: AtomicU64,
}

impl InMemoryMatchStore {
    pub fn new() -> Self {
        Self {
            matches: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of stored matches, finished or not
    pub fn len(&self) -> usize {
        self.matches.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchStore for InMemoryMatchStore {
    fn insert(&self, mut game_match: GameMatch) -> Result<GameMatch> {
        let mut matches = self
            .matches
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("matches write"))?;

        game_match.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        matches.insert(game_match.id, game_match.clone());

        Ok(game_match)
    }

    fn get(&self, match_id: MatchId) -> Result<Option<GameMatch>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;

        Ok(matches.get(&match_id).cloned())
    }

    fn update(
        &self,
        match_id: MatchId,
        f: &mut dyn FnMut(&mut GameMatch) -> Result<()>,
    ) -> Result<GameMatch> {
        let mut matches = self
            .matches
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("matches write"))?;

        let current = matches
            .get(&match_id)
            .ok_or(MatchmakingError::MatchNotFound { match_id })?;
        if current.is_finished {
            return Err(MatchmakingError::MatchFinished { match_id }.into());
        }

        let mut updated = current.clone();
        f(&mut updated)?;
        matches.insert(match_id, updated.clone());

        Ok(updated)
    }

    fn active(&self) -> Result<Vec<GameMatch>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;

        Ok(matches.values().filter(|m| m.is_active()).cloned().collect())
    }

    fn for_challenge(&self, challenge_id: ChallengeId) -> Result<Option<GameMatch>> {
        let matches = self
            .matches
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("matches read"))?;

        Ok(matches
            .values()
            .find(|m| m.challenge_id == challenge_id)
            .cloned())
    }
}
