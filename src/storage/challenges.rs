//! Challenge storage

use crate::error::{MatchmakingError, Result};
use crate::types::{ChallengeId, ChallengeRequest, TeamId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Trait for challenge storage operations
pub trait ChallengeStore: Send + Sync {
    /// Store a new challenge; the `id` field is assigned by the store
    fn insert(&self, challenge: ChallengeRequest) -> Result<ChallengeRequest>;

    fn get(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRequest>>;

    /// Apply `f` to a copy of the challenge and store it only if `f` succeeds
    ///
    /// The closure is the conditional-update primitive every transition goes
    /// through: it re-checks status against the freshest row.
    fn update(
        &self,
        challenge_id: ChallengeId,
        f: &mut dyn FnMut(&mut ChallengeRequest) -> Result<()>,
    ) -> Result<ChallengeRequest>;

    /// Every challenge the team takes part in, oldest first
    fn for_team(&self, team_id: TeamId) -> Result<Vec<ChallengeRequest>>;

    fn list(&self) -> Result<Vec<ChallengeRequest>>;
}

/// In-memory challenge storage implementation
#[derive(Debug)]
pub struct InMemoryChallengeStore {
    challenges: RwLock<BTreeMap<ChallengeId, ChallengeRequest>>,
    next_id: AtomicU64,
}

impl InMemoryChallengeStore {
    pub fn new() -> Self {
        Self {
            challenges: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeStore for InMemoryChallengeStore {
    fn insert(&self, mut challenge: ChallengeRequest) -> Result<ChallengeRequest> {
        let mut challenges = self
            .challenges
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("challenges write"))?;

        challenge.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        challenges.insert(challenge.id, challenge.clone());

        Ok(challenge)
    }

    fn get(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRequest>> {
        let challenges = self
            .challenges
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("challenges read"))?;

        Ok(challenges.get(&challenge_id).cloned())
    }

    fn update(
        &self,
        challenge_id: ChallengeId,
        f: &mut dyn FnMut(&mut ChallengeRequest) -> Result<()>,
    ) -> Result<ChallengeRequest> {
        let mut challenges = self
            .challenges
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("challenges write"))?;

        let current = challenges
            .get(&challenge_id)
            .ok_or(MatchmakingError::ChallengeNotFound { challenge_id })?;
        let mut updated = current.clone();
        f(&mut updated)?;
        challenges.insert(challenge_id, updated.clone());

        Ok(updated)
    }

    fn for_team(&self, team_id: TeamId) -> Result<Vec<ChallengeRequest>> {
        let challenges = self
            .challenges
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("challenges read"))?;

        Ok(challenges
            .values()
            .filter(|challenge| challenge.is_participant(team_id))
            .cloned()
            .collect())
    }

    fn list(&self) -> Result<Vec<ChallengeRequest>> {
        let challenges = self
            .challenges
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("challenges read"))?;

        Ok(challenges.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChallengeStatus;
    use crate::utils::current_timestamp;

    fn pending(challenger: TeamId, challenged: TeamId) -> ChallengeRequest {
        let now = current_timestamp();
        ChallengeRequest {
            id: 0,
            challenger_team_id: challenger,
            challenged_team_id: challenged,
            status: ChallengeStatus::Pending,
            challenger_ready: false,
            challenged_ready: false,
            message: None,
            expires_at: now + chrono::Duration::minutes(5),
            created_at: now,
            accepted_at: None,
            veto_started_at: None,
            match_started_at: None,
            match_id: None,
            final_map: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_insert_assigns_ids() {
        let store = InMemoryChallengeStore::new();
        let first = store.insert(pending(1, 2)).unwrap();
        let second = store.insert(pending(1, 3)).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.for_team(1).unwrap().len(), 2);
        assert_eq!(store.for_team(3).unwrap().len(), 1);
    }

    #[test]
    fn test_conditional_update() {
        let store = InMemoryChallengeStore::new();
        let challenge = store.insert(pending(1, 2)).unwrap();

        let accepted = store
            .update(challenge.id, &mut |c| c.transition(ChallengeStatus::Accepted))
            .unwrap();
        assert_eq!(accepted.status, ChallengeStatus::Accepted);

        // Second accept loses the race and leaves the row alone
        let err = store
            .update(challenge.id, &mut |c| c.transition(ChallengeStatus::Accepted))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_update_missing_challenge() {
        let store = InMemoryChallengeStore::new();
        let err = store.update(9, &mut |_| Ok(())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::ChallengeNotFound { challenge_id: 9 })
        ));
    }
}
