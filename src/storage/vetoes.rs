//! Map veto storage: append-only bans plus per-turn start times

use crate::error::{MatchmakingError, Result};
use crate::types::{ChallengeId, MapVetoEntry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Trait for veto storage operations
pub trait VetoStore: Send + Sync {
    /// Bans for a challenge in ordinal order
    fn entries(&self, challenge_id: ChallengeId) -> Result<Vec<MapVetoEntry>>;

    /// Append a ban; rejects repeated maps and out-of-order ordinals
    fn append(&self, entry: MapVetoEntry) -> Result<()>;

    /// Record when a turn was first observed; later calls return the first value
    fn record_turn_start(
        &self,
        challenge_id: ChallengeId,
        ordinal: usize,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>>;

    fn turn_started_at(
        &self,
        challenge_id: ChallengeId,
        ordinal: usize,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Discard all bans and turn starts for a challenge
    fn purge(&self, challenge_id: ChallengeId) -> Result<usize>;
}

#[derive(Debug, Default)]
struct VetoSession {
    entries: Vec<MapVetoEntry>,
    turn_starts: HashMap<usize, DateTime<Utc>>,
}

/// In-memory veto storage implementation
#[derive(Debug, Default)]
pub struct InMemoryVetoStore {
    sessions: RwLock<HashMap<ChallengeId, VetoSession>>,
}

impl InMemoryVetoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VetoStore for InMemoryVetoStore {
    fn entries(&self, challenge_id: ChallengeId) -> Result<Vec<MapVetoEntry>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("veto read"))?;

        Ok(sessions
            .get(&challenge_id)
            .map(|session| session.entries.clone())
            .unwrap_or_default())
    }

    fn append(&self, entry: MapVetoEntry) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("veto write"))?;

        let session = sessions.entry(entry.challenge_id).or_default();
        if session
            .entries
            .iter()
            .any(|existing| existing.map_name == entry.map_name)
        {
            return Err(MatchmakingError::MapAlreadyBanned {
                map_name: entry.map_name,
            }
            .into());
        }
        if entry.ordinal != session.entries.len() {
            return Err(MatchmakingError::VetoOrderViolation {
                challenge_id: entry.challenge_id,
                expected: session.entries.len(),
                actual: entry.ordinal,
            }
            .into());
        }

        session.entries.push(entry);
        Ok(())
    }

    fn record_turn_start(
        &self,
        challenge_id: ChallengeId,
        ordinal: usize,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("veto write"))?;

        let session = sessions.entry(challenge_id).or_default();
        Ok(*session.turn_starts.entry(ordinal).or_insert(at))
    }

    fn turn_started_at(
        &self,
        challenge_id: ChallengeId,
        ordinal: usize,
    ) -> Result<Option<DateTime<Utc>>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("veto read"))?;

        Ok(sessions
            .get(&challenge_id)
            .and_then(|session| session.turn_starts.get(&ordinal).copied()))
    }

    fn purge(&self, challenge_id: ChallengeId) -> Result<usize> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("veto write"))?;

        Ok(sessions
            .remove(&challenge_id)
            .map(|session| session.entries.len())
            .unwrap_or(0))
    }
}
