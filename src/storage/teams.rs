//! Team roster storage

use crate::error::{MatchmakingError, Result};
use crate::types::{NewTeam, PlayerId, Team, TeamId, TeamStatus, TEAM_SIZE};
use crate::utils::current_timestamp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Trait for team storage operations
pub trait TeamStore: Send + Sync {
    /// Create a team and assign it an id
    fn create(&self, team: NewTeam) -> Result<Team>;

    fn get(&self, team_id: TeamId) -> Result<Option<Team>>;

    /// The non-ephemeral team a player belongs to
    fn team_of(&self, player_id: PlayerId) -> Result<Option<Team>>;

    /// Apply `f` to a copy of the team and store it only if `f` succeeds
    fn update(&self, team_id: TeamId, f: &mut dyn FnMut(&mut Team) -> Result<()>)
        -> Result<Team>;

    fn remove(&self, team_id: TeamId) -> Result<bool>;

    fn list(&self) -> Result<Vec<Team>>;
}

/// Set a team's status, ignoring teams that no longer exist
pub fn set_team_status(store: &dyn TeamStore, team_id: TeamId, status: TeamStatus) -> Result<()> {
    match store.update(team_id, &mut |team| {
        team.status = status;
        Ok(())
    }) {
        Ok(_) => Ok(()),
        Err(e) => match e.downcast_ref::<MatchmakingError>() {
            Some(MatchmakingError::TeamNotFound { .. }) => Ok(()),
            _ => Err(e),
        },
    }
}

/// In-memory team storage implementation
#[derive(Debug)]
pub struct InMemoryTeamStore {
    teams: RwLock<HashMap<TeamId, Team>>,
    next_id: AtomicU64,
}

impl InMemoryTeamStore {
    pub fn new() -> Self {
        Self {
            teams: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for InMemoryTeamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TeamStore for InMemoryTeamStore {
    fn create(&self, new_team: NewTeam) -> Result<Team> {
        if new_team.member_ids.is_empty() || new_team.member_ids.len() > TEAM_SIZE {
            return Err(MatchmakingError::InvalidQueueRequest {
                reason: format!(
                    "A team needs between 1 and {} members, got {}",
                    TEAM_SIZE,
                    new_team.member_ids.len()
                ),
            }
            .into());
        }

        let mut teams = self
            .teams
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("teams write"))?;

        if !new_team.ephemeral {
            for member in &new_team.member_ids {
                if let Some(existing) = teams
                    .values()
                    .find(|team| !team.ephemeral && team.is_member(*member))
                {
                    return Err(MatchmakingError::AlreadyInTeam {
                        player_id: *member,
                        team_id: existing.id,
                    }
                    .into());
                }
            }
        }

        let team = Team {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: new_team.name,
            is_private: new_team.is_private,
            region: new_team.region,
            leader_id: new_team.leader_id,
            member_ids: new_team.member_ids,
            max_size: TEAM_SIZE,
            status: TeamStatus::Waiting,
            external_id: None,
            ephemeral: new_team.ephemeral,
            created_at: current_timestamp(),
        };
        teams.insert(team.id, team.clone());

        Ok(team)
    }

    fn get(&self, team_id: TeamId) -> Result<Option<Team>> {
        let teams = self
            .teams
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("teams read"))?;

        Ok(teams.get(&team_id).cloned())
    }

    fn team_of(&self, player_id: PlayerId) -> Result<Option<Team>> {
        let teams = self
            .teams
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("teams read"))?;

        Ok(teams
            .values()
            .find(|team| !team.ephemeral && team.is_member(player_id))
            .cloned())
    }

    fn update(
        &self,
        team_id: TeamId,
        f: &mut dyn FnMut(&mut Team) -> Result<()>,
    ) -> Result<Team> {
        let mut teams = self
            .teams
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("teams write"))?;

        let current = teams
            .get(&team_id)
            .ok_or(MatchmakingError::TeamNotFound { team_id })?;
        let mut updated = current.clone();
        f(&mut updated)?;
        teams.insert(team_id, updated.clone());

        Ok(updated)
    }

    fn remove(&self, team_id: TeamId) -> Result<bool> {
        let mut teams = self
            .teams
            .write()
            .map_err(|_| MatchmakingError::lock_poisoned("teams write"))?;

        Ok(teams.remove(&team_id).is_some())
    }

    fn list(&self) -> Result<Vec<Team>> {
        let teams = self
            .teams
            .read()
            .map_err(|_| MatchmakingError::lock_poisoned("teams read"))?;

        let mut all: Vec<Team> = teams.values().cloned().collect();
        all.sort_by_key(|team| team.id);
        Ok(all)
    }
}
