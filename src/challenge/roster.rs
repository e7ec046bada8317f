//! Team roster operations the engine relies on

use crate::error::{MatchmakingError, Result};
use crate::storage::TeamStore;
use crate::types::{NewTeam, PlayerId, Team, TeamId};
use std::sync::Arc;
use tracing::info;

/// Creates teams and moves leadership around
#[derive(Clone)]
pub struct TeamRoster {
    teams: Arc<dyn TeamStore>,
    default_region: String,
}

impl TeamRoster {
    pub fn new(teams: Arc<dyn TeamStore>, default_region: impl Into<String>) -> Self {
        Self {
            teams,
            default_region: default_region.into(),
        }
    }

    /// Create a persistent team led by `creator`
    ///
    /// The creator always ends up first in the member list; duplicates are
    /// dropped. Players already in a persistent team are rejected by the store.
    pub fn create_team(
        &self,
        creator: PlayerId,
        name: Option<String>,
        members: &[PlayerId],
        region: Option<&str>,
    ) -> Result<Team> {
        let mut member_ids = vec![creator];
        for &member in members {
            if !member_ids.contains(&member) {
                member_ids.push(member);
            }
        }

        let team = self.teams.create(NewTeam {
            name,
            is_private: false,
            region: region.unwrap_or(&self.default_region).to_string(),
            leader_id: creator,
            member_ids,
            ephemeral: false,
        })?;

        info!(
            "Player {} created team {} with {} members",
            creator,
            team.id,
            team.member_ids.len()
        );
        Ok(team)
    }

    /// Hand leadership to another member; only the current leader may
    pub fn transfer_leadership(
        &self,
        actor: PlayerId,
        team_id: TeamId,
        new_leader: PlayerId,
    ) -> Result<Team> {
        let team = self.teams.update(team_id, &mut |team| {
            if !team.is_leader(actor) {
                return Err(MatchmakingError::NotLeader {
                    player_id: actor,
                    team_id,
                }
                .into());
            }
            if !team.is_member(new_leader) {
                return Err(MatchmakingError::NotTeamMember {
                    player_id: new_leader,
                    team_id,
                }
                .into());
            }
            team.leader_id = new_leader;
            Ok(())
        })?;

        info!(
            "Leadership of team {} passed from {} to {}",
            team_id, actor, new_leader
        );
        Ok(team)
    }

    pub fn team_of(&self, player_id: PlayerId) -> Result<Option<Team>> {
        self.teams.team_of(player_id)
    }

    pub fn get(&self, team_id: TeamId) -> Result<Option<Team>> {
        self.teams.get(team_id)
    }
}

impl std::fmt::Debug for TeamRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamRoster")
            .field("default_region", &self.default_region)
            .finish_non_exhaustive()
    }
}
