//! In-memory hosting provider for tests and the simulator

use crate::hosting::api::{
    CreateMatchRequest, CreatedMatch, CreatedTeams, HostedMatchStatus, HostedRoster,
    HostingApi, HostingError, HostingServer,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Knobs for making the fake misbehave
#[derive(Debug, Clone, Default)]
pub struct FakeHostingBehaviour {
    pub fail_server_lookup: bool,
    pub fail_team_creation: bool,
    pub fail_match_creation: bool,
    /// Create matches but leave `id` out of the response
    pub omit_match_id: bool,
    pub fail_match_lookup: bool,
    pub fail_rcon: bool,
    pub fail_team_deletion: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    servers: Vec<HostingServer>,
    behaviour: FakeHostingBehaviour,
    next_id: u64,
    teams: HashMap<String, HostedRoster>,
    deleted_teams: Vec<String>,
    matches: HashMap<String, CreateMatchRequest>,
    statuses: HashMap<String, HostedMatchStatus>,
    cancelled: HashSet<String>,
    rcon: Vec<(String, String)>,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Hosting provider that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryHostingApi {
    state: Mutex<FakeState>,
}

impl InMemoryHostingApi {
    /// A provider with one idle server
    pub fn new() -> Self {
        Self::with_servers(vec![HostingServer {
            id: "srv-1".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 27015,
            display_name: "Local #1".to_string(),
        }])
    }

    pub fn with_servers(servers: Vec<HostingServer>) -> Self {
        let api = Self::default();
        api.with_state(|state| state.servers = servers);
        api
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn set_behaviour(&self, behaviour: FakeHostingBehaviour) {
        self.with_state(|state| state.behaviour = behaviour);
    }

    pub fn set_servers(&self, servers: Vec<HostingServer>) {
        self.with_state(|state| state.servers = servers);
    }

    /// Report a result for a match on the next status poll
    pub fn set_match_status(&self, external_match_id: &str, status: HostedMatchStatus) {
        self.with_state(|state| {
            state
                .statuses
                .insert(external_match_id.to_string(), status);
        });
    }

    /// Make the provider forget a match, as if it was purged
    pub fn forget_match(&self, external_match_id: &str) {
        self.with_state(|state| {
            state.matches.remove(external_match_id);
            state.statuses.remove(external_match_id);
        });
    }

    pub fn created_matches(&self) -> Vec<(String, CreateMatchRequest)> {
        self.with_state(|state| {
            let mut matches: Vec<_> = state
                .matches
                .iter()
                .map(|(id, request)| (id.clone(), request.clone()))
                .collect();
            matches.sort_by(|a, b| a.0.cmp(&b.0));
            matches
        })
    }

    pub fn team(&self, external_id: &str) -> Option<HostedRoster> {
        self.with_state(|state| state.teams.get(external_id).cloned())
    }

    pub fn team_count(&self) -> usize {
        self.with_state(|state| state.teams.len())
    }

    pub fn deleted_teams(&self) -> Vec<String> {
        self.with_state(|state| state.deleted_teams.clone())
    }

    pub fn is_cancelled(&self, external_match_id: &str) -> bool {
        self.with_state(|state| state.cancelled.contains(external_match_id))
    }

    /// `(external match id, command)` pairs in the order they were sent
    pub fn rcon_commands(&self) -> Vec<(String, String)> {
        self.with_state(|state| state.rcon.clone())
    }
}

#[async_trait]
impl HostingApi for InMemoryHostingApi {
    async fn list_available_servers(&self) -> Result<Vec<HostingServer>, HostingError> {
        self.with_state(|state| {
            if state.behaviour.fail_server_lookup {
                return Err(HostingError::Status {
                    status: 500,
                    body: "server lookup failed".to_string(),
                });
            }
            Ok(state.servers.clone())
        })
    }

    async fn create_teams(
        &self,
        challenger: &HostedRoster,
        challenged: &HostedRoster,
    ) -> Result<CreatedTeams, HostingError> {
        self.with_state(|state| {
            if state.behaviour.fail_team_creation {
                return Err(HostingError::Malformed("team payload rejected".to_string()));
            }
            let challenger_external_id = state.next_id("team");
            let challenged_external_id = state.next_id("team");
            state
                .teams
                .insert(challenger_external_id.clone(), challenger.clone());
            state
                .teams
                .insert(challenged_external_id.clone(), challenged.clone());
            Ok(CreatedTeams {
                challenger_external_id,
                challenged_external_id,
            })
        })
    }

    async fn create_match(
        &self,
        request: &CreateMatchRequest,
    ) -> Result<CreatedMatch, HostingError> {
        self.with_state(|state| {
            if state.behaviour.fail_match_creation {
                return Err(HostingError::Status {
                    status: 422,
                    body: "server busy".to_string(),
                });
            }
            let id = state.next_id("match");
            state.matches.insert(id.clone(), request.clone());
            if state.behaviour.omit_match_id {
                return Ok(CreatedMatch { id: None });
            }
            Ok(CreatedMatch { id: Some(id) })
        })
    }

    async fn get_match(
        &self,
        external_match_id: &str,
    ) -> Result<Option<HostedMatchStatus>, HostingError> {
        self.with_state(|state| {
            if state.behaviour.fail_match_lookup {
                return Err(HostingError::Transport("connection reset".to_string()));
            }
            if !state.matches.contains_key(external_match_id) {
                return Ok(None);
            }
            let mut status = state
                .statuses
                .get(external_match_id)
                .cloned()
                .unwrap_or_default();
            status.cancelled |= state.cancelled.contains(external_match_id);
            Ok(Some(status))
        })
    }

    async fn cancel_match(&self, external_match_id: &str) -> Result<bool, HostingError> {
        self.with_state(|state| {
            if !state.matches.contains_key(external_match_id) {
                return Ok(false);
            }
            state.cancelled.insert(external_match_id.to_string());
            Ok(true)
        })
    }

    async fn send_rcon_command(
        &self,
        external_match_id: &str,
        command: &str,
    ) -> Result<bool, HostingError> {
        self.with_state(|state| {
            if state.behaviour.fail_rcon {
                return Err(HostingError::Transport("rcon timed out".to_string()));
            }
            if !state.matches.contains_key(external_match_id) {
                return Ok(false);
            }
            state
                .rcon
                .push((external_match_id.to_string(), command.to_string()));
            Ok(true)
        })
    }

    async fn delete_teams(&self, external_team_ids: &[String]) -> Result<(), HostingError> {
        self.with_state(|state| {
            if state.behaviour.fail_team_deletion {
                return Err(HostingError::Transport("delete failed".to_string()));
            }
            for id in external_team_ids {
                state.teams.remove(id);
                state.deleted_teams.push(id.clone());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster(name: &str) -> HostedRoster {
        HostedRoster {
            name: name.to_string(),
            player_ids: vec![1, 2, 3, 4, 5],
        }
    }

    #[tokio::test]
    async fn test_match_lifecycle_in_fake() {
        let api = InMemoryHostingApi::new();
        let teams = api
            .create_teams(&roster("A"), &roster("B"))
            .await
            .unwrap();
        let created = api
            .create_match(&CreateMatchRequest {
                server_id: "srv-1".to_string(),
                team1_id: teams.challenger_external_id.clone(),
                team2_id: teams.challenged_external_id.clone(),
                title: "A vs B".to_string(),
                map: None,
                players_per_team: 5,
            })
            .await
            .unwrap();
        let id = created.id.unwrap();

        let status = api.get_match(&id).await.unwrap().unwrap();
        assert!(!status.is_over());

        assert!(api.cancel_match(&id).await.unwrap());
        assert!(api.get_match(&id).await.unwrap().unwrap().cancelled);

        api.forget_match(&id);
        assert_eq!(api.get_match(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_behaviour_flags() {
        let api = InMemoryHostingApi::new();
        api.set_behaviour(FakeHostingBehaviour {
            fail_team_creation: true,
            ..Default::default()
        });
        assert!(api.create_teams(&roster("A"), &roster("B")).await.is_err());
        assert_eq!(api.team_count(), 0);
    }
}
