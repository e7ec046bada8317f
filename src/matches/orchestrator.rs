//! Hands a ready challenge over to the hosting provider
//!
//! Starting a match is a fixed sequence of provider calls followed by local
//! bookkeeping. Every step has its own `StartMatchError` variant, and a failed
//! step undoes what the provider already created where it can.

use crate::amqp::publisher::Notifier;
use crate::challenge::ChallengeLifecycle;
use crate::error::StartMatchError;
use crate::hosting::{CreateMatchRequest, HostedRoster, HostingApi, HostingError, HostingServer};
use crate::metrics::MetricsCollector;
use crate::storage::{ChallengeStore, MatchStore, Repositories, TeamStore};
use crate::types::{
    ChallengeId, ChallengeRequest, ChallengeStatus, GameMatch, MatchPhase, Team, TeamId, TEAM_SIZE,
};
use crate::utils::{generate_server_password, Clock};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub struct MatchOrchestrator {
    challenges: Arc<dyn ChallengeStore>,
    teams: Arc<dyn TeamStore>,
    matches: Arc<dyn MatchStore>,
    lifecycle: Arc<ChallengeLifecycle>,
    hosting: Arc<dyn HostingApi>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    metrics: Arc<MetricsCollector>,
}

/// Provider-side teams created for one start attempt
struct ExternalTeams {
    challenger: (TeamId, String),
    challenged: (TeamId, String),
}

impl MatchOrchestrator {
    pub fn new(
        repos: &Repositories,
        lifecycle: Arc<ChallengeLifecycle>,
        hosting: Arc<dyn HostingApi>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            challenges: repos.challenges.clone(),
            teams: repos.teams.clone(),
            matches: repos.matches.clone(),
            lifecycle,
            hosting,
            clock,
            notifier,
            metrics,
        }
    }

    /// Start the external match for an accepted challenge
    ///
    /// `final_map` is the veto result, if a veto ran. Not retried: callers
    /// reach this from one-shot transitions.
    pub async fn start_match(
        &self,
        challenge: &ChallengeRequest,
        final_map: Option<&str>,
    ) -> Result<GameMatch, StartMatchError> {
        let timer = self.metrics.start_timer();
        let result = self.try_start(challenge, final_map).await;
        self.metrics.record_operation("start_match", timer.elapsed());

        match &result {
            Ok(game_match) => {
                self.metrics
                    .record_match_started(if final_map.is_some() { "veto" } else { "direct" });
                self.notifier
                    .match_lifecycle(
                        challenge.id,
                        Some(game_match.id),
                        MatchPhase::Started,
                        Some(format!(
                            "{}:{}",
                            game_match.server_ip, game_match.server_port
                        )),
                    )
                    .await;
            }
            Err(e) => {
                error!(
                    "Failed to start match for challenge {} at step {}: {}",
                    challenge.id,
                    e.step(),
                    e
                );
                self.metrics.record_match_start_failure(e.step());
                self.notifier
                    .match_lifecycle(
                        challenge.id,
                        None,
                        MatchPhase::StartFailed,
                        Some(e.to_string()),
                    )
                    .await;
            }
        }
        result
    }

    async fn try_start(
        &self,
        challenge: &ChallengeRequest,
        final_map: Option<&str>,
    ) -> Result<GameMatch, StartMatchError> {
        let challenge_id = challenge.id;

        let current = self
            .challenges
            .get(challenge_id)
            .map_err(persistence)?
            .ok_or_else(|| not_startable(challenge_id, "challenge no longer exists"))?;
        if current.status != ChallengeStatus::Accepted {
            return Err(not_startable(
                challenge_id,
                &format!("challenge is {}", current.status),
            ));
        }
        if current.match_id.is_some() {
            return Err(not_startable(challenge_id, "a match was already started"));
        }
        let challenger = self.load_team(challenge_id, current.challenger_team_id)?;
        let challenged = self.load_team(challenge_id, current.challenged_team_id)?;

        let server = self.pick_server().await?;
        let external = self.create_external_teams(&challenger, &challenged).await?;

        let title = format!(
            "{} vs {}",
            challenger.display_name(),
            challenged.display_name()
        );
        let request = CreateMatchRequest {
            server_id: server.id.clone(),
            team1_id: external.challenger.1.clone(),
            team2_id: external.challenged.1.clone(),
            title: title.clone(),
            map: final_map.map(str::to_string),
            players_per_team: TEAM_SIZE,
        };
        let created = match self.timed("create_match", self.hosting.create_match(&request)).await {
            Ok(created) => created,
            Err(e) => {
                self.release_external_teams(&external).await;
                return Err(StartMatchError::MatchCreationFailed {
                    message: e.to_string(),
                });
            }
        };
        let Some(external_match_id) = created.id.filter(|id| !id.is_empty()) else {
            self.release_external_teams(&external).await;
            return Err(StartMatchError::MissingMatchId);
        };
        info!(
            "Created hosting match {} '{}' on {}",
            external_match_id, title, server.display_name
        );

        let server_password = final_map.map(|_| generate_server_password());
        let game_match = self
            .matches
            .insert(GameMatch {
                id: 0,
                challenge_id,
                external_match_id: Some(external_match_id.clone()),
                server_id: server.id.clone(),
                server_ip: server.ip.clone(),
                server_port: server.port,
                server_password: server_password.clone(),
                team1_id: challenger.id,
                team2_id: challenged.id,
                team1_external_id: external.challenger.1.clone(),
                team2_external_id: external.challenged.1.clone(),
                map: final_map.map(str::to_string),
                expected_players: challenger.member_ids.len() + challenged.member_ids.len(),
                started_at: self.clock.now(),
                connection_validated_at: None,
                ended_at: None,
                is_finished: false,
                is_cancelled: false,
                team1_score: 0,
                team2_score: 0,
                winner_team_id: None,
            })
            .map_err(persistence);
        let game_match = match game_match {
            Ok(game_match) => game_match,
            Err(e) => {
                error!(
                    "Failed to record hosting match {} for challenge {}: {}",
                    external_match_id, challenge_id, e
                );
                self.cancel_external_match(&external_match_id).await;
                self.release_external_teams(&external).await;
                return Err(e);
            }
        };

        if let (Some(map), Some(password)) = (final_map, server_password.as_deref()) {
            self.configure_server(&external_match_id, map, password)
                .await;
        }

        if let Err(e) = self.lifecycle.mark_started(challenge_id, game_match.id).await {
            warn!(
                "Challenge {} withdrawn while its match {} was starting: {}",
                challenge_id, game_match.id, e
            );
            self.abandon(&game_match, &external_match_id).await;
            self.release_external_teams(&external).await;
            return Err(not_startable(challenge_id, &e.to_string()));
        }

        Ok(game_match)
    }

    fn load_team(&self, challenge_id: ChallengeId, team_id: TeamId) -> Result<Team, StartMatchError> {
        self.teams
            .get(team_id)
            .map_err(persistence)?
            .ok_or_else(|| not_startable(challenge_id, &format!("team {} no longer exists", team_id)))
    }

    async fn pick_server(&self) -> Result<HostingServer, StartMatchError> {
        let servers = self
            .timed("list_servers", self.hosting.list_available_servers())
            .await
            .map_err(|e| StartMatchError::ServerLookupFailed {
                message: e.to_string(),
            })?;
        servers
            .into_iter()
            .next()
            .ok_or(StartMatchError::NoServerAvailable)
    }

    async fn create_external_teams(
        &self,
        challenger: &Team,
        challenged: &Team,
    ) -> Result<ExternalTeams, StartMatchError> {
        let created = self
            .timed(
                "create_teams",
                self.hosting
                    .create_teams(&hosted_roster(challenger), &hosted_roster(challenged)),
            )
            .await
            .map_err(|e| StartMatchError::TeamCreationFailed {
                message: e.to_string(),
            })?;
        if created.challenger_external_id.is_empty() || created.challenged_external_id.is_empty() {
            return Err(StartMatchError::TeamCreationFailed {
                message: "hosting API returned an empty team id".to_string(),
            });
        }

        let external = ExternalTeams {
            challenger: (challenger.id, created.challenger_external_id),
            challenged: (challenged.id, created.challenged_external_id),
        };
        for (team_id, external_id) in [&external.challenger, &external.challenged] {
            let result = self.teams.update(*team_id, &mut |team| {
                team.external_id = Some(external_id.clone());
                Ok(())
            });
            if let Err(e) = result {
                self.release_external_teams(&external).await;
                return Err(persistence(e));
            }
        }
        Ok(external)
    }

    /// Delete provider teams best-effort; references are cleared only on success
    async fn release_external_teams(&self, external: &ExternalTeams) {
        let ids = vec![external.challenger.1.clone(), external.challenged.1.clone()];
        if let Err(e) = self.timed("delete_teams", self.hosting.delete_teams(&ids)).await {
            warn!("Failed to delete hosting teams {:?}: {}", ids, e);
            return;
        }
        for (team_id, external_id) in [&external.challenger, &external.challenged] {
            let result = self.teams.update(*team_id, &mut |team| {
                if team.external_id.as_ref() == Some(external_id) {
                    team.external_id = None;
                }
                Ok(())
            });
            if let Err(e) = result {
                warn!("Failed to clear hosting id of team {}: {}", team_id, e);
            }
        }
    }

    /// Push the per-match password and the vetoed map; failures only warn
    async fn configure_server(&self, external_match_id: &str, map: &str, password: &str) {
        for command in [
            format!("sv_password \"{}\"", password),
            format!("changelevel {}", map),
        ] {
            match self
                .timed(
                    "rcon",
                    self.hosting.send_rcon_command(external_match_id, &command),
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => warn!("Match {} server rejected RCON command", external_match_id),
                Err(e) => warn!("RCON to match {} server failed: {}", external_match_id, e),
            }
        }
    }

    async fn cancel_external_match(&self, external_match_id: &str) {
        match self
            .timed("cancel_match", self.hosting.cancel_match(external_match_id))
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("Hosting refused to cancel match {}", external_match_id),
            Err(e) => warn!("Failed to cancel hosting match {}: {}", external_match_id, e),
        }
    }

    /// Cancel a match whose challenge can no longer start
    async fn abandon(&self, game_match: &GameMatch, external_match_id: &str) {
        self.cancel_external_match(external_match_id).await;
        let now = self.clock.now();
        if let Err(e) = self.matches.update(game_match.id, &mut |m| {
            m.is_finished = true;
            m.is_cancelled = true;
            m.ended_at = Some(now);
            Ok(())
        }) {
            warn!("Failed to close abandoned match {}: {}", game_match.id, e);
        }
    }

    async fn timed<T>(
        &self,
        call: &str,
        request: impl Future<Output = Result<T, HostingError>>,
    ) -> Result<T, HostingError> {
        let started = Instant::now();
        let result = request.await;
        self.metrics
            .record_hosting_call(call, result.is_ok(), started.elapsed());
        result
    }
}

fn hosted_roster(team: &Team) -> HostedRoster {
    HostedRoster {
        name: team.display_name(),
        player_ids: team.member_ids.clone(),
    }
}

fn not_startable(challenge_id: ChallengeId, reason: &str) -> StartMatchError {
    StartMatchError::ChallengeNotStartable {
        challenge_id,
        reason: reason.to_string(),
    }
}

fn persistence(error: anyhow::Error) -> StartMatchError {
    StartMatchError::Persistence {
        message: error.to_string(),
    }
}
