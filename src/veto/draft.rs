//! Turn-based map veto between the two teams of a challenge
//!
//! Bans are appended to the veto store, which rejects repeated maps and stale
//! ordinals, so two leaders banning at once cannot both win the same turn. The
//! append runs under the lifecycle's transition lock so a withdrawal cannot
//! slip in between the status check and the write.
//! Turn start times are recorded the first time a turn is observed and never
//! move afterwards.

use crate::amqp::publisher::Notifier;
use crate::challenge::ChallengeLifecycle;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::storage::{ChallengeStore, Repositories, TeamStore, VetoStore};
use crate::types::{
    ChallengeId, ChallengeRequest, ChallengeStatus, MapVetoEntry, PlayerId, TeamId, TeamRole,
    VetoPhase, VetoProgress,
};
use crate::utils::{has_elapsed, Clock};
use crate::veto::pool::MapPool;
use crate::veto::turn::{self, deadline, is_authorized, role_for_turn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where a veto stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoState {
    InProgress,
    Completed,
    TimedOut,
}

/// Snapshot of a veto as reported to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VetoStatus {
    pub challenge_id: ChallengeId,
    pub state: VetoState,
    pub bans: Vec<MapVetoEntry>,
    pub remaining_maps: Vec<String>,
    pub current_role: Option<TeamRole>,
    pub current_team_id: Option<TeamId>,
    pub turn_started_at: Option<DateTime<Utc>>,
    pub turn_deadline: Option<DateTime<Utc>>,
    pub veto_deadline: DateTime<Utc>,
    /// The current turn ran out; the other leader may ban for it
    pub turn_expired: bool,
    pub final_map: Option<String>,
}

/// Result of a ban attempt that was not rejected
#[derive(Debug, Clone)]
pub enum BanOutcome {
    Banned(VetoStatus),
    /// One map is left; the challenge now carries it as `final_map`
    Completed {
        challenge: ChallengeRequest,
        final_map: String,
    },
    /// The overall deadline passed before this ban; the challenge is cancelled
    TimedOut,
}

/// Veto timing knobs
#[derive(Debug, Clone)]
pub struct DraftSettings {
    pub pool: MapPool,
    pub turn_timeout: Duration,
    pub overall_timeout: Duration,
}

impl Default for DraftSettings {
    fn default() -> Self {
        Self {
            pool: MapPool::default(),
            turn_timeout: turn::DEFAULT_TURN_TIMEOUT,
            overall_timeout: turn::DEFAULT_VETO_TIMEOUT,
        }
    }
}

pub struct MapVetoDraft {
    challenges: Arc<dyn ChallengeStore>,
    teams: Arc<dyn TeamStore>,
    vetoes: Arc<dyn VetoStore>,
    lifecycle: Arc<ChallengeLifecycle>,
    settings: DraftSettings,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    metrics: Arc<MetricsCollector>,
}

impl MapVetoDraft {
    pub fn new(
        repos: &Repositories,
        lifecycle: Arc<ChallengeLifecycle>,
        settings: DraftSettings,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            challenges: repos.challenges.clone(),
            teams: repos.teams.clone(),
            vetoes: repos.vetoes.clone(),
            lifecycle,
            settings,
            clock,
            notifier,
            metrics,
        }
    }

    pub fn pool(&self) -> &MapPool {
        &self.settings.pool
    }

    /// Open the veto for a challenge whose ready-up just completed
    pub async fn begin(&self, challenge: &ChallengeRequest) -> Result<VetoStatus> {
        let started_at = challenge
            .veto_started_at
            .ok_or(MatchmakingError::VetoNotActive {
                challenge_id: challenge.id,
            })?;
        self.vetoes.record_turn_start(challenge.id, 0, started_at)?;

        info!(
            "Map veto started for challenge {} ({} vs {})",
            challenge.id, challenge.challenger_team_id, challenge.challenged_team_id
        );
        self.notifier
            .veto_progress(VetoProgress {
                challenge_id: challenge.id,
                phase: VetoPhase::Started,
                banned_map: None,
                banning_team_id: None,
                remaining_maps: self.settings.pool.maps().to_vec(),
                next_role: Some(TeamRole::Challenger),
                final_map: None,
                timestamp: self.clock.now(),
            })
            .await;

        self.state(challenge.id).await
    }

    /// Current veto state; records the current turn's start if unseen
    pub async fn state(&self, challenge_id: ChallengeId) -> Result<VetoStatus> {
        let challenge = self.load(challenge_id)?;
        let started_at = self.started_at(&challenge)?;

        if self.was_timed_out(&challenge, started_at) {
            return Ok(self.timed_out_status(&challenge, started_at));
        }
        if challenge.final_map.is_none() && challenge.status.is_terminal() {
            return Err(MatchmakingError::VetoNotActive { challenge_id }.into());
        }

        let now = self.clock.now();
        if self.overdue(&challenge, started_at, now) {
            self.time_out(challenge_id).await?;
            return Ok(self.timed_out_status(&challenge, started_at));
        }

        let bans = self.vetoes.entries(challenge_id)?;
        let turn_started_at = if challenge.final_map.is_none() {
            Some(
                self.vetoes
                    .record_turn_start(challenge_id, bans.len(), now)?,
            )
        } else {
            None
        };
        Ok(self.build_status(&challenge, started_at, bans, turn_started_at, now))
    }

    /// Ban a map on behalf of the actor's team
    pub async fn ban(
        &self,
        actor: PlayerId,
        challenge_id: ChallengeId,
        map_name: &str,
    ) -> Result<BanOutcome> {
        let challenge = self.load(challenge_id)?;
        let started_at = self.started_at(&challenge)?;
        let now = self.clock.now();

        if self.overdue(&challenge, started_at, now) {
            self.time_out(challenge_id).await?;
            return Ok(BanOutcome::TimedOut);
        }
        if challenge.status != ChallengeStatus::Accepted || challenge.final_map.is_some() {
            return Err(MatchmakingError::VetoNotActive { challenge_id }.into());
        }

        let role = self.actor_role(actor, &challenge)?;
        if !self.settings.pool.contains(map_name) {
            return Err(MatchmakingError::InvalidMap {
                map_name: map_name.to_string(),
            }
            .into());
        }

        let bans = self.vetoes.entries(challenge_id)?;
        if bans.iter().any(|ban| ban.map_name == map_name) {
            return Err(MatchmakingError::MapAlreadyBanned {
                map_name: map_name.to_string(),
            }
            .into());
        }

        let ordinal = bans.len();
        let turn_started_at = self.vetoes.record_turn_start(challenge_id, ordinal, now)?;
        if !is_authorized(ordinal, role, now, turn_started_at, self.settings.turn_timeout) {
            return Err(MatchmakingError::NotYourTurn { challenge_id }.into());
        }

        let turn_role = role_for_turn(ordinal);
        let banning_team_id = challenge.team_for(turn_role);
        let relaxed = role != turn_role;
        self.lifecycle
            .record_ban(MapVetoEntry {
                challenge_id,
                map_name: map_name.to_string(),
                banning_team_id,
                ordinal,
                banned_at: now,
            })
            .await?;
        self.metrics.record_ban(relaxed);

        if relaxed {
            info!(
                "Team {} banned {} for stalled team {} in challenge {}",
                challenge.team_for(role),
                map_name,
                banning_team_id,
                challenge_id
            );
        } else {
            debug!(
                "Team {} banned {} in challenge {} (ban {})",
                banning_team_id, map_name, challenge_id, ordinal
            );
        }

        let bans = self.vetoes.entries(challenge_id)?;
        let remaining = self
            .settings
            .pool
            .remaining(bans.iter().map(|ban| ban.map_name.as_str()));

        if let [final_map] = remaining.as_slice() {
            let challenge = self.complete(&challenge, final_map)?;
            let duration = (now - started_at).to_std().unwrap_or_default();
            self.metrics.record_veto_completed(duration);
            info!(
                "Map veto for challenge {} finished on {} after {:?}",
                challenge_id, final_map, duration
            );
            self.notifier
                .veto_progress(VetoProgress {
                    challenge_id,
                    phase: VetoPhase::Completed,
                    banned_map: Some(map_name.to_string()),
                    banning_team_id: Some(banning_team_id),
                    remaining_maps: remaining.clone(),
                    next_role: None,
                    final_map: Some(final_map.clone()),
                    timestamp: now,
                })
                .await;
            return Ok(BanOutcome::Completed {
                challenge,
                final_map: final_map.clone(),
            });
        }

        let next_started = self
            .vetoes
            .record_turn_start(challenge_id, bans.len(), now)?;
        let status = self.build_status(&challenge, started_at, bans, Some(next_started), now);
        self.notifier
            .veto_progress(VetoProgress {
                challenge_id,
                phase: VetoPhase::Banned,
                banned_map: Some(map_name.to_string()),
                banning_team_id: Some(banning_team_id),
                remaining_maps: remaining,
                next_role: status.current_role,
                final_map: None,
                timestamp: now,
            })
            .await;
        Ok(BanOutcome::Banned(status))
    }

    /// Cancel every veto that ran past the overall deadline
    pub async fn sweep_timeouts(&self) -> Result<Vec<ChallengeId>> {
        let now = self.clock.now();
        let mut timed_out = Vec::new();
        for challenge in self.challenges.list()? {
            let Some(started_at) = challenge.veto_started_at else {
                continue;
            };
            if !self.overdue(&challenge, started_at, now) {
                continue;
            }
            match self.time_out(challenge.id).await {
                Ok(true) => timed_out.push(challenge.id),
                Ok(false) => {}
                Err(e) => warn!("Failed to time out veto for challenge {}: {}", challenge.id, e),
            }
        }
        Ok(timed_out)
    }

    /// Force-cancel through the lifecycle, which also purges the bans
    async fn time_out(&self, challenge_id: ChallengeId) -> Result<bool> {
        let Some(cancelled) = self
            .lifecycle
            .force_cancel(challenge_id, "map veto timed out")
            .await?
        else {
            return Ok(false);
        };

        warn!(
            "Map veto for challenge {} timed out after {:?}",
            challenge_id, self.settings.overall_timeout
        );
        self.metrics.record_veto_timed_out();
        self.notifier
            .veto_progress(VetoProgress {
                challenge_id,
                phase: VetoPhase::TimedOut,
                banned_map: None,
                banning_team_id: None,
                remaining_maps: Vec::new(),
                next_role: None,
                final_map: None,
                timestamp: cancelled.closed_at.unwrap_or_else(|| self.clock.now()),
            })
            .await;
        Ok(true)
    }

    fn complete(&self, challenge: &ChallengeRequest, final_map: &str) -> Result<ChallengeRequest> {
        let challenge_id = challenge.id;
        self.challenges.update(challenge_id, &mut |c| {
            if c.status != ChallengeStatus::Accepted || c.final_map.is_some() {
                return Err(MatchmakingError::VetoNotActive { challenge_id }.into());
            }
            c.final_map = Some(final_map.to_string());
            Ok(())
        })
    }

    fn load(&self, challenge_id: ChallengeId) -> Result<ChallengeRequest> {
        self.challenges
            .get(challenge_id)?
            .ok_or_else(|| MatchmakingError::ChallengeNotFound { challenge_id }.into())
    }

    fn started_at(&self, challenge: &ChallengeRequest) -> Result<DateTime<Utc>> {
        challenge.veto_started_at.ok_or_else(|| {
            MatchmakingError::VetoNotActive {
                challenge_id: challenge.id,
            }
            .into()
        })
    }

    /// Still open but past the overall deadline
    fn overdue(&self, challenge: &ChallengeRequest, started_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        challenge.status == ChallengeStatus::Accepted
            && challenge.final_map.is_none()
            && has_elapsed(started_at, now, self.settings.overall_timeout)
    }

    /// Cancelled mid-veto no earlier than the overall deadline
    fn was_timed_out(&self, challenge: &ChallengeRequest, started_at: DateTime<Utc>) -> bool {
        challenge.status == ChallengeStatus::Cancelled
            && challenge.final_map.is_none()
            && challenge
                .closed_at
                .is_some_and(|closed| has_elapsed(started_at, closed, self.settings.overall_timeout))
    }

    fn actor_role(&self, actor: PlayerId, challenge: &ChallengeRequest) -> Result<TeamRole> {
        let mut member_of = None;
        for role in [TeamRole::Challenger, TeamRole::Challenged] {
            let team_id = challenge.team_for(role);
            let team = self
                .teams
                .get(team_id)?
                .ok_or(MatchmakingError::TeamNotFound { team_id })?;
            if team.is_leader(actor) {
                return Ok(role);
            }
            if team.is_member(actor) {
                member_of = Some(team_id);
            }
        }
        match member_of {
            Some(team_id) => Err(MatchmakingError::NotLeader {
                player_id: actor,
                team_id,
            }
            .into()),
            None => Err(MatchmakingError::NotInTeam { player_id: actor }.into()),
        }
    }

    fn build_status(
        &self,
        challenge: &ChallengeRequest,
        started_at: DateTime<Utc>,
        bans: Vec<MapVetoEntry>,
        turn_started_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> VetoStatus {
        let remaining_maps = self
            .settings
            .pool
            .remaining(bans.iter().map(|ban| ban.map_name.as_str()));
        let in_progress = challenge.final_map.is_none();
        let current_role = in_progress.then(|| role_for_turn(bans.len()));
        let turn_deadline =
            turn_started_at.map(|started| deadline(started, self.settings.turn_timeout));

        VetoStatus {
            challenge_id: challenge.id,
            state: if in_progress {
                VetoState::InProgress
            } else {
                VetoState::Completed
            },
            bans,
            remaining_maps,
            current_role,
            current_team_id: current_role.map(|role| challenge.team_for(role)),
            turn_started_at,
            turn_deadline,
            veto_deadline: deadline(started_at, self.settings.overall_timeout),
            turn_expired: turn_deadline.is_some_and(|d| now >= d),
            final_map: challenge.final_map.clone(),
        }
    }

    fn timed_out_status(&self, challenge: &ChallengeRequest, started_at: DateTime<Utc>) -> VetoStatus {
        VetoStatus {
            challenge_id: challenge.id,
            state: VetoState::TimedOut,
            bans: Vec::new(),
            remaining_maps: Vec::new(),
            current_role: None,
            current_team_id: None,
            turn_started_at: None,
            turn_deadline: None,
            veto_deadline: deadline(started_at, self.settings.overall_timeout),
            turn_expired: false,
            final_map: None,
        }
    }
}
