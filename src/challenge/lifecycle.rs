//! Challenge state machine
//!
//! Every status change goes through `ChallengeStore::update`, which re-checks
//! the transition table against the freshest row. Operations that touch more
//! than one challenge (accepting, readying up, creating) additionally hold a
//! lifecycle-wide mutex so their cross-row checks cannot interleave.

use crate::amqp::publisher::Notifier;
use crate::error::{MatchmakingError, Result};
use crate::hosting::HostingApi;
use crate::metrics::MetricsCollector;
use crate::storage::{set_team_status, ChallengeStore, Repositories, TeamStore, VetoStore};
use crate::types::{
    ChallengeId, ChallengeRequest, ChallengeStatus, MapVetoEntry, MatchId, PlayerId, Team,
    TeamId, TeamRole, TeamStatus,
};
use crate::utils::{to_chrono, Clock};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default time a pending challenge stays answerable
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(300);

const AUTO_MATCH_MESSAGE: &str = "auto-match";

/// Accepted challenge plus the pending ones it superseded
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub challenge: ChallengeRequest,
    pub superseded: Vec<ChallengeId>,
}

/// Readiness change plus its side effects
#[derive(Debug, Clone)]
pub struct ReadyOutcome {
    pub challenge: ChallengeRequest,
    /// True exactly once per challenge, for the call that completed ready-up
    pub veto_started: bool,
    pub cancelled: Vec<ChallengeId>,
}

/// Governs challenges between two teams
pub struct ChallengeLifecycle {
    teams: Arc<dyn TeamStore>,
    challenges: Arc<dyn ChallengeStore>,
    vetoes: Arc<dyn VetoStore>,
    hosting: Arc<dyn HostingApi>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    metrics: Arc<MetricsCollector>,
    ttl: Duration,
    transitions: Mutex<()>,
}

impl ChallengeLifecycle {
    pub fn new(
        repos: &Repositories,
        hosting: Arc<dyn HostingApi>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        metrics: Arc<MetricsCollector>,
        ttl: Duration,
    ) -> Self {
        Self {
            teams: repos.teams.clone(),
            challenges: repos.challenges.clone(),
            vetoes: repos.vetoes.clone(),
            hosting,
            clock,
            notifier,
            metrics,
            ttl,
            transitions: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The team `actor` leads
    pub fn leader_team(&self, actor: PlayerId) -> Result<Team> {
        let team = self
            .teams
            .team_of(actor)?
            .ok_or(MatchmakingError::NotInTeam { player_id: actor })?;
        if !team.is_leader(actor) {
            return Err(MatchmakingError::NotLeader {
                player_id: actor,
                team_id: team.id,
            }
            .into());
        }
        Ok(team)
    }

    pub fn get(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRequest>> {
        self.challenges.get(challenge_id)
    }

    /// Non-terminal, unexpired challenges the team takes part in
    pub fn active_for_team(&self, team_id: TeamId) -> Result<Vec<ChallengeRequest>> {
        let now = self.clock.now();
        Ok(self
            .challenges
            .for_team(team_id)?
            .into_iter()
            .filter(|challenge| challenge.is_live(now))
            .collect())
    }

    /// Propose a match from the actor's team to another team
    pub async fn challenge(
        &self,
        actor: PlayerId,
        target_team_id: TeamId,
        message: Option<String>,
    ) -> Result<ChallengeRequest> {
        let team = self.leader_team(actor)?;
        if team.id == target_team_id {
            return Err(MatchmakingError::SelfChallenge { team_id: team.id }.into());
        }
        let target = self
            .teams
            .get(target_team_id)?
            .ok_or(MatchmakingError::TeamNotFound {
                team_id: target_team_id,
            })?;

        let created = {
            let _guard = self.transitions.lock().await;
            let now = self.clock.now();

            let already_pending = self.challenges.for_team(team.id)?.iter().any(|c| {
                c.status == ChallengeStatus::Pending
                    && !c.is_expired(now)
                    && c.is_participant(target.id)
            });
            if already_pending {
                return Err(MatchmakingError::AlreadyChallenged {
                    challenger_team_id: team.id,
                    challenged_team_id: target.id,
                }
                .into());
            }
            for team_id in [team.id, target.id] {
                self.ensure_not_in_accepted(team_id)?;
            }

            self.challenges
                .insert(self.new_pending(team.id, target.id, message, now))?
        };

        info!(
            "Team {} challenged team {} (challenge {})",
            team.id, target.id, created.id
        );
        self.metrics
            .record_challenge_transition(ChallengeStatus::Pending);
        self.notifier.challenge_updated(&created, None, self.clock.now()).await;
        Ok(created)
    }

    /// Accept a pending challenge and decline the team's other pending ones
    pub async fn accept_and_supersede(
        &self,
        actor: PlayerId,
        challenge_id: ChallengeId,
    ) -> Result<AcceptOutcome> {
        let team = self.leader_team(actor)?;

        let (accepted, superseded) = {
            let _guard = self.transitions.lock().await;
            let challenge = self.live_challenge(challenge_id)?;
            require_challenged(&challenge, team.id)?;
            if !challenge.status.can_transition_to(ChallengeStatus::Accepted) {
                return Err(MatchmakingError::InvalidTransition {
                    from: challenge.status,
                    to: ChallengeStatus::Accepted,
                }
                .into());
            }
            for team_id in [challenge.challenger_team_id, challenge.challenged_team_id] {
                self.ensure_not_in_accepted(team_id)?;
            }

            let now = self.clock.now();
            let accepted = self.challenges.update(challenge_id, &mut |c| {
                if c.is_expired(now) {
                    return Err(MatchmakingError::ChallengeNotFound { challenge_id }.into());
                }
                c.transition(ChallengeStatus::Accepted)?;
                c.accepted_at = Some(now);
                Ok(())
            })?;
            let superseded =
                self.close_other_pending(team.id, challenge_id, ChallengeStatus::Declined, now)?;
            (accepted, superseded)
        };

        info!(
            "Team {} accepted challenge {}, superseding {} pending",
            team.id,
            challenge_id,
            superseded.len()
        );
        self.metrics
            .record_challenge_transition(ChallengeStatus::Accepted);
        self.notifier.challenge_updated(&accepted, None, self.clock.now()).await;
        self.announce_closed(&superseded, "superseded by an accepted challenge")
            .await;

        Ok(AcceptOutcome {
            challenge: accepted,
            superseded: superseded.iter().map(|c| c.id).collect(),
        })
    }

    pub async fn decline(&self, actor: PlayerId, challenge_id: ChallengeId) -> Result<ChallengeRequest> {
        let team = self.leader_team(actor)?;

        let declined = {
            let _guard = self.transitions.lock().await;
            let challenge = self.live_challenge(challenge_id)?;
            require_challenged(&challenge, team.id)?;

            let now = self.clock.now();
            self.challenges.update(challenge_id, &mut |c| {
                c.transition(ChallengeStatus::Declined)?;
                c.closed_at = Some(now);
                Ok(())
            })?
        };

        info!("Team {} declined challenge {}", team.id, challenge_id);
        self.metrics
            .record_challenge_transition(ChallengeStatus::Declined);
        self.notifier.challenge_updated(&declined, None, self.clock.now()).await;
        Ok(declined)
    }

    /// Mark the actor's side ready; completing ready-up opens the map veto
    pub async fn mark_ready(&self, actor: PlayerId, challenge_id: ChallengeId) -> Result<ReadyOutcome> {
        let team = self.leader_team(actor)?;

        let (challenge, veto_started, cancelled) = {
            let _guard = self.transitions.lock().await;
            let current = self
                .challenges
                .get(challenge_id)?
                .ok_or(MatchmakingError::ChallengeNotFound { challenge_id })?;
            let role = current
                .role_of(team.id)
                .ok_or(MatchmakingError::NotParticipant {
                    challenge_id,
                    team_id: team.id,
                })?;

            let now = self.clock.now();
            let mut veto_started = false;
            let challenge = self.challenges.update(challenge_id, &mut |c| {
                if c.status != ChallengeStatus::Accepted {
                    return Err(MatchmakingError::InvalidChallengeState {
                        challenge_id,
                        reason: format!("cannot ready up while {}", c.status),
                    }
                    .into());
                }
                c.set_ready(role);
                // One-shot edge: only the write that sets it starts the veto
                if c.both_ready() && c.veto_started_at.is_none() {
                    c.veto_started_at = Some(now);
                    veto_started = true;
                }
                Ok(())
            })?;
            let cancelled =
                self.close_other_pending(team.id, challenge_id, ChallengeStatus::Cancelled, now)?;
            (challenge, veto_started, cancelled)
        };

        info!(
            "Team {} is ready for challenge {} (both ready: {})",
            team.id,
            challenge_id,
            challenge.both_ready()
        );
        self.notifier.challenge_updated(&challenge, None, self.clock.now()).await;
        self.announce_closed(&cancelled, "team readied up for another challenge")
            .await;

        Ok(ReadyOutcome {
            challenge,
            veto_started,
            cancelled: cancelled.iter().map(|c| c.id).collect(),
        })
    }

    /// Append a ban while the veto is still open
    ///
    /// Held under the transition lock so a concurrent withdrawal either purges
    /// the entry afterwards or is seen here and rejects it.
    pub async fn record_ban(&self, entry: MapVetoEntry) -> Result<()> {
        let challenge_id = entry.challenge_id;
        let _guard = self.transitions.lock().await;
        let current = self
            .challenges
            .get(challenge_id)?
            .ok_or(MatchmakingError::ChallengeNotFound { challenge_id })?;
        if current.status != ChallengeStatus::Accepted || current.final_map.is_some() {
            return Err(MatchmakingError::VetoNotActive { challenge_id }.into());
        }
        self.vetoes.append(entry)
    }

    /// Withdraw from a challenge before its match has started
    pub async fn leave(&self, actor: PlayerId, challenge_id: ChallengeId) -> Result<ChallengeRequest> {
        let team = self.leader_team(actor)?;
        let challenge = self
            .challenges
            .get(challenge_id)?
            .ok_or(MatchmakingError::ChallengeNotFound { challenge_id })?;
        if !challenge.is_participant(team.id) {
            return Err(MatchmakingError::NotParticipant {
                challenge_id,
                team_id: team.id,
            }
            .into());
        }

        let reason = format!("team {} left", team.id);
        self.withdraw(challenge_id, &reason).await
    }

    /// Cancel a challenge on the system's behalf; `None` if it can no longer
    /// be cancelled
    pub async fn force_cancel(
        &self,
        challenge_id: ChallengeId,
        reason: &str,
    ) -> Result<Option<ChallengeRequest>> {
        match self.withdraw(challenge_id, reason).await {
            Ok(challenge) => Ok(Some(challenge)),
            Err(e) => match e.downcast_ref::<MatchmakingError>() {
                Some(MatchmakingError::InvalidTransition { .. })
                | Some(MatchmakingError::InvalidChallengeState { .. }) => {
                    debug!("Challenge {} not cancelled: {}", challenge_id, e);
                    Ok(None)
                }
                _ => Err(e),
            },
        }
    }

    async fn withdraw(&self, challenge_id: ChallengeId, reason: &str) -> Result<ChallengeRequest> {
        let cancelled = {
            let _guard = self.transitions.lock().await;
            let now = self.clock.now();
            self.challenges.update(challenge_id, &mut |c| {
                if c.match_started_at.is_some() {
                    return Err(MatchmakingError::InvalidChallengeState {
                        challenge_id,
                        reason: "match already started".to_string(),
                    }
                    .into());
                }
                c.transition(ChallengeStatus::Cancelled)?;
                c.closed_at = Some(now);
                Ok(())
            })?
        };

        let purged = self.vetoes.purge(challenge_id)?;
        self.release_external_teams(&cancelled).await;

        info!(
            "Challenge {} cancelled ({}), {} veto entries purged",
            challenge_id, reason, purged
        );
        self.metrics
            .record_challenge_transition(ChallengeStatus::Cancelled);
        self.notifier
            .challenge_updated(&cancelled, Some(reason), self.clock.now())
            .await;
        Ok(cancelled)
    }

    /// Decline or cancel every other pending challenge the team is part of
    pub async fn cancel_other_pending(
        &self,
        team_id: TeamId,
        keep: ChallengeId,
        status: ChallengeStatus,
    ) -> Result<Vec<ChallengeId>> {
        let closed = {
            let _guard = self.transitions.lock().await;
            self.close_other_pending(team_id, keep, status, self.clock.now())?
        };
        self.announce_closed(&closed, "superseded").await;
        Ok(closed.iter().map(|c| c.id).collect())
    }

    fn close_other_pending(
        &self,
        team_id: TeamId,
        keep: ChallengeId,
        status: ChallengeStatus,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChallengeRequest>> {
        let mut closed = Vec::new();
        for other in self.challenges.for_team(team_id)? {
            if other.id == keep || other.status != ChallengeStatus::Pending {
                continue;
            }
            let result = self.challenges.update(other.id, &mut |c| {
                c.transition(status)?;
                c.closed_at = Some(now);
                Ok(())
            });
            match result {
                Ok(challenge) => closed.push(challenge),
                Err(e) if is_invalid_transition(&e) => {
                    debug!("Challenge {} changed underneath us: {}", other.id, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(closed)
    }

    async fn announce_closed(&self, closed: &[ChallengeRequest], reason: &str) {
        for challenge in closed {
            self.metrics.record_challenge_transition(challenge.status);
            self.notifier.challenge_updated(challenge, Some(reason), self.clock.now()).await;
        }
    }

    /// Create an already-accepted, already-ready challenge for a formed match
    pub async fn create_auto_match(
        &self,
        challenger_team_id: TeamId,
        challenged_team_id: TeamId,
        start_veto: bool,
    ) -> Result<ChallengeRequest> {
        let pending = {
            let _guard = self.transitions.lock().await;
            let now = self.clock.now();
            self.challenges.insert(self.new_pending(
                challenger_team_id,
                challenged_team_id,
                Some(AUTO_MATCH_MESSAGE.to_string()),
                now,
            ))?
        };
        self.metrics
            .record_challenge_transition(ChallengeStatus::Pending);

        self.auto_accept_and_ready(pending.id, start_veto).await
    }

    /// Skip ready-up: accept and mark both sides ready in one step
    pub async fn auto_accept_and_ready(
        &self,
        challenge_id: ChallengeId,
        start_veto: bool,
    ) -> Result<ChallengeRequest> {
        let challenge = {
            let _guard = self.transitions.lock().await;
            let now = self.clock.now();
            self.challenges.update(challenge_id, &mut |c| {
                c.transition(ChallengeStatus::Accepted)?;
                c.accepted_at = Some(now);
                c.set_ready(TeamRole::Challenger);
                c.set_ready(TeamRole::Challenged);
                if start_veto {
                    c.veto_started_at = Some(now);
                }
                Ok(())
            })?
        };

        debug!(
            "Auto-accepted challenge {} (veto: {})",
            challenge_id, start_veto
        );
        self.metrics
            .record_challenge_transition(ChallengeStatus::Accepted);
        self.notifier.challenge_updated(&challenge, None, self.clock.now()).await;
        Ok(challenge)
    }

    /// Record a locally created match; both teams go in-match
    pub async fn mark_started(
        &self,
        challenge_id: ChallengeId,
        match_id: MatchId,
    ) -> Result<ChallengeRequest> {
        let started = {
            let _guard = self.transitions.lock().await;
            let now = self.clock.now();
            self.challenges.update(challenge_id, &mut |c| {
                if c.match_id.is_some() {
                    return Err(MatchmakingError::InvalidChallengeState {
                        challenge_id,
                        reason: "a match was already started".to_string(),
                    }
                    .into());
                }
                c.transition(ChallengeStatus::Started)?;
                c.match_id = Some(match_id);
                c.match_started_at = Some(now);
                Ok(())
            })?
        };

        for team_id in [started.challenger_team_id, started.challenged_team_id] {
            set_team_status(self.teams.as_ref(), team_id, TeamStatus::InMatch)?;
        }

        info!("Challenge {} started match {}", challenge_id, match_id);
        self.metrics
            .record_challenge_transition(ChallengeStatus::Started);
        self.notifier.challenge_updated(&started, None, self.clock.now()).await;
        Ok(started)
    }

    /// Mark a started challenge completed; `None` if it already was
    pub async fn complete(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRequest>> {
        let now = self.clock.now();
        let mut already_completed = false;
        let completed = self.challenges.update(challenge_id, &mut |c| {
            if c.status == ChallengeStatus::Completed {
                already_completed = true;
                return Ok(());
            }
            c.transition(ChallengeStatus::Completed)?;
            c.closed_at = Some(now);
            Ok(())
        })?;
        if already_completed {
            return Ok(None);
        }

        info!("Challenge {} completed", challenge_id);
        self.metrics
            .record_challenge_transition(ChallengeStatus::Completed);
        self.notifier.challenge_updated(&completed, None, self.clock.now()).await;
        Ok(Some(completed))
    }

    /// Put both teams of a challenge back to waiting
    pub fn release_teams(&self, challenge: &ChallengeRequest) -> Result<()> {
        for team_id in [challenge.challenger_team_id, challenge.challenged_team_id] {
            set_team_status(self.teams.as_ref(), team_id, TeamStatus::Waiting)?;
        }
        Ok(())
    }

    /// Delete provider-side teams, clearing our references only on success
    async fn release_external_teams(&self, challenge: &ChallengeRequest) {
        let mut team_ids = Vec::new();
        let mut external_ids = Vec::new();
        for team_id in [challenge.challenger_team_id, challenge.challenged_team_id] {
            match self.teams.get(team_id) {
                Ok(Some(Team {
                    external_id: Some(external_id),
                    ..
                })) => {
                    team_ids.push(team_id);
                    external_ids.push(external_id);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to load team {}: {}", team_id, e),
            }
        }
        if external_ids.is_empty() {
            return;
        }

        if let Err(e) = self.hosting.delete_teams(&external_ids).await {
            warn!(
                "Failed to delete hosting teams {:?} for challenge {}: {}",
                external_ids, challenge.id, e
            );
            return;
        }
        for team_id in team_ids {
            if let Err(e) = self.teams.update(team_id, &mut |team| {
                team.external_id = None;
                Ok(())
            }) {
                warn!("Failed to clear hosting id of team {}: {}", team_id, e);
            }
        }
    }

    fn new_pending(
        &self,
        challenger_team_id: TeamId,
        challenged_team_id: TeamId,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> ChallengeRequest {
        ChallengeRequest {
            id: 0,
            challenger_team_id,
            challenged_team_id,
            status: ChallengeStatus::Pending,
            challenger_ready: false,
            challenged_ready: false,
            message,
            expires_at: now + to_chrono(self.ttl),
            created_at: now,
            accepted_at: None,
            veto_started_at: None,
            match_started_at: None,
            match_id: None,
            final_map: None,
            closed_at: None,
        }
    }

    /// Pending challenges past their expiry read as missing
    fn live_challenge(&self, challenge_id: ChallengeId) -> Result<ChallengeRequest> {
        let now = self.clock.now();
        match self.challenges.get(challenge_id)? {
            Some(challenge) if !challenge.is_expired(now) => Ok(challenge),
            _ => Err(MatchmakingError::ChallengeNotFound { challenge_id }.into()),
        }
    }

    fn ensure_not_in_accepted(&self, team_id: TeamId) -> Result<()> {
        let accepted = self
            .challenges
            .for_team(team_id)?
            .iter()
            .any(|c| c.status == ChallengeStatus::Accepted);
        if accepted {
            return Err(MatchmakingError::AlreadyInAcceptedChallenge { team_id }.into());
        }
        Ok(())
    }
}

fn require_challenged(challenge: &ChallengeRequest, team_id: TeamId) -> Result<()> {
    match challenge.role_of(team_id) {
        Some(TeamRole::Challenged) => Ok(()),
        Some(TeamRole::Challenger) => Err(MatchmakingError::NotChallengedTeam {
            challenge_id: challenge.id,
            team_id,
        }
        .into()),
        None => Err(MatchmakingError::NotParticipant {
            challenge_id: challenge.id,
            team_id,
        }
        .into()),
    }
}

fn is_invalid_transition(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::InvalidTransition { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::hosting::InMemoryHostingApi;
    use crate::types::{MapVetoEntry, NewTeam};
    use crate::utils::ManualClock;

    struct Harness {
        lifecycle: ChallengeLifecycle,
        repos: Repositories,
        clock: Arc<ManualClock>,
        hosting: Arc<InMemoryHostingApi>,
        publisher: Arc<MockEventPublisher>,
    }

    fn harness() -> Harness {
        let repos = Repositories::in_memory();
        let clock = Arc::new(ManualClock::default());
        let hosting = Arc::new(InMemoryHostingApi::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let lifecycle = ChallengeLifecycle::new(
            &repos,
            hosting.clone(),
            clock.clone(),
            Notifier::new(publisher.clone(), metrics.clone()),
            metrics,
            DEFAULT_CHALLENGE_TTL,
        );
        Harness {
            lifecycle,
            repos,
            clock,
            hosting,
            publisher,
        }
    }

    /// Team led by `leader` with members leader..leader+5
    fn team(h: &Harness, leader: PlayerId) -> Team {
        h.repos
            .teams
            .create(NewTeam {
                name: Some(format!("Team {}", leader)),
                is_private: false,
                region: "eu".to_string(),
                leader_id: leader,
                member_ids: (leader..leader + 5).collect(),
                ephemeral: false,
            })
            .unwrap()
    }

    fn rejection(error: &anyhow::Error) -> &MatchmakingError {
        error.downcast_ref::<MatchmakingError>().unwrap()
    }

    #[tokio::test]
    async fn test_challenge_requires_leader() {
        let h = harness();
        let a = team(&h, 100);
        let b = team(&h, 200);

        let err = h.lifecycle.challenge(101, b.id, None).await.unwrap_err();
        assert!(matches!(rejection(&err), MatchmakingError::NotLeader { .. }));

        let err = h.lifecycle.challenge(999, b.id, None).await.unwrap_err();
        assert!(matches!(rejection(&err), MatchmakingError::NotInTeam { .. }));

        let err = h.lifecycle.challenge(100, a.id, None).await.unwrap_err();
        assert!(matches!(rejection(&err), MatchmakingError::SelfChallenge { .. }));
    }

    #[tokio::test]
    async fn test_challenge_events_carry_clock_time() {
        use chrono::TimeZone;

        let h = harness();
        team(&h, 100);
        let b = team(&h, 200);
        let created_at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        h.clock.set(created_at);

        let challenge = h.lifecycle.challenge(100, b.id, None).await.unwrap();
        h.clock.advance(Duration::from_secs(30));
        h.lifecycle.decline(200, challenge.id).await.unwrap();

        let stamps: Vec<DateTime<Utc>> = h
            .publisher
            .get_published_events()
            .into_iter()
            .filter_map(|message| match message {
                crate::types::AmqpMessage::ChallengeUpdated(event) => Some(event.timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(
            stamps,
            vec![created_at, created_at + chrono::Duration::seconds(30)]
        );
    }

    #[tokio::test]
    async fn test_duplicate_challenge_rejected_in_either_direction() {
        let h = harness();
        let a = team(&h, 100);
        let b = team(&h, 200);

        h.lifecycle.challenge(100, b.id, None).await.unwrap();
        let err = h.lifecycle.challenge(200, a.id, None).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::AlreadyChallenged { .. }
        ));

        // Once expired, a new challenge is allowed
        h.clock.advance(DEFAULT_CHALLENGE_TTL);
        assert!(h.lifecycle.challenge(200, a.id, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_accept_declines_other_pending() {
        let h = harness();
        let a = team(&h, 100);
        let b = team(&h, 200);
        let c = team(&h, 300);
        let d = team(&h, 400);

        let ab = h.lifecycle.challenge(100, b.id, None).await.unwrap();
        let cb = h.lifecycle.challenge(300, b.id, None).await.unwrap();
        let bd = h.lifecycle.challenge(200, d.id, None).await.unwrap();
        let ca = h.lifecycle.challenge(300, a.id, None).await.unwrap();

        let outcome = h.lifecycle.accept_and_supersede(200, ab.id).await.unwrap();
        assert_eq!(outcome.challenge.status, ChallengeStatus::Accepted);
        assert_eq!(outcome.superseded, vec![cb.id, bd.id]);

        for id in [cb.id, bd.id] {
            let closed = h.lifecycle.get(id).unwrap().unwrap();
            assert_eq!(closed.status, ChallengeStatus::Declined);
        }
        // Not involving the accepting team
        assert_eq!(
            h.lifecycle.get(ca.id).unwrap().unwrap().status,
            ChallengeStatus::Pending
        );

        // A is now in an accepted challenge, so C's challenge cannot be accepted
        let err = h
            .lifecycle
            .accept_and_supersede(100, ca.id)
            .await
            .unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::AlreadyInAcceptedChallenge { .. }
        ));
        let _ = c;
    }

    #[tokio::test]
    async fn test_only_challenged_team_may_accept_or_decline() {
        let h = harness();
        let _a = team(&h, 100);
        let b = team(&h, 200);
        let _c = team(&h, 300);
        let ab = h.lifecycle.challenge(100, b.id, None).await.unwrap();

        let err = h.lifecycle.accept_and_supersede(100, ab.id).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::NotChallengedTeam { .. }
        ));
        let err = h.lifecycle.decline(300, ab.id).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::NotParticipant { .. }
        ));

        let declined = h.lifecycle.decline(200, ab.id).await.unwrap();
        assert_eq!(declined.status, ChallengeStatus::Declined);
        assert!(declined.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_challenge_reads_as_not_found() {
        let h = harness();
        let _a = team(&h, 100);
        let b = team(&h, 200);
        let ab = h.lifecycle.challenge(100, b.id, None).await.unwrap();

        h.clock.advance(DEFAULT_CHALLENGE_TTL + Duration::from_secs(1));
        let err = h.lifecycle.accept_and_supersede(200, ab.id).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::ChallengeNotFound { .. }
        ));
        assert!(h.lifecycle.active_for_team(b.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ready_up_starts_veto_once() {
        let h = harness();
        let _a = team(&h, 100);
        let b = team(&h, 200);
        let c = team(&h, 300);
        let ab = h.lifecycle.challenge(100, b.id, None).await.unwrap();
        let ac = h.lifecycle.challenge(100, c.id, None).await.unwrap();

        let err = h.lifecycle.mark_ready(100, ab.id).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::InvalidChallengeState { .. }
        ));

        h.lifecycle.accept_and_supersede(200, ab.id).await.unwrap();

        let first = h.lifecycle.mark_ready(100, ab.id).await.unwrap();
        assert!(!first.veto_started);
        assert_eq!(first.cancelled, vec![ac.id]);

        let second = h.lifecycle.mark_ready(200, ab.id).await.unwrap();
        assert!(second.veto_started);
        assert!(second.challenge.veto_started_at.is_some());

        let again = h.lifecycle.mark_ready(200, ab.id).await.unwrap();
        assert!(!again.veto_started);

        // The side-effect-cancelled challenge rejects further actions
        let err = h.lifecycle.accept_and_supersede(300, ac.id).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn test_leave_cleans_up_veto_and_hosting_teams() {
        let h = harness();
        let a = team(&h, 100);
        let b = team(&h, 200);
        let ab = h.lifecycle.challenge(100, b.id, None).await.unwrap();
        h.lifecycle.accept_and_supersede(200, ab.id).await.unwrap();

        h.repos
            .vetoes
            .append(MapVetoEntry {
                challenge_id: ab.id,
                map_name: "de_nuke".to_string(),
                banning_team_id: a.id,
                ordinal: 0,
                banned_at: h.clock.now(),
            })
            .unwrap();
        for (team_id, external) in [(a.id, "team-a"), (b.id, "team-b")] {
            h.repos
                .teams
                .update(team_id, &mut |t| {
                    t.external_id = Some(external.to_string());
                    Ok(())
                })
                .unwrap();
        }

        let left = h.lifecycle.leave(200, ab.id).await.unwrap();
        assert_eq!(left.status, ChallengeStatus::Cancelled);
        assert!(h.repos.vetoes.entries(ab.id).unwrap().is_empty());
        assert_eq!(
            h.hosting.deleted_teams(),
            vec!["team-a".to_string(), "team-b".to_string()]
        );
        assert_eq!(h.repos.teams.get(a.id).unwrap().unwrap().external_id, None);
    }

    #[tokio::test]
    async fn test_cannot_leave_after_match_started() {
        let h = harness();
        let _a = team(&h, 100);
        let b = team(&h, 200);
        let ab = h.lifecycle.challenge(100, b.id, None).await.unwrap();
        h.lifecycle.accept_and_supersede(200, ab.id).await.unwrap();
        h.lifecycle.mark_started(ab.id, 7).await.unwrap();

        let err = h.lifecycle.leave(100, ab.id).await.unwrap_err();
        assert!(matches!(
            rejection(&err),
            MatchmakingError::InvalidChallengeState { .. }
        ));
        assert_eq!(h.lifecycle.force_cancel(ab.id, "timeout").await.unwrap(), None);
        assert_eq!(
            h.repos.teams.get(b.id).unwrap().unwrap().status,
            TeamStatus::InMatch
        );
    }

    #[tokio::test]
    async fn test_auto_match_is_accepted_and_ready() {
        let h = harness();
        let a = team(&h, 100);
        let b = team(&h, 200);

        let challenge = h.lifecycle.create_auto_match(a.id, b.id, false).await.unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Accepted);
        assert!(challenge.both_ready());
        assert!(challenge.veto_started_at.is_none());

        h.lifecycle.mark_started(challenge.id, 1).await.unwrap();
        assert!(h.lifecycle.complete(challenge.id).await.unwrap().is_some());
        assert!(h.lifecycle.complete(challenge.id).await.unwrap().is_none());

        let keys = h.publisher.routing_keys();
        assert_eq!(
            keys,
            vec![
                "challenge.accepted",
                "challenge.started",
                "challenge.completed"
            ]
        );
    }
}
