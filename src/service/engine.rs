//! The engine facade the web layer and the background tasks talk to
//!
//! `MatchmakingEngine` owns one instance of every component and wires the
//! hand-offs between them: a queue join triggers a formation pass, the second
//! ready-up opens the veto, and the last ban starts the match.

use crate::amqp::publisher::{EventPublisher, LoggingEventPublisher, Notifier};
use crate::challenge::{AcceptOutcome, ChallengeLifecycle, TeamRoster};
use crate::config::AppConfig;
use crate::error::{MatchmakingError, Result, StartMatchError};
use crate::formation::{
    FirstFitPlanner, FormationReport, FormationSettings, MatchFormationScheduler, MatchPlanner,
};
use crate::hosting::{HostingApi, InMemoryHostingApi, ServerProbe, StaticServerProbe};
use crate::matches::{ConnectionReport, MatchMonitor, MatchOrchestrator, ReconcileReport};
use crate::metrics::MetricsCollector;
use crate::queue::{
    InMemoryStore, JoinOutcome, KeyValueStore, LeaveOutcome, QueueSettings, QueueStore,
};
use crate::rating::{ExtendedWengLinConfig, RatingCalculator, WengLinRatingCalculator};
use crate::storage::Repositories;
use crate::types::{
    ChallengeId, ChallengeRequest, GameMatch, PlayerId, QueueCount, QueueGroup, Team, TeamId,
    TeamStatus, MATCH_PLAYERS,
};
use crate::utils::{Clock, SystemClock};
use crate::veto::{BanOutcome, DraftSettings, MapPool, MapVetoDraft, VetoStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the engine needs from the outside world
#[derive(Clone)]
pub struct EngineDeps {
    pub repos: Repositories,
    pub queue_backend: Arc<dyn KeyValueStore>,
    pub hosting: Arc<dyn HostingApi>,
    pub probe: Arc<dyn ServerProbe>,
    pub publisher: Arc<dyn EventPublisher>,
    pub calculator: Arc<dyn RatingCalculator>,
    pub planner: Arc<dyn MatchPlanner>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<MetricsCollector>,
}

impl EngineDeps {
    /// Fakes for every collaborator; what the simulator runs on
    pub fn in_memory(metrics: Arc<MetricsCollector>) -> Result<Self> {
        Ok(Self {
            repos: Repositories::in_memory(),
            queue_backend: Arc::new(InMemoryStore::new()),
            hosting: Arc::new(InMemoryHostingApi::new()),
            probe: Arc::new(StaticServerProbe::new(MATCH_PLAYERS)),
            publisher: Arc::new(LoggingEventPublisher),
            calculator: Arc::new(WengLinRatingCalculator::new(
                ExtendedWengLinConfig::default(),
            )?),
            planner: Arc::new(FirstFitPlanner),
            clock: Arc::new(SystemClock),
            metrics,
        })
    }
}

impl std::fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDeps")
            .field("repos", &self.repos)
            .finish_non_exhaustive()
    }
}

/// Tunables for every component, usually read from `AppConfig`
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub queue: QueueSettings,
    pub challenge_ttl: Duration,
    pub draft: DraftSettings,
    pub formation: FormationSettings,
    pub connection_grace: Duration,
    /// Run a formation pass inline after every successful join
    pub form_on_join: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            challenge_ttl: crate::challenge::DEFAULT_CHALLENGE_TTL,
            draft: DraftSettings::default(),
            formation: FormationSettings::default(),
            connection_grace: crate::matches::DEFAULT_CONNECTION_GRACE,
            form_on_join: true,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            queue: QueueSettings::from(&config.queue),
            challenge_ttl: config.challenge_ttl(),
            draft: DraftSettings {
                pool: MapPool::new(config.veto.map_pool.clone())?,
                turn_timeout: config.veto_turn_timeout(),
                overall_timeout: config.veto_overall_timeout(),
            },
            formation: FormationSettings {
                auto_match_veto: config.matchmaking.auto_match_veto,
                region: config.matchmaking.default_region.clone(),
            },
            connection_grace: config.connection_grace(),
            form_on_join: true,
        })
    }
}

/// A queue join and the formation pass it triggered
#[derive(Debug, Clone)]
pub struct QueueJoinResult {
    pub outcome: JoinOutcome,
    pub formation: Option<FormationReport>,
}

/// A ready-up, plus the veto if it was the second one
#[derive(Debug, Clone)]
pub struct ReadyResult {
    pub challenge: ChallengeRequest,
    pub veto: Option<VetoStatus>,
    pub cancelled: Vec<ChallengeId>,
}

/// What a ban led to
#[derive(Debug, Clone)]
pub enum BanResult {
    Banned(VetoStatus),
    MatchStarted {
        final_map: String,
        game_match: GameMatch,
    },
    /// The veto finished but the hosting provider refused the match
    StartFailed {
        final_map: String,
        error: StartMatchError,
    },
    TimedOut,
}

pub struct MatchmakingEngine {
    repos: Repositories,
    queue: Arc<QueueStore>,
    roster: TeamRoster,
    lifecycle: Arc<ChallengeLifecycle>,
    draft: Arc<MapVetoDraft>,
    orchestrator: Arc<MatchOrchestrator>,
    scheduler: MatchFormationScheduler,
    monitor: MatchMonitor,
    metrics: Arc<MetricsCollector>,
    form_on_join: bool,
}

impl MatchmakingEngine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        let EngineDeps {
            repos,
            queue_backend,
            hosting,
            probe,
            publisher,
            calculator,
            planner,
            clock,
            metrics,
        } = deps;
        let notifier = Notifier::new(publisher, metrics.clone());

        let queue = Arc::new(QueueStore::new(
            queue_backend,
            settings.queue,
            clock.clone(),
            metrics.clone(),
        ));
        let roster = TeamRoster::new(repos.teams.clone(), settings.formation.region.clone());
        let lifecycle = Arc::new(ChallengeLifecycle::new(
            &repos,
            hosting.clone(),
            clock.clone(),
            notifier.clone(),
            metrics.clone(),
            settings.challenge_ttl,
        ));
        let draft = Arc::new(MapVetoDraft::new(
            &repos,
            lifecycle.clone(),
            settings.draft,
            clock.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let orchestrator = Arc::new(MatchOrchestrator::new(
            &repos,
            lifecycle.clone(),
            hosting.clone(),
            clock.clone(),
            notifier.clone(),
            metrics.clone(),
        ));
        let scheduler = MatchFormationScheduler::new(
            queue.clone(),
            repos.teams.clone(),
            lifecycle.clone(),
            orchestrator.clone(),
            draft.clone(),
            planner,
            settings.formation,
            notifier.clone(),
            metrics.clone(),
        );
        let monitor = MatchMonitor::new(
            &repos,
            calculator,
            lifecycle.clone(),
            hosting,
            probe,
            clock,
            notifier,
            metrics.clone(),
            settings.connection_grace,
        );

        Self {
            repos,
            queue,
            roster,
            lifecycle,
            draft,
            orchestrator,
            scheduler,
            monitor,
            metrics,
            form_on_join: settings.form_on_join,
        }
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn queue(&self) -> Arc<QueueStore> {
        self.queue.clone()
    }

    pub fn lifecycle(&self) -> Arc<ChallengeLifecycle> {
        self.lifecycle.clone()
    }

    pub fn draft(&self) -> Arc<MapVetoDraft> {
        self.draft.clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    // Queue

    /// Queue a player on their own
    pub async fn join_queue(&self, player_id: PlayerId) -> Result<QueueJoinResult> {
        let outcome = self.queue.join_solo(player_id).await?;
        self.after_join(outcome).await
    }

    /// Queue the actor's whole team; only its leader may do this
    pub async fn join_queue_as_team(&self, actor: PlayerId) -> Result<QueueJoinResult> {
        let team = self.lifecycle.leader_team(actor)?;
        if team.status != TeamStatus::Waiting {
            return Err(MatchmakingError::InvalidQueueRequest {
                reason: format!("team {} is already in a match", team.id),
            }
            .into());
        }
        let outcome = self.queue.join_team(team.id, team.member_ids).await?;
        self.after_join(outcome).await
    }

    async fn after_join(&self, outcome: JoinOutcome) -> Result<QueueJoinResult> {
        let formation = match (&outcome, self.form_on_join) {
            (JoinOutcome::Joined(_), true) => match self.scheduler.try_form_matches().await {
                Ok(report) => Some(report),
                Err(e) => {
                    // The join itself went through
                    warn!("Formation pass after join failed: {}", e);
                    None
                }
            },
            _ => None,
        };
        self.refresh_queue_gauges().await;
        Ok(QueueJoinResult { outcome, formation })
    }

    pub async fn leave_queue(&self, player_id: PlayerId) -> Result<LeaveOutcome> {
        let outcome = self.queue.leave(player_id).await?;
        self.refresh_queue_gauges().await;
        Ok(outcome)
    }

    /// Take the actor's whole team out of the queue
    pub async fn leave_queue_as_team(&self, actor: PlayerId) -> Result<LeaveOutcome> {
        let team = self.lifecycle.leader_team(actor)?;
        let outcome = self.queue.leave_team(team.id).await?;
        self.refresh_queue_gauges().await;
        Ok(outcome)
    }

    pub async fn queue_snapshot(&self) -> Vec<QueueGroup> {
        self.queue.snapshot().await
    }

    pub async fn queue_count(&self) -> QueueCount {
        let count = self.queue.count().await;
        self.metrics.update_queue_counts(count);
        count
    }

    async fn refresh_queue_gauges(&self) {
        self.metrics.update_queue_counts(self.queue.count().await);
    }

    // Teams

    pub fn create_team(
        &self,
        creator: PlayerId,
        name: Option<String>,
        members: &[PlayerId],
        region: Option<&str>,
    ) -> Result<Team> {
        self.roster.create_team(creator, name, members, region)
    }

    pub fn transfer_leadership(
        &self,
        actor: PlayerId,
        team_id: TeamId,
        new_leader: PlayerId,
    ) -> Result<Team> {
        self.roster.transfer_leadership(actor, team_id, new_leader)
    }

    pub fn team_of(&self, player_id: PlayerId) -> Result<Option<Team>> {
        self.roster.team_of(player_id)
    }

    // Challenges

    pub async fn challenge(
        &self,
        actor: PlayerId,
        target_team_id: TeamId,
        message: Option<String>,
    ) -> Result<ChallengeRequest> {
        self.lifecycle.challenge(actor, target_team_id, message).await
    }

    pub async fn accept(&self, actor: PlayerId, challenge_id: ChallengeId) -> Result<AcceptOutcome> {
        self.lifecycle.accept_and_supersede(actor, challenge_id).await
    }

    pub async fn decline(&self, actor: PlayerId, challenge_id: ChallengeId) -> Result<ChallengeRequest> {
        self.lifecycle.decline(actor, challenge_id).await
    }

    /// Ready the actor's side; the second ready-up opens the map veto
    pub async fn mark_ready(&self, actor: PlayerId, challenge_id: ChallengeId) -> Result<ReadyResult> {
        let outcome = self.lifecycle.mark_ready(actor, challenge_id).await?;
        let veto = if outcome.veto_started {
            Some(self.draft.begin(&outcome.challenge).await?)
        } else {
            None
        };
        Ok(ReadyResult {
            challenge: outcome.challenge,
            veto,
            cancelled: outcome.cancelled,
        })
    }

    pub async fn leave_challenge(
        &self,
        actor: PlayerId,
        challenge_id: ChallengeId,
    ) -> Result<ChallengeRequest> {
        self.lifecycle.leave(actor, challenge_id).await
    }

    pub fn challenges_for(&self, team_id: TeamId) -> Result<Vec<ChallengeRequest>> {
        self.lifecycle.active_for_team(team_id)
    }

    // Veto

    pub async fn veto_state(&self, challenge_id: ChallengeId) -> Result<VetoStatus> {
        self.draft.state(challenge_id).await
    }

    /// Ban a map; the ban that leaves one map starts the match on it
    pub async fn ban(
        &self,
        actor: PlayerId,
        challenge_id: ChallengeId,
        map_name: &str,
    ) -> Result<BanResult> {
        match self.draft.ban(actor, challenge_id, map_name).await? {
            BanOutcome::Banned(status) => Ok(BanResult::Banned(status)),
            BanOutcome::TimedOut => Ok(BanResult::TimedOut),
            BanOutcome::Completed {
                challenge,
                final_map,
            } => match self
                .orchestrator
                .start_match(&challenge, Some(&final_map))
                .await
            {
                Ok(game_match) => Ok(BanResult::MatchStarted {
                    final_map,
                    game_match,
                }),
                Err(error) => {
                    warn!(
                        "Veto for challenge {} finished on {} but the match did not start: {}",
                        challenge_id, final_map, error
                    );
                    Ok(BanResult::StartFailed { final_map, error })
                }
            },
        }
    }

    // Background passes

    pub async fn form_matches(&self) -> Result<FormationReport> {
        let report = self.scheduler.try_form_matches().await?;
        if !report.formed.is_empty() {
            self.refresh_queue_gauges().await;
        }
        Ok(report)
    }

    pub async fn reconcile_results(&self) -> Result<ReconcileReport> {
        self.monitor.reconcile_results().await
    }

    pub async fn check_connection_timeouts(&self) -> Result<ConnectionReport> {
        self.monitor.check_connection_timeouts().await
    }

    pub async fn sweep_veto_timeouts(&self) -> Result<Vec<ChallengeId>> {
        let timed_out = self.draft.sweep_timeouts().await?;
        if !timed_out.is_empty() {
            info!("Swept {} timed out vetoes", timed_out.len());
        } else {
            debug!("Veto sweep found nothing to time out");
        }
        Ok(timed_out)
    }
}

impl std::fmt::Debug for MatchmakingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchmakingEngine")
            .field("form_on_join", &self.form_on_join)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::hosting::HostedMatchStatus;
    use crate::types::{ChallengeStatus, TeamRole};
    use crate::utils::ManualClock;

    struct Harness {
        engine: MatchmakingEngine,
        hosting: Arc<InMemoryHostingApi>,
        publisher: Arc<MockEventPublisher>,
    }

    fn harness() -> Harness {
        let hosting = Arc::new(InMemoryHostingApi::new());
        let publisher = Arc::new(MockEventPublisher::new());
        let metrics = Arc::new(MetricsCollector::default());
        let mut deps = EngineDeps::in_memory(metrics).unwrap();
        deps.hosting = hosting.clone();
        deps.publisher = publisher.clone();
        deps.clock = Arc::new(ManualClock::default());

        Harness {
            engine: MatchmakingEngine::new(deps, EngineSettings::default()),
            hosting,
            publisher,
        }
    }

    async fn ready_pair(engine: &MatchmakingEngine) -> (Team, Team, ChallengeRequest) {
        let a = engine
            .create_team(1, Some("Alpha".into()), &[2, 3, 4, 5], None)
            .unwrap();
        let b = engine
            .create_team(11, Some("Bravo".into()), &[12, 13, 14, 15], None)
            .unwrap();
        let challenge = engine.challenge(1, b.id, None).await.unwrap();
        engine.accept(11, challenge.id).await.unwrap();
        (a, b, challenge)
    }

    #[tokio::test]
    async fn test_tenth_solo_join_forms_and_starts_a_match() {
        let h = harness();
        for player in 1..10 {
            let joined = h.engine.join_queue(player).await.unwrap();
            assert_eq!(joined.formation.unwrap().formed.len(), 0);
        }

        let joined = h.engine.join_queue(10).await.unwrap();
        let report = joined.formation.unwrap();
        assert_eq!(report.started(), 1);
        assert_eq!(h.engine.queue_count().await.players, 0);
        assert_eq!(h.hosting.created_matches().len(), 1);
    }

    #[tokio::test]
    async fn test_only_leader_can_queue_the_team() {
        let h = harness();
        let team = h.engine.create_team(1, None, &[2, 3, 4, 5], None).unwrap();

        let err = h.engine.join_queue_as_team(2).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MatchmakingError>(),
            Some(MatchmakingError::NotLeader { .. })
        ));

        let joined = h.engine.join_queue_as_team(1).await.unwrap();
        assert_eq!(joined.outcome.group().unwrap().team_id(), Some(team.id));
    }

    #[tokio::test]
    async fn test_second_ready_opens_the_veto() {
        let h = harness();
        let (a, _, challenge) = ready_pair(&h.engine).await;

        let first = h.engine.mark_ready(1, challenge.id).await.unwrap();
        assert!(first.veto.is_none());

        let second = h.engine.mark_ready(11, challenge.id).await.unwrap();
        let veto = second.veto.unwrap();
        assert_eq!(veto.current_role, Some(TeamRole::Challenger));
        assert_eq!(veto.current_team_id, Some(a.id));
        assert!(h
            .publisher
            .routing_keys()
            .contains(&"veto.started".to_string()));
    }

    #[tokio::test]
    async fn test_full_veto_starts_match_on_last_map() {
        let h = harness();
        let (_, _, challenge) = ready_pair(&h.engine).await;
        h.engine.mark_ready(1, challenge.id).await.unwrap();
        h.engine.mark_ready(11, challenge.id).await.unwrap();

        let pool = h.engine.draft().pool().maps().to_vec();
        let mut last = None;
        for (ordinal, map) in pool.iter().take(pool.len() - 1).enumerate() {
            let leader = if ordinal % 2 == 0 { 1 } else { 11 };
            last = Some(h.engine.ban(leader, challenge.id, map).await.unwrap());
        }

        match last.unwrap() {
            BanResult::MatchStarted {
                final_map,
                game_match,
            } => {
                assert_eq!(&final_map, pool.last().unwrap());
                assert_eq!(game_match.map.as_deref(), Some(final_map.as_str()));
            }
            other => panic!("expected a started match, got {:?}", other),
        }
        let stored = h.engine.lifecycle().get(challenge.id).unwrap().unwrap();
        assert_eq!(stored.status, ChallengeStatus::Started);
    }

    #[tokio::test]
    async fn test_finished_match_releases_teams() {
        let h = harness();
        for player in 1..=10 {
            h.engine.join_queue(player).await.unwrap();
        }
        let (external_id, _) = h.hosting.created_matches().remove(0);
        h.hosting.set_match_status(
            &external_id,
            HostedMatchStatus {
                end_time: Some(chrono::Utc::now()),
                team1_score: 16,
                team2_score: 9,
                ..HostedMatchStatus::default()
            },
        );

        let report = h.engine.reconcile_results().await.unwrap();
        assert_eq!(report.finished, 1);
        assert!(h
            .engine
            .repos()
            .teams
            .list()
            .unwrap()
            .iter()
            .all(|team| team.status == TeamStatus::Waiting));
    }
}
