//! Turns queued groups into auto-accepted challenges and starts them
//!
//! A pass holds the queue lock only while planning and materialising. Hand-off
//! to the orchestrator (or the veto) happens after the lock is released, so
//! slow provider calls never block queue joins.

use crate::amqp::publisher::Notifier;
use crate::challenge::ChallengeLifecycle;
use crate::error::{Result, StartMatchError};
use crate::formation::grouping::{MatchPlan, MatchPlanner, MatchSide, PairingKind};
use crate::matches::MatchOrchestrator;
use crate::metrics::MetricsCollector;
use crate::queue::QueueStore;
use crate::storage::TeamStore;
use crate::types::{ChallengeRequest, GameMatch, MatchPhase, NewTeam, TeamId, MATCH_PLAYERS};
use crate::veto::{MapVetoDraft, VetoStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Scheduler knobs
#[derive(Debug, Clone)]
pub struct FormationSettings {
    /// Run a map veto for formed matches instead of starting them right away
    pub auto_match_veto: bool,
    /// Region given to the ephemeral teams
    pub region: String,
}

impl Default for FormationSettings {
    fn default() -> Self {
        Self {
            auto_match_veto: false,
            region: "eu".to_string(),
        }
    }
}

/// What happened to a formed match once the queue lock was released
#[derive(Debug, Clone)]
pub enum HandOff {
    Started(GameMatch),
    VetoStarted(VetoStatus),
    StartFailed(StartMatchError),
    VetoFailed(String),
}

#[derive(Debug, Clone)]
pub struct FormedMatch {
    pub challenge: ChallengeRequest,
    pub kind: PairingKind,
    pub hand_off: HandOff,
}

/// Outcome of one formation pass
#[derive(Debug, Clone, Default)]
pub struct FormationReport {
    pub formed: Vec<FormedMatch>,
    /// The queue lock was busy; nothing was attempted
    pub lock_unavailable: bool,
    /// Planning, materialisation or the queue write failed; nothing from the
    /// pass was kept
    pub aborted: bool,
}

impl FormationReport {
    pub fn started(&self) -> usize {
        self.formed
            .iter()
            .filter(|m| matches!(m.hand_off, HandOff::Started(_)))
            .count()
    }
}

pub struct MatchFormationScheduler {
    queue: Arc<QueueStore>,
    teams: Arc<dyn TeamStore>,
    lifecycle: Arc<ChallengeLifecycle>,
    orchestrator: Arc<MatchOrchestrator>,
    draft: Arc<MapVetoDraft>,
    planner: Arc<dyn MatchPlanner>,
    settings: FormationSettings,
    notifier: Notifier,
    metrics: Arc<MetricsCollector>,
}

impl MatchFormationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<QueueStore>,
        teams: Arc<dyn TeamStore>,
        lifecycle: Arc<ChallengeLifecycle>,
        orchestrator: Arc<MatchOrchestrator>,
        draft: Arc<MapVetoDraft>,
        planner: Arc<dyn MatchPlanner>,
        settings: FormationSettings,
        notifier: Notifier,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            queue,
            teams,
            lifecycle,
            orchestrator,
            draft,
            planner,
            settings,
            notifier,
            metrics,
        }
    }

    /// Form as many matches as the queue allows and hand them off
    pub async fn try_form_matches(&self) -> Result<FormationReport> {
        let timer = self.metrics.start_timer();
        self.metrics.record_formation_pass();
        let mut report = FormationReport::default();

        let Some(mut txn) = self.queue.begin().await? else {
            report.lock_unavailable = true;
            return Ok(report);
        };
        if txn.total_players() < MATCH_PLAYERS {
            txn.abort().await;
            return Ok(report);
        }

        let plans = self.planner.plan(txn.groups());
        if let Some(e) = plans.iter().find_map(|plan| plan.validate().err()) {
            error!("Match formation produced an invalid pairing: {}", e);
            self.metrics.record_formation_aborted("invalid_plan");
            txn.abort().await;
            report.aborted = true;
            return Ok(report);
        }

        let mut formed = Vec::new();
        for plan in &plans {
            match self.materialise(plan).await {
                Ok(challenge) => {
                    txn.remove_players(&plan.players());
                    formed.push((challenge, plan.kind));
                }
                Err(e) => {
                    error!(
                        "Failed to materialise a {} match, rolling back {} formed: {}",
                        plan.kind,
                        formed.len(),
                        e
                    );
                    self.metrics.record_formation_aborted("materialise");
                    txn.abort().await;
                    self.discard(&formed, "match formation rolled back").await;
                    report.aborted = true;
                    return Ok(report);
                }
            }
        }

        if formed.is_empty() {
            txn.abort().await;
            return Ok(report);
        }
        if let Err(e) = txn.commit().await {
            // Players are still queued, so the formed matches must not go ahead
            error!(
                "Failed to remove {} formed matches from the queue: {}",
                formed.len(),
                e
            );
            self.metrics.record_formation_aborted("commit");
            self.discard(&formed, "queue update failed").await;
            report.aborted = true;
            return Ok(report);
        }

        for (challenge, kind) in formed {
            self.metrics.record_match_formed(kind);
            self.notifier
                .match_lifecycle(
                    challenge.id,
                    None,
                    MatchPhase::Formed,
                    Some(kind.as_str().to_string()),
                )
                .await;
            let hand_off = self.hand_off(&challenge).await;
            report.formed.push(FormedMatch {
                challenge,
                kind,
                hand_off,
            });
        }

        if !report.formed.is_empty() {
            info!(
                "Formation pass formed {} matches ({} started) in {:?}",
                report.formed.len(),
                report.started(),
                timer.elapsed()
            );
        }
        self.metrics
            .record_operation("formation_pass", timer.elapsed());
        Ok(report)
    }

    /// Create the two single-use teams and their auto-accepted challenge
    async fn materialise(&self, plan: &MatchPlan) -> Result<ChallengeRequest> {
        let mut created: Vec<TeamId> = Vec::with_capacity(2);
        let result: Result<ChallengeRequest> = async {
            for side in &plan.sides {
                let team = self.teams.create(self.side_team(side)?)?;
                created.push(team.id);
            }
            self.lifecycle
                .create_auto_match(created[0], created[1], self.settings.auto_match_veto)
                .await
        }
        .await;

        if result.is_err() {
            for team_id in &created {
                if let Err(e) = self.teams.remove(*team_id) {
                    warn!("Failed to remove ephemeral team {}: {}", team_id, e);
                }
            }
        }
        result
    }

    /// Cancel formed challenges and drop their ephemeral teams
    async fn discard(&self, formed: &[(ChallengeRequest, PairingKind)], reason: &str) {
        for (challenge, _) in formed {
            if let Err(e) = self.lifecycle.force_cancel(challenge.id, reason).await {
                warn!("Failed to cancel formed challenge {}: {}", challenge.id, e);
            }
            for team_id in [challenge.challenger_team_id, challenge.challenged_team_id] {
                if let Err(e) = self.teams.remove(team_id) {
                    warn!("Failed to remove ephemeral team {}: {}", team_id, e);
                }
            }
        }
    }

    fn side_team(&self, side: &MatchSide) -> Result<NewTeam> {
        let name = match side.source_team {
            Some(team_id) => self.teams.get(team_id)?.and_then(|team| team.name),
            None => None,
        };
        Ok(NewTeam::ephemeral(
            side.members.clone(),
            name,
            &self.settings.region,
        ))
    }

    async fn hand_off(&self, challenge: &ChallengeRequest) -> HandOff {
        if self.settings.auto_match_veto {
            return match self.draft.begin(challenge).await {
                Ok(status) => HandOff::VetoStarted(status),
                Err(e) => {
                    warn!(
                        "Failed to open the veto for formed challenge {}: {}",
                        challenge.id, e
                    );
                    HandOff::VetoFailed(e.to_string())
                }
            };
        }

        match self.orchestrator.start_match(challenge, None).await {
            Ok(game_match) => {
                debug!(
                    "Formed challenge {} is playing match {}",
                    challenge.id, game_match.id
                );
                HandOff::Started(game_match)
            }
            Err(e) => HandOff::StartFailed(e),
        }
    }
}
