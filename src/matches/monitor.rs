//! Polls running matches for results and for players who never showed up

use crate::amqp::publisher::Notifier;
use crate::challenge::ChallengeLifecycle;
use crate::error::{MatchmakingError, Result};
use crate::hosting::{HostedMatchStatus, HostingApi, ServerProbe};
use crate::metrics::MetricsCollector;
use crate::rating::{RatingCalculator, RatingStorage};
use crate::storage::{MatchStore, Repositories};
use crate::types::{GameMatch, MatchPhase, TeamId};
use crate::utils::{has_elapsed, Clock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default time players get to connect after a match starts
pub const DEFAULT_CONNECTION_GRACE: Duration = Duration::from_secs(240);

/// What one result-reconciliation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub finished: usize,
    pub cancelled: usize,
    /// Provider errors; retried on the next tick
    pub skipped: usize,
}

/// What one connection-timeout pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub checked: usize,
    pub validated: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

/// How a match ended, for metrics and events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    Forfeit,
    Cancelled,
    Unknown,
    ConnectionTimeout,
}

impl Ending {
    fn as_str(self) -> &'static str {
        match self {
            Ending::Completed => "completed",
            Ending::Forfeit => "forfeit",
            Ending::Cancelled => "cancelled",
            Ending::Unknown => "unknown",
            Ending::ConnectionTimeout => "connection_timeout",
        }
    }

    fn is_cancelled(self) -> bool {
        matches!(
            self,
            Ending::Cancelled | Ending::Unknown | Ending::ConnectionTimeout
        )
    }
}

pub struct MatchMonitor {
    matches: Arc<dyn MatchStore>,
    ratings: Arc<dyn RatingStorage>,
    calculator: Arc<dyn RatingCalculator>,
    lifecycle: Arc<ChallengeLifecycle>,
    hosting: Arc<dyn HostingApi>,
    probe: Arc<dyn ServerProbe>,
    clock: Arc<dyn Clock>,
    notifier: Notifier,
    metrics: Arc<MetricsCollector>,
    connection_grace: Duration,
}

impl MatchMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: &Repositories,
        calculator: Arc<dyn RatingCalculator>,
        lifecycle: Arc<ChallengeLifecycle>,
        hosting: Arc<dyn HostingApi>,
        probe: Arc<dyn ServerProbe>,
        clock: Arc<dyn Clock>,
        notifier: Notifier,
        metrics: Arc<MetricsCollector>,
        connection_grace: Duration,
    ) -> Self {
        Self {
            matches: repos.matches.clone(),
            ratings: repos.ratings.clone(),
            calculator,
            lifecycle,
            hosting,
            probe,
            clock,
            notifier,
            metrics,
            connection_grace,
        }
    }

    /// Pull results for every running match from the provider
    pub async fn reconcile_results(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for game_match in self.matches.active()? {
            let Some(external_id) = game_match.external_match_id.clone() else {
                continue;
            };
            report.checked += 1;

            let started = Instant::now();
            let lookup = self.hosting.get_match(&external_id).await;
            self.metrics
                .record_hosting_call("get_match", lookup.is_ok(), started.elapsed());

            let (ending, status) = match lookup {
                Err(e) => {
                    warn!(
                        "Failed to fetch status of match {} ({}): {}",
                        game_match.id, external_id, e
                    );
                    report.skipped += 1;
                    continue;
                }
                Ok(None) => (Ending::Unknown, HostedMatchStatus::default()),
                Ok(Some(status)) if !status.is_over() => continue,
                Ok(Some(status)) => {
                    let ending = if status.cancelled {
                        Ending::Cancelled
                    } else if status.forfeit {
                        Ending::Forfeit
                    } else {
                        Ending::Completed
                    };
                    (ending, status)
                }
            };

            match self.finish(&game_match, ending, &status).await {
                Ok(Some(finished)) => {
                    if ending.is_cancelled() {
                        report.cancelled += 1;
                    } else {
                        report.finished += 1;
                        self.update_ratings(&finished);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to record result of match {}: {}", game_match.id, e);
                    report.skipped += 1;
                }
            }
        }

        if report.checked > 0 {
            debug!("Result reconciliation: {:?}", report);
        }
        Ok(report)
    }

    /// Validate that players joined matches past the grace window
    pub async fn check_connection_timeouts(&self) -> Result<ConnectionReport> {
        let mut report = ConnectionReport::default();
        let now = self.clock.now();

        for game_match in self.matches.active()? {
            if game_match.connection_validated_at.is_some()
                || !has_elapsed(game_match.started_at, now, self.connection_grace)
            {
                continue;
            }
            report.checked += 1;

            let connected = self
                .probe
                .are_all_players_connected(
                    &game_match.server_ip,
                    game_match.server_port,
                    game_match.expected_players,
                )
                .await;

            match connected {
                Err(e) => {
                    warn!(
                        "Failed to probe {}:{} for match {}: {}",
                        game_match.server_ip, game_match.server_port, game_match.id, e
                    );
                    report.skipped += 1;
                }
                Ok(true) => match self.validate_connection(&game_match).await {
                    Ok(true) => report.validated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Failed to validate match {}: {}", game_match.id, e);
                        report.skipped += 1;
                    }
                },
                Ok(false) => {
                    info!(
                        "Players did not connect to match {} within {:?}, cancelling",
                        game_match.id, self.connection_grace
                    );
                    self.cancel_external(&game_match).await;
                    let status = HostedMatchStatus {
                        cancelled: true,
                        ..Default::default()
                    };
                    match self
                        .finish(&game_match, Ending::ConnectionTimeout, &status)
                        .await
                    {
                        Ok(Some(_)) => {
                            self.metrics.record_connection_timeout();
                            report.cancelled += 1;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!("Failed to cancel match {}: {}", game_match.id, e);
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn validate_connection(&self, game_match: &GameMatch) -> Result<bool> {
        let now = self.clock.now();
        let mut first = false;
        self.matches.update(game_match.id, &mut |m| {
            if m.connection_validated_at.is_none() {
                m.connection_validated_at = Some(now);
                first = true;
            }
            Ok(())
        })?;
        if !first {
            return Ok(false);
        }

        info!(
            "All {} players connected to match {}",
            game_match.expected_players, game_match.id
        );
        self.lifecycle.complete(game_match.challenge_id).await?;
        self.notifier
            .match_lifecycle(
                game_match.challenge_id,
                Some(game_match.id),
                MatchPhase::ConnectionValidated,
                None,
            )
            .await;
        Ok(true)
    }

    async fn cancel_external(&self, game_match: &GameMatch) {
        let Some(external_id) = game_match.external_match_id.as_deref() else {
            return;
        };
        let started = Instant::now();
        let result = self.hosting.cancel_match(external_id).await;
        self.metrics
            .record_hosting_call("cancel_match", result.is_ok(), started.elapsed());
        match result {
            Ok(true) => {}
            Ok(false) => warn!("Hosting provider did not cancel match {}", external_id),
            Err(e) => warn!("Failed to cancel hosting match {}: {}", external_id, e),
        }
    }

    /// Close the match locally, complete its challenge and free both teams
    ///
    /// `None` when another poller finished the match first.
    async fn finish(
        &self,
        game_match: &GameMatch,
        ending: Ending,
        status: &HostedMatchStatus,
    ) -> Result<Option<GameMatch>> {
        let winner_team_id = if ending.is_cancelled() {
            None
        } else {
            status.winner.as_deref().and_then(|winner| {
                if winner == game_match.team1_external_id {
                    Some(game_match.team1_id)
                } else if winner == game_match.team2_external_id {
                    Some(game_match.team2_id)
                } else {
                    None
                }
            })
        };
        let ended_at = status.end_time.unwrap_or_else(|| self.clock.now());

        let result = self.matches.update(game_match.id, &mut |m| {
            m.is_finished = true;
            m.is_cancelled = ending.is_cancelled();
            m.ended_at = Some(ended_at);
            m.team1_score = status.team1_score;
            m.team2_score = status.team2_score;
            m.winner_team_id = winner_team_id;
            Ok(())
        });
        let finished = match result {
            Ok(finished) => finished,
            Err(e)
                if matches!(
                    e.downcast_ref::<MatchmakingError>(),
                    Some(MatchmakingError::MatchFinished { .. })
                ) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        self.lifecycle.complete(game_match.challenge_id).await?;
        if let Some(challenge) = self.lifecycle.get(game_match.challenge_id)? {
            self.lifecycle.release_teams(&challenge)?;
        }

        info!(
            "Match {} ended ({}) {}-{}",
            finished.id,
            ending.as_str(),
            finished.team1_score,
            finished.team2_score
        );
        self.metrics.record_match_finished(ending.as_str());
        let phase = if ending.is_cancelled() {
            MatchPhase::Cancelled
        } else {
            MatchPhase::Finished
        };
        self.notifier
            .match_lifecycle(
                finished.challenge_id,
                Some(finished.id),
                phase,
                Some(ending.as_str().to_string()),
            )
            .await;
        Ok(Some(finished))
    }

    /// Move both ratings after a decided result; failures only warn
    fn update_ratings(&self, finished: &GameMatch) {
        let Some(winner) = finished.winner_team_id else {
            return;
        };
        let Some(loser) = finished.opponent_of(winner) else {
            return;
        };
        if let Err(e) = self.apply_result(winner, loser) {
            warn!(
                "Failed to update ratings for match {} (winner {}): {}",
                finished.id, winner, e
            );
        }
    }

    fn apply_result(&self, winner: TeamId, loser: TeamId) -> Result<()> {
        let timer = self.metrics.start_timer();
        let current = |team_id: TeamId| -> Result<_> {
            Ok(self
                .ratings
                .get_rating(team_id)?
                .map(|entry| entry.rating)
                .unwrap_or_else(|| self.calculator.initial_rating()))
        };
        let winner_rating = current(winner)?;
        let loser_rating = current(loser)?;

        let result = self
            .calculator
            .rate_result((winner, &winner_rating), (loser, &loser_rating))?;
        self.ratings.apply_changes(&result.rating_changes)?;
        self.metrics.record_rating_calculation(timer.elapsed());

        for change in &result.rating_changes {
            debug!(
                "Team {} rating {:.1} -> {:.1}",
                change.team_id, change.old_rating.rating, change.new_rating.rating
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::publisher::MockEventPublisher;
    use crate::challenge::DEFAULT_CHALLENGE_TTL;
    use crate::hosting::{FakeHostingBehaviour, InMemoryHostingApi, StaticServerProbe};
    use crate::matches::MatchOrchestrator;
    use crate::rating::{ExtendedWengLinConfig, WengLinRatingCalculator};
    use crate::types::{ChallengeStatus, NewTeam, TeamStatus};
    use crate::utils::ManualClock;

    struct Harness {
        monitor: MatchMonitor,
        orchestrator: MatchOrchestrator,
        lifecycle: Arc<ChallengeLifecycle>,
        repos: Repositories,
        hosting: Arc<InMemoryHostingApi>,
        probe: Arc<StaticServerProbe>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let repos = Repositories::in_memory();
        let clock = Arc::new(ManualClock::default());
        let hosting = Arc::new(InMemoryHostingApi::new());
        let probe = Arc::new(StaticServerProbe::new(10));
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let notifier = Notifier::new(Arc::new(MockEventPublisher::new()), metrics.clone());
        let lifecycle = Arc::new(ChallengeLifecycle::new(
            &repos,
            hosting.clone(),
            clock.clone(),
            notifier.clone(),
            metrics.clone(),
            DEFAULT_CHALLENGE_TTL,
        ));
        let orchestrator = MatchOrchestrator::new(
            &repos,
            lifecycle.clone(),
            hosting.clone(),
            clock.clone(),
            notifier.clone(),
            metrics.clone(),
        );
        let monitor = MatchMonitor::new(
            &repos,
            Arc::new(WengLinRatingCalculator::new(ExtendedWengLinConfig::default()).unwrap()),
            lifecycle.clone(),
            hosting.clone(),
            probe.clone(),
            clock.clone(),
            notifier,
            metrics,
            DEFAULT_CONNECTION_GRACE,
        );
        Harness {
            monitor,
            orchestrator,
            lifecycle,
            repos,
            hosting,
            probe,
            clock,
        }
    }

    async fn running_match(h: &Harness) -> GameMatch {
        let mut ids = Vec::new();
        for leader in [100, 200] {
            let team = h
                .repos
                .teams
                .create(NewTeam {
                    name: None,
                    is_private: false,
                    region: "eu".to_string(),
                    leader_id: leader,
                    member_ids: (leader..leader + 5).collect(),
                    ephemeral: false,
                })
                .unwrap();
            ids.push(team.id);
        }
        let challenge = h
            .lifecycle
            .create_auto_match(ids[0], ids[1], false)
            .await
            .unwrap();
        h.orchestrator.start_match(&challenge, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_finished_match_updates_ratings() {
        let h = harness();
        let game_match = running_match(&h).await;
        let external = game_match.external_match_id.clone().unwrap();

        assert_eq!(h.monitor.reconcile_results().await.unwrap().finished, 0);

        h.hosting.set_match_status(
            &external,
            HostedMatchStatus {
                end_time: Some(h.clock.now()),
                team1_score: 13,
                team2_score: 9,
                winner: Some(game_match.team1_external_id.clone()),
                ..Default::default()
            },
        );
        let report = h.monitor.reconcile_results().await.unwrap();
        assert_eq!(report.finished, 1);

        let finished = h.repos.matches.get(game_match.id).unwrap().unwrap();
        assert!(finished.is_finished);
        assert!(!finished.is_cancelled);
        assert_eq!(finished.winner_team_id, Some(game_match.team1_id));

        let winner = h.repos.ratings.get_rating(game_match.team1_id).unwrap().unwrap();
        let loser = h.repos.ratings.get_rating(game_match.team2_id).unwrap().unwrap();
        assert!(winner.rating.rating > 1500.0);
        assert!(loser.rating.rating < 1500.0);

        let challenge = h.lifecycle.get(game_match.challenge_id).unwrap().unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Completed);
        let team = h.repos.teams.get(game_match.team2_id).unwrap().unwrap();
        assert_eq!(team.status, TeamStatus::Waiting);

        // Nothing left to poll
        assert_eq!(h.monitor.reconcile_results().await.unwrap().checked, 0);
    }

    #[tokio::test]
    async fn test_cancelled_match_leaves_ratings_alone() {
        let h = harness();
        let game_match = running_match(&h).await;
        let external = game_match.external_match_id.clone().unwrap();

        h.hosting.set_match_status(
            &external,
            HostedMatchStatus {
                cancelled: true,
                winner: Some(game_match.team1_external_id.clone()),
                ..Default::default()
            },
        );
        let report = h.monitor.reconcile_results().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(h.repos.ratings.get_team_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_match_is_closed_and_errors_are_skipped() {
        let h = harness();
        let first = running_match(&h).await;

        h.hosting.set_behaviour(FakeHostingBehaviour {
            fail_match_lookup: true,
            ..Default::default()
        });
        let report = h.monitor.reconcile_results().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!h.repos.matches.get(first.id).unwrap().unwrap().is_finished);

        h.hosting.set_behaviour(FakeHostingBehaviour::default());
        h.hosting
            .forget_match(first.external_match_id.as_deref().unwrap());
        let report = h.monitor.reconcile_results().await.unwrap();
        assert_eq!(report.cancelled, 1);
        let closed = h.repos.matches.get(first.id).unwrap().unwrap();
        assert!(closed.is_finished && closed.is_cancelled);
    }

    #[tokio::test]
    async fn test_missing_players_cancel_after_grace() {
        let h = harness();
        let game_match = running_match(&h).await;
        h.probe
            .set_players(&game_match.server_ip, game_match.server_port, 7);

        h.clock.advance(Duration::from_secs(60));
        let report = h.monitor.check_connection_timeouts().await.unwrap();
        assert_eq!(report.checked, 0);

        h.clock.advance(Duration::from_secs(240));
        let report = h.monitor.check_connection_timeouts().await.unwrap();
        assert_eq!(report.cancelled, 1);

        let external = game_match.external_match_id.as_deref().unwrap();
        assert!(h.hosting.is_cancelled(external));
        let closed = h.repos.matches.get(game_match.id).unwrap().unwrap();
        assert!(closed.is_finished && closed.is_cancelled);
        let challenge = h.lifecycle.get(game_match.challenge_id).unwrap().unwrap();
        assert_eq!(challenge.status, ChallengeStatus::Completed);
    }

    #[tokio::test]
    async fn test_connected_players_validate_once() {
        let h = harness();
        let game_match = running_match(&h).await;

        h.clock.advance(DEFAULT_CONNECTION_GRACE);
        let report = h.monitor.check_connection_timeouts().await.unwrap();
        assert_eq!(report.validated, 1);
        assert!(h
            .repos
            .matches
            .get(game_match.id)
            .unwrap()
            .unwrap()
            .connection_validated_at
            .is_some());

        // Validated matches are never probed again
        h.probe.set_default_players(0);
        let report = h.monitor.check_connection_timeouts().await.unwrap();
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn test_probe_error_skips_match() {
        let h = harness();
        let game_match = running_match(&h).await;
        h.probe.set_failing(true);

        h.clock.advance(Duration::from_secs(300));
        let report = h.monitor.check_connection_timeouts().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(!h.repos.matches.get(game_match.id).unwrap().unwrap().is_finished);
    }
}
