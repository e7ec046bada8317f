//! End-to-end flows through the matchmaking engine against in-memory fakes

mod fixtures;

use fixtures::{test_engine, TestEngineBuilder};
use scrim_room::error::{error_kind, ErrorKind, MatchmakingError};
use scrim_room::formation::{HandOff, PairingKind};
use scrim_room::hosting::{FakeHostingBehaviour, HostedMatchStatus};
use scrim_room::queue::JoinOutcome;
use scrim_room::service::BanResult;
use scrim_room::types::{ChallengeStatus, TeamStatus};
use scrim_room::veto::VetoState;
use scrim_room::StartMatchError;
use std::time::Duration;

#[tokio::test]
async fn test_team_against_first_five_solos() {
    let t = TestEngineBuilder::new().form_on_join(false).build();
    let alpha = t.full_team(1, "Alpha");
    t.engine.join_queue_as_team(1).await.unwrap();
    t.queue_solos(10..=16).await;

    let report = t.engine.form_matches().await.unwrap();
    assert_eq!(report.formed.len(), 1);
    let formed = &report.formed[0];
    assert_eq!(formed.kind, PairingKind::TeamVsSolos);
    assert!(matches!(formed.hand_off, HandOff::Started(_)));

    let remaining: Vec<u64> = t
        .engine
        .queue_snapshot()
        .await
        .iter()
        .flat_map(|group| group.members().to_vec())
        .collect();
    assert_eq!(remaining, vec![15, 16]);

    let teams = &t.engine.repos().teams;
    let home = teams
        .get(formed.challenge.challenger_team_id)
        .unwrap()
        .unwrap();
    let away = teams
        .get(formed.challenge.challenged_team_id)
        .unwrap()
        .unwrap();
    assert!(home.ephemeral && away.ephemeral);
    assert_eq!(home.name, alpha.name);
    assert_eq!(home.member_ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(away.member_ids, vec![10, 11, 12, 13, 14]);
    assert_eq!(away.leader_id, 10);

    // The persistent roster is untouched by the single-use copy
    assert_eq!(t.engine.team_of(1).unwrap().unwrap().id, alpha.id);
}

#[tokio::test]
async fn test_rejoin_is_idempotent() {
    let t = test_engine();
    t.engine.join_queue(7).await.unwrap();
    let again = t.engine.join_queue(7).await.unwrap();

    assert!(matches!(again.outcome, JoinOutcome::AlreadyQueued(_)));
    assert!(again.formation.is_none());
    assert_eq!(t.engine.queue_count().await.players, 1);
}

#[tokio::test]
async fn test_partial_team_waits_for_solos() {
    let t = test_engine();
    t.engine
        .create_team(1, None, &[2, 3], None)
        .unwrap();
    t.engine.join_queue_as_team(1).await.unwrap();
    t.queue_solos(20..27).await;

    // Three plus seven is ten players but no legal pairing
    let count = t.engine.queue_count().await;
    assert_eq!(count.players, 10);
    assert!(t.hosting.created_matches().is_empty());
}

#[tokio::test]
async fn test_accept_declines_other_pending_challenges() {
    let t = test_engine();
    let alpha = t.full_team(1, "Alpha");
    let bravo = t.full_team(11, "Bravo");
    let charlie = t.full_team(21, "Charlie");

    let from_alpha = t.engine.challenge(1, bravo.id, None).await.unwrap();
    let from_charlie = t.engine.challenge(21, bravo.id, None).await.unwrap();

    let outcome = t.engine.accept(11, from_alpha.id).await.unwrap();
    assert_eq!(outcome.superseded, vec![from_charlie.id]);

    let declined = t.engine.lifecycle().get(from_charlie.id).unwrap().unwrap();
    assert_eq!(declined.status, ChallengeStatus::Declined);

    // Bravo cannot be pulled into a second accepted challenge
    let err = t.engine.challenge(21, bravo.id, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::AlreadyInAcceptedChallenge { .. })
    ));
    assert!(t
        .engine
        .challenges_for(alpha.id)
        .unwrap()
        .iter()
        .all(|c| c.id == from_alpha.id));
    assert!(t.engine.challenges_for(charlie.id).unwrap().is_empty());
}

#[tokio::test]
async fn test_ready_up_opens_veto_and_closes_side_challenges() {
    let t = test_engine();
    let alpha = t.full_team(1, "Alpha");
    let bravo = t.full_team(11, "Bravo");
    t.full_team(21, "Charlie");

    // Alpha is challenged by Charlie, then challenges Bravo itself
    let side = t.engine.challenge(21, alpha.id, None).await.unwrap();
    let main = t.engine.challenge(1, bravo.id, None).await.unwrap();
    t.engine.accept(11, main.id).await.unwrap();

    let first = t.engine.mark_ready(1, main.id).await.unwrap();
    assert_eq!(first.cancelled, vec![side.id]);
    assert!(first.veto.is_none());

    let second = t.engine.mark_ready(11, main.id).await.unwrap();
    let veto = second.veto.expect("veto opens once both sides are ready");
    assert_eq!(veto.state, VetoState::InProgress);
    assert_eq!(veto.current_team_id, Some(alpha.id));
    assert!(second.challenge.veto_started_at.is_some());

    // The side-effect-cancelled challenge rejects further actions
    let err = t.engine.accept(1, side.id).await.unwrap_err();
    assert_eq!(error_kind(&err), ErrorKind::Validation);
    let err = t.engine.mark_ready(21, side.id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::InvalidChallengeState { .. })
    ));
}

#[tokio::test]
async fn test_expired_challenge_reads_as_not_found() {
    let t = test_engine();
    t.full_team(1, "Alpha");
    let bravo = t.full_team(11, "Bravo");
    let challenge = t.engine.challenge(1, bravo.id, None).await.unwrap();

    t.clock.advance(Duration::from_secs(301));
    let err = t.engine.accept(11, challenge.id).await.unwrap_err();
    assert_eq!(error_kind(&err), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_veto_bans_alternate_and_start_the_match() {
    let t = test_engine();
    let (alpha, bravo, challenge) = t.vetoing_challenge().await;
    let maps = t.engine.draft().pool().maps().to_vec();

    let err = t.engine.ban(11, challenge.id, &maps[0]).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::NotYourTurn { .. })
    ));

    t.engine.ban(1, challenge.id, &maps[0]).await.unwrap();
    let err = t.engine.ban(11, challenge.id, &maps[0]).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::MapAlreadyBanned { .. })
    ));
    let err = t.engine.ban(11, challenge.id, "de_cache").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::InvalidMap { .. })
    ));

    let mut result = None;
    for (ordinal, map) in maps.iter().enumerate().take(maps.len() - 1).skip(1) {
        let leader = if ordinal % 2 == 0 { 1 } else { 11 };
        result = Some(t.engine.ban(leader, challenge.id, map).await.unwrap());
    }

    let Some(BanResult::MatchStarted {
        final_map,
        game_match,
    }) = result
    else {
        panic!("last ban should start the match");
    };
    assert_eq!(&final_map, maps.last().unwrap());
    assert_eq!(game_match.map.as_deref(), Some(final_map.as_str()));
    assert_eq!(game_match.expected_players, 10);

    let stored = t.engine.lifecycle().get(challenge.id).unwrap().unwrap();
    assert_eq!(stored.status, ChallengeStatus::Started);
    assert_eq!(stored.final_map.as_deref(), Some(final_map.as_str()));
    for team_id in [alpha.id, bravo.id] {
        let team = t.engine.repos().teams.get(team_id).unwrap().unwrap();
        assert_eq!(team.status, TeamStatus::InMatch);
    }

    let rcon: Vec<String> = t
        .hosting
        .rcon_commands()
        .into_iter()
        .map(|(_, command)| command)
        .collect();
    assert!(rcon.iter().any(|c| c.starts_with("sv_password")));
    assert!(rcon.contains(&format!("changelevel {}", final_map)));
    assert!(t.routing_keys().contains(&"match.started".to_string()));
}

#[tokio::test]
async fn test_stalled_turn_can_be_taken_by_the_other_leader() {
    let t = test_engine();
    let (alpha, _, challenge) = t.vetoing_challenge().await;
    let maps = t.engine.draft().pool().maps().to_vec();

    t.clock.advance(Duration::from_secs(121));
    let BanResult::Banned(status) = t.engine.ban(11, challenge.id, &maps[2]).await.unwrap()
    else {
        panic!("ban should be accepted");
    };

    // Attributed to the stalled challenger, not to the banning leader's team
    assert_eq!(status.bans[0].banning_team_id, alpha.id);
    assert_eq!(status.bans[0].ordinal, 0);
    assert!(!status.turn_expired);
}

#[tokio::test]
async fn test_overall_veto_timeout_cancels_and_purges() {
    let t = test_engine();
    let (_, _, challenge) = t.vetoing_challenge().await;
    let maps = t.engine.draft().pool().maps().to_vec();
    t.engine.ban(1, challenge.id, &maps[0]).await.unwrap();

    t.clock.advance(Duration::from_secs(601));
    let result = t.engine.ban(11, challenge.id, &maps[1]).await.unwrap();
    assert!(matches!(result, BanResult::TimedOut));

    let stored = t.engine.lifecycle().get(challenge.id).unwrap().unwrap();
    assert_eq!(stored.status, ChallengeStatus::Cancelled);
    assert!(t.engine.repos().vetoes.entries(challenge.id).unwrap().is_empty());

    let state = t.engine.veto_state(challenge.id).await.unwrap();
    assert_eq!(state.state, VetoState::TimedOut);
    assert!(t.routing_keys().contains(&"veto.timed_out".to_string()));
}

#[tokio::test]
async fn test_sweep_times_out_abandoned_vetoes() {
    let t = test_engine();
    let (_, _, challenge) = t.vetoing_challenge().await;

    assert!(t.engine.sweep_veto_timeouts().await.unwrap().is_empty());
    t.clock.advance(Duration::from_secs(11 * 60));
    assert_eq!(
        t.engine.sweep_veto_timeouts().await.unwrap(),
        vec![challenge.id]
    );
    assert!(t.engine.sweep_veto_timeouts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_match_id_leaves_no_match_row() {
    let t = test_engine();
    t.hosting.set_behaviour(FakeHostingBehaviour {
        omit_match_id: true,
        ..FakeHostingBehaviour::default()
    });
    let (alpha, bravo, challenge) = t.vetoing_challenge().await;
    let maps = t.engine.draft().pool().maps().to_vec();

    let mut last = None;
    for (ordinal, map) in maps.iter().take(maps.len() - 1).enumerate() {
        let leader = if ordinal % 2 == 0 { 1 } else { 11 };
        last = Some(t.engine.ban(leader, challenge.id, map).await.unwrap());
    }

    let Some(BanResult::StartFailed { error, .. }) = last else {
        panic!("match start should fail");
    };
    assert_eq!(error, StartMatchError::MissingMatchId);
    assert_eq!(error.status_code(), 502);
    assert!(t
        .engine
        .repos()
        .matches
        .for_challenge(challenge.id)
        .unwrap()
        .is_none());

    // External rosters were cleaned up
    assert_eq!(t.hosting.deleted_teams().len(), 2);
    for team_id in [alpha.id, bravo.id] {
        let team = t.engine.repos().teams.get(team_id).unwrap().unwrap();
        assert!(team.external_id.is_none());
        assert_eq!(team.status, TeamStatus::Waiting);
    }
    assert!(t.routing_keys().contains(&"match.start_failed".to_string()));
}

#[tokio::test]
async fn test_no_show_match_is_cancelled_after_grace() {
    let t = test_engine();
    t.queue_solos(1..=10).await;
    let (external_id, _) = t.hosting.created_matches().remove(0);
    t.probe.set_default_players(7);

    // Inside the grace window nothing is probed
    let early = t.engine.check_connection_timeouts().await.unwrap();
    assert_eq!(early.cancelled, 0);

    t.clock.advance(Duration::from_secs(5 * 60));
    let report = t.engine.check_connection_timeouts().await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert!(t.hosting.is_cancelled(&external_id));

    let game_match = t.engine.repos().matches.active().unwrap();
    assert!(game_match.is_empty());
    let challenges = t.engine.repos().challenges.list().unwrap();
    assert_eq!(challenges.len(), 1);
    assert_eq!(challenges[0].status, ChallengeStatus::Completed);
}

#[tokio::test]
async fn test_connected_match_is_validated_once() {
    let t = test_engine();
    t.queue_solos(1..=10).await;

    t.clock.advance(Duration::from_secs(5 * 60));
    let report = t.engine.check_connection_timeouts().await.unwrap();
    assert_eq!(report.validated, 1);

    t.probe.set_default_players(0);
    t.clock.advance(Duration::from_secs(5 * 60));
    let again = t.engine.check_connection_timeouts().await.unwrap();
    assert_eq!(again.checked, 0);
    assert_eq!(again.cancelled, 0);
}

#[tokio::test]
async fn test_finished_match_moves_ratings() {
    let t = test_engine();
    let (alpha, bravo, challenge) = t.vetoing_challenge().await;
    let maps = t.engine.draft().pool().maps().to_vec();
    let mut game_match = None;
    for (ordinal, map) in maps.iter().take(maps.len() - 1).enumerate() {
        let leader = if ordinal % 2 == 0 { 1 } else { 11 };
        if let BanResult::MatchStarted { game_match: m, .. } =
            t.engine.ban(leader, challenge.id, map).await.unwrap()
        {
            game_match = Some(m);
        }
    }
    let game_match = game_match.expect("match started");

    t.hosting.set_match_status(
        game_match.external_match_id.as_deref().unwrap(),
        HostedMatchStatus {
            end_time: Some(chrono::Utc::now()),
            team1_score: 16,
            team2_score: 8,
            winner: Some(game_match.team1_external_id.clone()),
            ..HostedMatchStatus::default()
        },
    );
    let report = t.engine.reconcile_results().await.unwrap();
    assert_eq!(report.finished, 1);
    assert_eq!(report.cancelled, 0);

    let ratings = &t.engine.repos().ratings;
    let winner = ratings.get_rating(alpha.id).unwrap().unwrap();
    let loser = ratings.get_rating(bravo.id).unwrap().unwrap();
    assert!(winner.rating.rating > loser.rating.rating);

    let stored = t.engine.lifecycle().get(challenge.id).unwrap().unwrap();
    assert_eq!(stored.status, ChallengeStatus::Completed);
    let team = t.engine.repos().teams.get(alpha.id).unwrap().unwrap();
    assert_eq!(team.status, TeamStatus::Waiting);

    // A second pass has nothing left to reconcile
    assert_eq!(t.engine.reconcile_results().await.unwrap().checked, 0);
}

#[tokio::test]
async fn test_leaving_mid_veto_purges_bans() {
    let t = test_engine();
    let (_, _, challenge) = t.vetoing_challenge().await;
    let maps = t.engine.draft().pool().maps().to_vec();
    t.engine.ban(1, challenge.id, &maps[0]).await.unwrap();

    let left = t.engine.leave_challenge(11, challenge.id).await.unwrap();
    assert_eq!(left.status, ChallengeStatus::Cancelled);
    assert!(t.engine.repos().vetoes.entries(challenge.id).unwrap().is_empty());

    let err = t.engine.ban(11, challenge.id, &maps[1]).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::VetoNotActive { .. })
    ));
}

#[tokio::test]
async fn test_auto_match_veto_defers_start() {
    let t = TestEngineBuilder::new().auto_match_veto(true).build();
    t.queue_solos(1..=10).await;

    assert!(t.hosting.created_matches().is_empty());
    let challenges = t.engine.repos().challenges.list().unwrap();
    assert_eq!(challenges.len(), 1);
    let state = t.engine.veto_state(challenges[0].id).await.unwrap();
    assert_eq!(state.state, VetoState::InProgress);
    assert_eq!(state.bans.len(), 0);
}

#[tokio::test]
async fn test_leadership_transfer_moves_challenge_rights() {
    let t = test_engine();
    let alpha = t.full_team(1, "Alpha");
    let bravo = t.full_team(11, "Bravo");

    t.engine.transfer_leadership(1, alpha.id, 3).unwrap();
    let err = t.engine.challenge(1, bravo.id, None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchmakingError>(),
        Some(MatchmakingError::NotLeader { .. })
    ));
    assert!(t.engine.challenge(3, bravo.id, None).await.is_ok());
}
