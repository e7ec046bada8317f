//! Shared builders for the integration tests
//!
//! `TestEngine` wires a `MatchmakingEngine` to in-memory fakes and keeps
//! handles on each fake so tests can script the outside world.

#![allow(dead_code)]

use scrim_room::amqp::publisher::MockEventPublisher;
use scrim_room::hosting::{InMemoryHostingApi, StaticServerProbe};
use scrim_room::metrics::MetricsCollector;
use scrim_room::queue::InMemoryStore;
use scrim_room::service::{EngineDeps, EngineSettings, MatchmakingEngine};
use scrim_room::types::{ChallengeRequest, PlayerId, Team, MATCH_PLAYERS, TEAM_SIZE};
use scrim_room::utils::ManualClock;
use std::sync::Arc;
use std::time::Duration;

pub struct TestEngine {
    pub engine: MatchmakingEngine,
    pub hosting: Arc<InMemoryHostingApi>,
    pub probe: Arc<StaticServerProbe>,
    pub publisher: Arc<MockEventPublisher>,
    pub clock: Arc<ManualClock>,
    pub backend: Arc<InMemoryStore>,
    pub metrics: Arc<MetricsCollector>,
}

pub struct TestEngineBuilder {
    settings: EngineSettings,
}

impl TestEngineBuilder {
    pub fn new() -> Self {
        let mut settings = EngineSettings::default();
        // Keep lock contention tests quick
        settings.queue.lock_wait = Duration::from_millis(200);
        Self { settings }
    }

    pub fn auto_match_veto(mut self, enabled: bool) -> Self {
        self.settings.formation.auto_match_veto = enabled;
        self
    }

    pub fn form_on_join(mut self, enabled: bool) -> Self {
        self.settings.form_on_join = enabled;
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.settings.queue.lock_wait = wait;
        self
    }

    pub fn build(self) -> TestEngine {
        let metrics = Arc::new(MetricsCollector::new().expect("metrics collector"));
        let hosting = Arc::new(InMemoryHostingApi::new());
        let probe = Arc::new(StaticServerProbe::new(MATCH_PLAYERS));
        let publisher = Arc::new(MockEventPublisher::new());
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(InMemoryStore::new());

        let mut deps = EngineDeps::in_memory(metrics.clone()).expect("engine deps");
        deps.queue_backend = backend.clone();
        deps.hosting = hosting.clone();
        deps.probe = probe.clone();
        deps.publisher = publisher.clone();
        deps.clock = clock.clone();

        TestEngine {
            engine: MatchmakingEngine::new(deps, self.settings),
            hosting,
            probe,
            publisher,
            clock,
            backend,
            metrics,
        }
    }
}

impl Default for TestEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn test_engine() -> TestEngine {
    TestEngineBuilder::new().build()
}

/// Members of a full team led by `leader`, leader excluded
pub fn roster_after(leader: PlayerId) -> Vec<PlayerId> {
    (leader + 1..leader + TEAM_SIZE as u64).collect()
}

impl TestEngine {
    /// A full five-player team led by `leader`
    pub fn full_team(&self, leader: PlayerId, name: &str) -> Team {
        self.engine
            .create_team(leader, Some(name.to_string()), &roster_after(leader), None)
            .expect("team created")
    }

    /// Two full teams with an accepted challenge between them
    pub async fn accepted_challenge(&self) -> (Team, Team, ChallengeRequest) {
        let alpha = self.full_team(1, "Alpha");
        let bravo = self.full_team(11, "Bravo");
        let challenge = self
            .engine
            .challenge(alpha.leader_id, bravo.id, Some("gl hf".to_string()))
            .await
            .expect("challenge created");
        let accepted = self
            .engine
            .accept(bravo.leader_id, challenge.id)
            .await
            .expect("challenge accepted");
        (alpha, bravo, accepted.challenge)
    }

    /// Accepted challenge with both sides ready and the veto open
    pub async fn vetoing_challenge(&self) -> (Team, Team, ChallengeRequest) {
        let (alpha, bravo, challenge) = self.accepted_challenge().await;
        self.engine
            .mark_ready(alpha.leader_id, challenge.id)
            .await
            .expect("alpha ready");
        let ready = self
            .engine
            .mark_ready(bravo.leader_id, challenge.id)
            .await
            .expect("bravo ready");
        assert!(ready.veto.is_some(), "veto should open on second ready-up");
        (alpha, bravo, ready.challenge)
    }

    pub async fn queue_solos(&self, players: impl IntoIterator<Item = PlayerId>) {
        for player in players {
            self.engine.join_queue(player).await.expect("solo joined");
        }
    }

    pub fn routing_keys(&self) -> Vec<String> {
        self.publisher.routing_keys()
    }
}
