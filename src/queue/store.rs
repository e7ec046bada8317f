//! Shared matchmaking queue
//!
//! Every read and write happens while holding a lease on the named queue lock.
//! A lease that cannot be taken within the configured wait turns into a soft
//! failure: joins and leaves report `Unavailable`, snapshots fall back to the
//! last snapshot this process saw.

use crate::config::QueueBackendSettings;
use crate::error::{MatchmakingError, Result};
use crate::metrics::MetricsCollector;
use crate::queue::backend::{InMemoryStore, KeyValueStore};
use crate::types::{PlayerId, QueueCount, QueueGroup, TeamId, TEAM_SIZE};
use crate::utils::{generate_lock_token, Clock, SystemClock};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Queue store configuration
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub key: String,
    pub lock_name: String,
    pub lock_ttl: Duration,
    /// How long callers wait for the lock before giving up
    pub lock_wait: Duration,
    pub entry_ttl: Duration,
    pub retry_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            key: "scrim:queue".to_string(),
            lock_name: "scrim:queue:lock".to_string(),
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(5),
            entry_ttl: Duration::from_secs(3600),
            retry_interval: Duration::from_millis(25),
        }
    }
}

impl From<&QueueBackendSettings> for QueueSettings {
    fn from(settings: &QueueBackendSettings) -> Self {
        Self {
            key: settings.queue_key.clone(),
            lock_name: settings.lock_name.clone(),
            lock_ttl: Duration::from_secs(settings.lock_ttl_seconds),
            lock_wait: Duration::from_millis(settings.lock_wait_ms),
            entry_ttl: Duration::from_secs(settings.queue_ttl_seconds),
            ..Self::default()
        }
    }
}

/// Result of a join attempt
#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Joined(QueueGroup),
    /// The caller, or one of the team's members, was already queued
    AlreadyQueued(QueueGroup),
    /// The queue lock could not be acquired in time
    Unavailable,
}

impl JoinOutcome {
    pub fn is_queued(&self) -> bool {
        !matches!(self, JoinOutcome::Unavailable)
    }

    pub fn group(&self) -> Option<&QueueGroup> {
        match self {
            JoinOutcome::Joined(group) | JoinOutcome::AlreadyQueued(group) => Some(group),
            JoinOutcome::Unavailable => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            JoinOutcome::Joined(_) => "joined",
            JoinOutcome::AlreadyQueued(_) => "already_queued",
            JoinOutcome::Unavailable => "unavailable",
        }
    }
}

/// Result of a leave attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Removed,
    NotQueued,
    Unavailable,
}

impl LeaveOutcome {
    fn label(self) -> &'static str {
        match self {
            LeaveOutcome::Removed => "removed",
            LeaveOutcome::NotQueued => "not_queued",
            LeaveOutcome::Unavailable => "unavailable",
        }
    }
}

/// A held instance of the queue lock
struct Lease {
    backend: Arc<dyn KeyValueStore>,
    name: String,
    token: String,
    released: bool,
}

impl Lease {
    async fn release(&mut self) {
        self.released = true;
        match self.backend.unlock(&self.name, &self.token).await {
            Ok(true) => {}
            Ok(false) => warn!("Queue lease {} expired before release", self.token),
            Err(e) => warn!("Failed to release queue lease {}: {}", self.token, e),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped mid-operation (e.g. a cancelled future); the TTL covers us
        // if no runtime is around to release it.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let name = std::mem::take(&mut self.name);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                let _ = backend.unlock(&name, &token).await;
            });
        }
    }
}

/// The shared queue of solo players and teams
pub struct QueueStore {
    backend: Arc<dyn KeyValueStore>,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    last_known: RwLock<Vec<QueueGroup>>,
    metrics: Arc<MetricsCollector>,
}

impl QueueStore {
    pub fn new(
        backend: Arc<dyn KeyValueStore>,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            backend,
            settings,
            clock,
            last_known: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Queue over a fresh in-memory backend with default settings
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryStore::new()),
            QueueSettings::default(),
            Arc::new(SystemClock),
            Arc::new(MetricsCollector::default()),
        )
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn backend(&self) -> Arc<dyn KeyValueStore> {
        self.backend.clone()
    }

    /// Add a solo player stamped with the current time
    pub async fn join_solo(&self, player_id: PlayerId) -> Result<JoinOutcome> {
        self.join(QueueGroup::solo(player_id, self.clock.now()))
            .await
    }

    /// Add an intact team stamped with the current time
    pub async fn join_team(&self, team_id: TeamId, member_ids: Vec<PlayerId>) -> Result<JoinOutcome> {
        self.join(QueueGroup::team(team_id, member_ids, self.clock.now()))
            .await
    }

    /// Add a group; idempotent for anyone already queued
    pub async fn join(&self, group: QueueGroup) -> Result<JoinOutcome> {
        let group = normalize(group)?;

        let Some(mut lease) = self.acquire("join").await else {
            self.metrics
                .record_queue_operation("join", JoinOutcome::Unavailable.label());
            return Ok(JoinOutcome::Unavailable);
        };
        let result = self.join_locked(group).await;
        lease.release().await;

        let outcome = result?;
        self.metrics.record_queue_operation("join", outcome.label());
        Ok(outcome)
    }

    async fn join_locked(&self, group: QueueGroup) -> Result<JoinOutcome> {
        let mut groups = self.read().await?;

        let existing = groups.iter().find(|queued| {
            group.members().iter().any(|id| queued.contains(*id))
                || (group.team_id().is_some() && queued.team_id() == group.team_id())
        });
        if let Some(existing) = existing {
            debug!("Join is a no-op, already queued as {:?}", existing);
            return Ok(JoinOutcome::AlreadyQueued(existing.clone()));
        }

        groups.push(group.clone());
        self.write(&groups).await?;
        self.remember(groups);

        info!(
            "Queued {} player(s) (team: {:?})",
            group.size(),
            group.team_id()
        );
        Ok(JoinOutcome::Joined(group))
    }

    /// Remove one player, from a solo entry or from their team's entry
    pub async fn leave(&self, player_id: PlayerId) -> Result<LeaveOutcome> {
        self.remove_where("leave", |groups| strip_player(groups, player_id))
            .await
    }

    /// Remove a team's entry entirely
    pub async fn leave_team(&self, team_id: TeamId) -> Result<LeaveOutcome> {
        self.remove_where("leave_team", |groups| {
            let before = groups.len();
            groups.retain(|group| group.team_id() != Some(team_id));
            before != groups.len()
        })
        .await
    }

    async fn remove_where<F>(&self, operation: &str, remove: F) -> Result<LeaveOutcome>
    where
        F: FnOnce(&mut Vec<QueueGroup>) -> bool,
    {
        let Some(mut lease) = self.acquire(operation).await else {
            self.metrics
                .record_queue_operation(operation, LeaveOutcome::Unavailable.label());
            return Ok(LeaveOutcome::Unavailable);
        };

        let result: Result<LeaveOutcome> = async {
            let mut groups = self.read().await?;
            if !remove(&mut groups) {
                return Ok(LeaveOutcome::NotQueued);
            }
            self.write(&groups).await?;
            self.remember(groups);
            Ok(LeaveOutcome::Removed)
        }
        .await;
        lease.release().await;

        let outcome = result?;
        self.metrics.record_queue_operation(operation, outcome.label());
        Ok(outcome)
    }

    /// Queued groups in join order, or the last known snapshot if the queue
    /// cannot be read right now
    pub async fn snapshot(&self) -> Vec<QueueGroup> {
        let Some(mut lease) = self.acquire("snapshot").await else {
            return self.last_known();
        };
        let result = self.read().await;
        lease.release().await;

        match result {
            Ok(groups) => {
                self.remember(groups.clone());
                groups
            }
            Err(e) => {
                warn!("Queue read failed, serving last known snapshot: {}", e);
                self.last_known()
            }
        }
    }

    pub async fn count(&self) -> QueueCount {
        QueueCount::from_groups(&self.snapshot().await)
    }

    pub async fn is_queued(&self, player_id: PlayerId) -> bool {
        self.snapshot()
            .await
            .iter()
            .any(|group| group.contains(player_id))
    }

    /// Last snapshot this process read or wrote
    pub fn last_known(&self) -> Vec<QueueGroup> {
        self.last_known
            .read()
            .map(|groups| groups.clone())
            .unwrap_or_default()
    }

    /// Open a read-check-write transaction, or `None` if the lock is busy
    pub async fn begin(&self) -> Result<Option<QueueTransaction<'_>>> {
        let Some(mut lease) = self.acquire("formation").await else {
            return Ok(None);
        };
        match self.read().await {
            Ok(groups) => Ok(Some(QueueTransaction {
                store: self,
                lease,
                groups,
                dirty: false,
            })),
            Err(e) => {
                lease.release().await;
                Err(e)
            }
        }
    }

    async fn acquire(&self, operation: &str) -> Option<Lease> {
        let token = generate_lock_token();
        let deadline = Instant::now() + self.settings.lock_wait;

        loop {
            match self
                .backend
                .try_lock(&self.settings.lock_name, &token, self.settings.lock_ttl)
                .await
            {
                Ok(true) => {
                    return Some(Lease {
                        backend: self.backend.clone(),
                        name: self.settings.lock_name.clone(),
                        token,
                        released: false,
                    })
                }
                Ok(false) => {}
                Err(e) => warn!("Queue lock attempt failed for {}: {}", operation, e),
            }

            if Instant::now() >= deadline {
                warn!(
                    "Queue lock not acquired within {:?} for {}",
                    self.settings.lock_wait, operation
                );
                self.metrics.record_lock_contention(operation);
                return None;
            }
            sleep(self.settings.retry_interval).await;
        }
    }

    async fn read(&self) -> Result<Vec<QueueGroup>> {
        match self.backend.get(&self.settings.key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                MatchmakingError::InternalError {
                    message: format!("Corrupt queue state: {}", e),
                }
                .into()
            }),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&self, groups: &[QueueGroup]) -> Result<()> {
        let raw = serde_json::to_string(groups)?;
        self.backend
            .put(&self.settings.key, raw, self.settings.entry_ttl)
            .await
    }

    fn remember(&self, groups: Vec<QueueGroup>) {
        self.metrics
            .update_queue_counts(QueueCount::from_groups(&groups));
        if let Ok(mut last_known) = self.last_known.write() {
            *last_known = groups;
        }
    }
}

/// Queue contents held under the lock until committed or aborted
pub struct QueueTransaction<'a> {
    store: &'a QueueStore,
    lease: Lease,
    groups: Vec<QueueGroup>,
    dirty: bool,
}

impl QueueTransaction<'_> {
    pub fn groups(&self) -> &[QueueGroup] {
        &self.groups
    }

    pub fn total_players(&self) -> usize {
        self.groups.iter().map(QueueGroup::size).sum()
    }

    /// Strip the given players from every group, dropping emptied groups
    pub fn remove_players(&mut self, player_ids: &[PlayerId]) -> usize {
        let before = self.total_players();
        for player_id in player_ids {
            strip_player(&mut self.groups, *player_id);
        }
        let removed = before - self.total_players();
        self.dirty |= removed > 0;
        removed
    }

    /// Write back any changes and release the lock
    pub async fn commit(mut self) -> Result<()> {
        let result = if self.dirty {
            self.store.write(&self.groups).await
        } else {
            Ok(())
        };
        self.lease.release().await;
        result?;
        self.store.remember(self.groups);
        Ok(())
    }

    /// Release the lock leaving the queue untouched
    pub async fn abort(mut self) {
        self.lease.release().await;
    }
}

fn normalize(group: QueueGroup) -> Result<QueueGroup> {
    match group {
        QueueGroup::Solo { .. } => Ok(group),
        QueueGroup::Team {
            team_id,
            member_ids,
            joined_at,
        } => {
            let mut unique = Vec::with_capacity(member_ids.len());
            for id in member_ids {
                if !unique.contains(&id) {
                    unique.push(id);
                }
            }
            if unique.is_empty() || unique.len() > TEAM_SIZE {
                return Err(MatchmakingError::InvalidQueueRequest {
                    reason: format!(
                        "team {} must queue with 1 to {} players, got {}",
                        team_id,
                        TEAM_SIZE,
                        unique.len()
                    ),
                }
                .into());
            }
            Ok(QueueGroup::team(team_id, unique, joined_at))
        }
    }
}

/// Remove a player from whichever group holds them; true if found
fn strip_player(groups: &mut Vec<QueueGroup>, player_id: PlayerId) -> bool {
    let Some(index) = groups.iter().position(|group| group.contains(player_id)) else {
        return false;
    };
    let emptied = match &mut groups[index] {
        QueueGroup::Solo { .. } => true,
        QueueGroup::Team { member_ids, .. } => {
            member_ids.retain(|id| *id != player_id);
            member_ids.is_empty()
        }
    };
    if emptied {
        groups.remove(index);
    }
    true
}
