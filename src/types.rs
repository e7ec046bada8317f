//! Common types used throughout the matchmaking service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skillratings::weng_lin::WengLinRating;

/// SteamID64 of a player
pub type PlayerId = u64;

/// Unique identifier for teams
pub type TeamId = u64;

/// Unique identifier for challenges
pub type ChallengeId = u64;

/// Unique identifier for locally recorded matches
pub type MatchId = u64;

/// Number of players on each side of a match
pub const TEAM_SIZE: usize = 5;

/// Number of players needed to form a match
pub const MATCH_PLAYERS: usize = TEAM_SIZE * 2;

/// A solo player or an intact team waiting in the matchmaking queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueGroup {
    Solo {
        player_id: PlayerId,
        joined_at: DateTime<Utc>,
    },
    Team {
        team_id: TeamId,
        member_ids: Vec<PlayerId>,
        joined_at: DateTime<Utc>,
    },
}

impl QueueGroup {
    pub fn solo(player_id: PlayerId, joined_at: DateTime<Utc>) -> Self {
        QueueGroup::Solo {
            player_id,
            joined_at,
        }
    }

    pub fn team(team_id: TeamId, member_ids: Vec<PlayerId>, joined_at: DateTime<Utc>) -> Self {
        QueueGroup::Team {
            team_id,
            member_ids,
            joined_at,
        }
    }

    /// Players represented by this group, in roster order
    pub fn members(&self) -> &[PlayerId] {
        match self {
            QueueGroup::Solo { player_id, .. } => std::slice::from_ref(player_id),
            QueueGroup::Team { member_ids, .. } => member_ids,
        }
    }

    pub fn size(&self) -> usize {
        self.members().len()
    }

    pub fn contains(&self, player_id: PlayerId) -> bool {
        self.members().contains(&player_id)
    }

    pub fn team_id(&self) -> Option<TeamId> {
        match self {
            QueueGroup::Solo { .. } => None,
            QueueGroup::Team { team_id, .. } => Some(*team_id),
        }
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        match self {
            QueueGroup::Solo { joined_at, .. } | QueueGroup::Team { joined_at, .. } => *joined_at,
        }
    }

    pub fn is_solo(&self) -> bool {
        matches!(self, QueueGroup::Solo { .. })
    }

    /// A team group holding exactly one side's worth of players
    pub fn is_full_team(&self) -> bool {
        matches!(self, QueueGroup::Team { member_ids, .. } if member_ids.len() == TEAM_SIZE)
    }
}

/// Aggregate counts over a queue snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCount {
    pub players: usize,
    pub teams: usize,
    pub solos: usize,
}

impl QueueCount {
    pub fn from_groups(groups: &[QueueGroup]) -> Self {
        groups.iter().fold(Self::default(), |mut count, group| {
            count.players += group.size();
            if group.is_solo() {
                count.solos += 1;
            } else {
                count.teams += 1;
            }
            count
        })
    }
}

/// Lifecycle status of a team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeamStatus {
    Waiting,
    InMatch,
}

/// Persistent roster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: Option<String>,
    pub is_private: bool,
    pub region: String,
    pub leader_id: PlayerId,
    pub member_ids: Vec<PlayerId>,
    pub max_size: usize,
    pub status: TeamStatus,
    /// The hosting provider's id for this roster, while one is allocated
    pub external_id: Option<String>,
    /// Materialised by the scheduler for a single auto-formed match
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
}

impl Team {
    pub fn is_member(&self, player_id: PlayerId) -> bool {
        self.member_ids.contains(&player_id)
    }

    pub fn is_leader(&self, player_id: PlayerId) -> bool {
        self.leader_id == player_id
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Team {}", self.id))
    }
}

/// Fields needed to create a team; the store assigns the id
#[derive(Debug, Clone)]
pub struct NewTeam {
    pub name: Option<String>,
    pub is_private: bool,
    pub region: String,
    pub leader_id: PlayerId,
    pub member_ids: Vec<PlayerId>,
    pub ephemeral: bool,
}

impl NewTeam {
    /// A private single-use team; the first member leads it
    pub fn ephemeral(member_ids: Vec<PlayerId>, name: Option<String>, region: &str) -> Self {
        Self {
            name,
            is_private: true,
            region: region.to_string(),
            leader_id: member_ids.first().copied().unwrap_or_default(),
            member_ids,
            ephemeral: true,
        }
    }
}

/// Status of a challenge between two teams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Accepted,
    Declined,
    Started,
    Cancelled,
    Completed,
}

impl ChallengeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChallengeStatus::Declined | ChallengeStatus::Cancelled | ChallengeStatus::Completed
        )
    }

    /// Transition table for challenge status changes
    pub fn can_transition_to(self, next: ChallengeStatus) -> bool {
        use ChallengeStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Declined)
                | (Pending, Cancelled)
                | (Accepted, Started)
                | (Accepted, Cancelled)
                | (Started, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Accepted => "accepted",
            ChallengeStatus::Declined => "declined",
            ChallengeStatus::Started => "started",
            ChallengeStatus::Cancelled => "cancelled",
            ChallengeStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a challenge a team is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Challenger,
    Challenged,
}

impl TeamRole {
    pub fn opposite(self) -> Self {
        match self {
            TeamRole::Challenger => TeamRole::Challenged,
            TeamRole::Challenged => TeamRole::Challenger,
        }
    }
}

impl std::fmt::Display for TeamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeamRole::Challenger => write!(f, "challenger"),
            TeamRole::Challenged => write!(f, "challenged"),
        }
    }
}

/// A proposed or confirmed 5v5 session between two teams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub id: ChallengeId,
    pub challenger_team_id: TeamId,
    pub challenged_team_id: TeamId,
    pub status: ChallengeStatus,
    pub challenger_ready: bool,
    pub challenged_ready: bool,
    pub message: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub veto_started_at: Option<DateTime<Utc>>,
    pub match_started_at: Option<DateTime<Utc>>,
    pub match_id: Option<MatchId>,
    pub final_map: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ChallengeRequest {
    pub fn is_participant(&self, team_id: TeamId) -> bool {
        self.role_of(team_id).is_some()
    }

    pub fn role_of(&self, team_id: TeamId) -> Option<TeamRole> {
        if team_id == self.challenger_team_id {
            Some(TeamRole::Challenger)
        } else if team_id == self.challenged_team_id {
            Some(TeamRole::Challenged)
        } else {
            None
        }
    }

    pub fn team_for(&self, role: TeamRole) -> TeamId {
        match role {
            TeamRole::Challenger => self.challenger_team_id,
            TeamRole::Challenged => self.challenged_team_id,
        }
    }

    pub fn is_ready(&self, role: TeamRole) -> bool {
        match role {
            TeamRole::Challenger => self.challenger_ready,
            TeamRole::Challenged => self.challenged_ready,
        }
    }

    pub fn set_ready(&mut self, role: TeamRole) {
        match role {
            TeamRole::Challenger => self.challenger_ready = true,
            TeamRole::Challenged => self.challenged_ready = true,
        }
    }

    pub fn both_ready(&self) -> bool {
        self.challenger_ready && self.challenged_ready
    }

    /// Pending challenges are only expired when read; nothing sweeps them
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ChallengeStatus::Pending && now >= self.expires_at
    }

    /// Not terminal and, if pending, not past its expiry
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && !self.is_expired(now)
    }

    /// Apply a status change, rejecting anything outside the transition table
    pub fn transition(&mut self, next: ChallengeStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::MatchmakingError::InvalidTransition {
                from: self.status,
                to: next,
            }
            .into());
        }
        self.status = next;
        Ok(())
    }
}

/// One ban in a map veto
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapVetoEntry {
    pub challenge_id: ChallengeId,
    pub map_name: String,
    pub banning_team_id: TeamId,
    pub ordinal: usize,
    pub banned_at: DateTime<Utc>,
}

/// Locally recorded match linked to the hosting provider's match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameMatch {
    pub id: MatchId,
    pub challenge_id: ChallengeId,
    pub external_match_id: Option<String>,
    pub server_id: String,
    pub server_ip: String,
    pub server_port: u16,
    pub server_password: Option<String>,
    pub team1_id: TeamId,
    pub team2_id: TeamId,
    pub team1_external_id: String,
    pub team2_external_id: String,
    pub map: Option<String>,
    /// Sum of both rosters at the time the match was started
    pub expected_players: usize,
    pub started_at: DateTime<Utc>,
    pub connection_validated_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_finished: bool,
    pub is_cancelled: bool,
    pub team1_score: u32,
    pub team2_score: u32,
    pub winner_team_id: Option<TeamId>,
}

impl GameMatch {
    /// Still running on the hosting side and worth polling
    pub fn is_active(&self) -> bool {
        !self.is_finished && !self.is_cancelled && self.external_match_id.is_some()
    }

    pub fn opponent_of(&self, team_id: TeamId) -> Option<TeamId> {
        if team_id == self.team1_id {
            Some(self.team2_id)
        } else if team_id == self.team2_id {
            Some(self.team1_id)
        } else {
            None
        }
    }
}

/// Rating information for a team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamRating {
    pub rating: f64,
    pub uncertainty: f64,
}

impl Default for TeamRating {
    fn default() -> Self {
        Self {
            rating: 1500.0,
            uncertainty: 200.0,
        }
    }
}

impl From<WengLinRating> for TeamRating {
    fn from(rating: WengLinRating) -> Self {
        Self {
            rating: rating.rating,
            uncertainty: rating.uncertainty,
        }
    }
}

impl From<TeamRating> for WengLinRating {
    fn from(rating: TeamRating) -> Self {
        Self {
            rating: rating.rating,
            uncertainty: rating.uncertainty,
        }
    }
}

/// Rating change information for a team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingChange {
    pub team_id: TeamId,
    pub old_rating: TeamRating,
    pub new_rating: TeamRating,
    pub rank: u32, // 1 = winner
}

impl RatingChange {
    pub fn delta(&self) -> f64 {
        self.new_rating.rating - self.old_rating.rating
    }
}

/// Event emitted whenever a challenge changes status or readiness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeUpdated {
    pub challenge_id: ChallengeId,
    pub challenger_team_id: TeamId,
    pub challenged_team_id: TeamId,
    pub status: ChallengeStatus,
    pub challenger_ready: bool,
    pub challenged_ready: bool,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChallengeUpdated {
    pub fn from_challenge(
        challenge: &ChallengeRequest,
        reason: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            challenge_id: challenge.id,
            challenger_team_id: challenge.challenger_team_id,
            challenged_team_id: challenge.challenged_team_id,
            status: challenge.status,
            challenger_ready: challenge.challenger_ready,
            challenged_ready: challenge.challenged_ready,
            reason: reason.map(str::to_string),
            timestamp,
        }
    }
}

/// Where a map veto stands after a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VetoPhase {
    Started,
    Banned,
    Completed,
    TimedOut,
}

/// Event emitted when a veto starts, progresses, completes or times out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VetoProgress {
    pub challenge_id: ChallengeId,
    pub phase: VetoPhase,
    pub banned_map: Option<String>,
    pub banning_team_id: Option<TeamId>,
    pub remaining_maps: Vec<String>,
    pub next_role: Option<TeamRole>,
    pub final_map: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Stage of a match's life reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    Formed,
    Started,
    StartFailed,
    ConnectionValidated,
    Finished,
    Cancelled,
}

impl MatchPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchPhase::Formed => "formed",
            MatchPhase::Started => "started",
            MatchPhase::StartFailed => "start_failed",
            MatchPhase::ConnectionValidated => "connection_validated",
            MatchPhase::Finished => "finished",
            MatchPhase::Cancelled => "cancelled",
        }
    }
}

/// Event emitted at each stage of a match's life
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchLifecycle {
    pub challenge_id: ChallengeId,
    pub match_id: Option<MatchId>,
    pub phase: MatchPhase,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Union type for all AMQP messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AmqpMessage {
    ChallengeUpdated(ChallengeUpdated),
    VetoProgress(VetoProgress),
    MatchLifecycle(MatchLifecycle),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_group_members() {
        let now = Utc::now();
        let solo = QueueGroup::solo(42, now);
        assert_eq!(solo.members(), &[42]);
        assert!(solo.is_solo());
        assert!(!solo.is_full_team());

        let team = QueueGroup::team(1, vec![1, 2, 3, 4, 5], now);
        assert!(team.is_full_team());
        assert!(team.contains(3));
        assert_eq!(team.team_id(), Some(1));
    }

    #[test]
    fn test_queue_count() {
        let now = Utc::now();
        let groups = vec![
            QueueGroup::team(1, vec![1, 2, 3], now),
            QueueGroup::solo(10, now),
            QueueGroup::solo(11, now),
        ];
        let count = QueueCount::from_groups(&groups);
        assert_eq!(
            count,
            QueueCount {
                players: 5,
                teams: 1,
                solos: 2
            }
        );
    }

    #[test]
    fn test_challenge_transition_table() {
        use ChallengeStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Pending.can_transition_to(Declined));
        assert!(Accepted.can_transition_to(Started));
        assert!(Accepted.can_transition_to(Cancelled));
        assert!(Started.can_transition_to(Completed));

        assert!(!Started.can_transition_to(Cancelled));
        assert!(!Declined.can_transition_to(Accepted));
        assert!(!Completed.can_transition_to(Started));
        assert!(!Accepted.can_transition_to(Declined));
    }

    #[test]
    fn test_queue_group_serialization_is_tagged() {
        let group = QueueGroup::solo(76561198000000001, Utc::now());
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json["kind"], "solo");
        assert_eq!(json["player_id"], 76561198000000001u64);
    }
}
