//! Error types for the matchmaking service
//!
//! Plumbing returns `anyhow::Result`; domain rejections travel inside it as
//! `MatchmakingError` values so callers can recover them with `downcast_ref`.
//! Match start failures have their own typed enum because every step of the
//! hand-off maps to a distinct, loggable outcome.

use crate::types::{ChallengeId, ChallengeStatus, MatchId, PlayerId, TeamId};

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Broad classification of a failure, used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Wrong caller, wrong turn or wrong state; rejected with a reason
    Validation,
    /// Resource absent or expired; the client should refresh
    NotFound,
    /// Hosting API, broker or cache failure
    ExternalDependency,
    /// The shared queue lock could not be acquired in time
    LockContention,
    /// Poisoned locks, storage failures and other bugs
    Internal,
}

/// Custom error types for specific matchmaking scenarios
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Invalid queue request: {reason}")]
    InvalidQueueRequest { reason: String },

    #[error("Queue lock '{name}' is unavailable")]
    LockUnavailable { name: String },

    #[error("Player {player_id} is not in a team")]
    NotInTeam { player_id: PlayerId },

    #[error("Player {player_id} is not the leader of team {team_id}")]
    NotLeader { player_id: PlayerId, team_id: TeamId },

    #[error("Player {player_id} already belongs to team {team_id}")]
    AlreadyInTeam { player_id: PlayerId, team_id: TeamId },

    #[error("Player {player_id} is not a member of team {team_id}")]
    NotTeamMember { player_id: PlayerId, team_id: TeamId },

    #[error("Team not found: {team_id}")]
    TeamNotFound { team_id: TeamId },

    #[error("Challenge not found or expired: {challenge_id}")]
    ChallengeNotFound { challenge_id: ChallengeId },

    #[error("Match not found: {match_id}")]
    MatchNotFound { match_id: MatchId },

    #[error("Team {team_id} is already in an accepted challenge")]
    AlreadyInAcceptedChallenge { team_id: TeamId },

    #[error("Team {challenger_team_id} has already challenged team {challenged_team_id}")]
    AlreadyChallenged {
        challenger_team_id: TeamId,
        challenged_team_id: TeamId,
    },

    #[error("Team {team_id} cannot challenge itself")]
    SelfChallenge { team_id: TeamId },

    #[error("Team {team_id} is not a participant in challenge {challenge_id}")]
    NotParticipant {
        challenge_id: ChallengeId,
        team_id: TeamId,
    },

    #[error("Only the challenged team may respond to challenge {challenge_id}")]
    NotChallengedTeam {
        challenge_id: ChallengeId,
        team_id: TeamId,
    },

    #[error("Invalid challenge transition from {from} to {to}")]
    InvalidTransition {
        from: ChallengeStatus,
        to: ChallengeStatus,
    },

    #[error("Challenge {challenge_id} does not allow this action: {reason}")]
    InvalidChallengeState {
        challenge_id: ChallengeId,
        reason: String,
    },

    #[error("Not your turn to ban in challenge {challenge_id}")]
    NotYourTurn { challenge_id: ChallengeId },

    #[error("Invalid map: {map_name}")]
    InvalidMap { map_name: String },

    #[error("Map already banned: {map_name}")]
    MapAlreadyBanned { map_name: String },

    #[error("Map veto is not active for challenge {challenge_id}")]
    VetoNotActive { challenge_id: ChallengeId },

    #[error("Veto ban out of order for challenge {challenge_id}: expected ordinal {expected}, got {actual}")]
    VetoOrderViolation {
        challenge_id: ChallengeId,
        expected: usize,
        actual: usize,
    },

    #[error("Match {match_id} is finished and can no longer be updated")]
    MatchFinished { match_id: MatchId },

    #[error("Hosting API error: {message}")]
    HostingApiError { message: String },

    #[error("Rating calculation failed: {reason}")]
    RatingCalculationFailed { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl MatchmakingError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchmakingError::ChallengeNotFound { .. }
            | MatchmakingError::MatchNotFound { .. }
            | MatchmakingError::TeamNotFound { .. } => ErrorKind::NotFound,
            MatchmakingError::LockUnavailable { .. } => ErrorKind::LockContention,
            MatchmakingError::AmqpConnectionFailed { .. }
            | MatchmakingError::HostingApiError { .. } => ErrorKind::ExternalDependency,
            MatchmakingError::RatingCalculationFailed { .. }
            | MatchmakingError::ConfigurationError { .. }
            | MatchmakingError::InternalError { .. } => ErrorKind::Internal,
            _ => ErrorKind::Validation,
        }
    }

    /// Whether the error is a rejected user action rather than a fault
    pub fn is_rejection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::NotFound)
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        MatchmakingError::InternalError {
            message: format!("Failed to acquire {} lock", what),
        }
    }
}

/// Classify an arbitrary error chain, defaulting to `Internal`
pub fn error_kind(error: &anyhow::Error) -> ErrorKind {
    error
        .downcast_ref::<MatchmakingError>()
        .map(MatchmakingError::kind)
        .unwrap_or(ErrorKind::Internal)
}

/// Why a match could not be handed off to the hosting provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartMatchError {
    #[error("Challenge {challenge_id} cannot start a match: {reason}")]
    ChallengeNotStartable {
        challenge_id: ChallengeId,
        reason: String,
    },

    #[error("No hosting server is available")]
    NoServerAvailable,

    #[error("Failed to list hosting servers: {message}")]
    ServerLookupFailed { message: String },

    #[error("Failed to create hosting teams: {message}")]
    TeamCreationFailed { message: String },

    #[error("Failed to create hosting match: {message}")]
    MatchCreationFailed { message: String },

    #[error("Hosting API created a match but returned no id")]
    MissingMatchId,

    #[error("Failed to persist match state: {message}")]
    Persistence { message: String },
}

impl StartMatchError {
    /// HTTP-style status code for the web layer
    pub fn status_code(&self) -> u16 {
        match self {
            StartMatchError::ChallengeNotStartable { .. } => 409,
            StartMatchError::NoServerAvailable => 503,
            StartMatchError::ServerLookupFailed { .. }
            | StartMatchError::TeamCreationFailed { .. }
            | StartMatchError::MatchCreationFailed { .. }
            | StartMatchError::MissingMatchId => 502,
            StartMatchError::Persistence { .. } => 500,
        }
    }

    /// Short step label used for logs and metrics
    pub fn step(&self) -> &'static str {
        match self {
            StartMatchError::ChallengeNotStartable { .. } => "guard",
            StartMatchError::NoServerAvailable | StartMatchError::ServerLookupFailed { .. } => {
                "server"
            }
            StartMatchError::TeamCreationFailed { .. } => "teams",
            StartMatchError::MatchCreationFailed { .. } | StartMatchError::MissingMatchId => {
                "match"
            }
            StartMatchError::Persistence { .. } => "persist",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StartMatchError::ChallengeNotStartable { .. } => ErrorKind::Validation,
            StartMatchError::Persistence { .. } => ErrorKind::Internal,
            _ => ErrorKind::ExternalDependency,
        }
    }
}
