//! Whose turn it is to ban

use crate::types::TeamRole;
use crate::utils::{has_elapsed, to_chrono};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default time a team has for one ban
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time the whole veto may take
pub const DEFAULT_VETO_TIMEOUT: Duration = Duration::from_secs(600);

/// Challenger bans on even ordinals, challenged on odd ones
pub fn role_for_turn(ordinal: usize) -> TeamRole {
    if ordinal % 2 == 0 {
        TeamRole::Challenger
    } else {
        TeamRole::Challenged
    }
}

/// Whether `role` may make ban number `ordinal` at `now`
///
/// Once the turn has run past `turn_timeout`, either side may ban for the
/// stalled team.
pub fn is_authorized(
    ordinal: usize,
    role: TeamRole,
    now: DateTime<Utc>,
    turn_started_at: DateTime<Utc>,
    turn_timeout: Duration,
) -> bool {
    role == role_for_turn(ordinal) || has_elapsed(turn_started_at, now, turn_timeout)
}

pub fn deadline(started_at: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    started_at + to_chrono(timeout)
}
