//! Pairing queued groups into two sides of five
//!
//! Planning is pure: it looks at a queue snapshot and says which players would
//! play whom. Nothing is mutated until the scheduler has validated every plan.

use crate::types::{PlayerId, QueueGroup, TeamId, TEAM_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How a match's two sides were put together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingKind {
    TeamVsTeam,
    TeamVsSolos,
    SolosVsSolos,
}

impl PairingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PairingKind::TeamVsTeam => "team_vs_team",
            PairingKind::TeamVsSolos => "team_vs_solos",
            PairingKind::SolosVsSolos => "solos_vs_solos",
        }
    }
}

impl std::fmt::Display for PairingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a planned match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSide {
    pub members: Vec<PlayerId>,
    /// The queued team this side came from, if any
    pub source_team: Option<TeamId>,
}

impl MatchSide {
    fn from_team(team_id: TeamId, members: &[PlayerId]) -> Self {
        Self {
            members: members.to_vec(),
            source_team: Some(team_id),
        }
    }

    fn from_solos(members: Vec<PlayerId>) -> Self {
        Self {
            members,
            source_team: None,
        }
    }
}

/// A pairing that has not been materialised yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPlan {
    pub kind: PairingKind,
    pub sides: [MatchSide; 2],
}

/// A plan that would break a match invariant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormationError {
    #[error("Side {side} has {size} players, expected {expected}")]
    SideSizeMismatch {
        side: usize,
        size: usize,
        expected: usize,
    },

    #[error("Player {player_id} is on both sides")]
    DuplicatePlayer { player_id: PlayerId },
}

impl MatchPlan {
    /// Exactly five players per side and nobody twice
    pub fn validate(&self) -> Result<(), FormationError> {
        let mut seen = HashSet::new();
        for (side, members) in self.sides.iter().map(|s| &s.members).enumerate() {
            if members.len() != TEAM_SIZE {
                return Err(FormationError::SideSizeMismatch {
                    side,
                    size: members.len(),
                    expected: TEAM_SIZE,
                });
            }
            for &player_id in members {
                if !seen.insert(player_id) {
                    return Err(FormationError::DuplicatePlayer { player_id });
                }
            }
        }
        Ok(())
    }

    pub fn players(&self) -> Vec<PlayerId> {
        self.sides
            .iter()
            .flat_map(|side| side.members.iter().copied())
            .collect()
    }
}

/// Strategy for pairing a queue snapshot
pub trait MatchPlanner: Send + Sync {
    /// Every match that can be packed from `groups`, in formation order
    fn plan(&self, groups: &[QueueGroup]) -> Vec<MatchPlan>;
}

/// Takes groups strictly in snapshot order
///
/// Two full teams are preferred, then a full team against five solos, then
/// ten solos. Partial teams are never split.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFitPlanner;

impl MatchPlanner for FirstFitPlanner {
    fn plan(&self, groups: &[QueueGroup]) -> Vec<MatchPlan> {
        plan_all(groups)
    }
}

/// The first match that can be formed, with the indices of the groups it uses
fn pick(groups: &[QueueGroup]) -> Option<(MatchPlan, Vec<usize>)> {
    let full_teams: Vec<usize> = groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.is_full_team())
        .map(|(i, _)| i)
        .collect();
    let solos: Vec<usize> = groups
        .iter()
        .enumerate()
        .filter(|(_, g)| g.is_solo())
        .map(|(i, _)| i)
        .collect();

    let team_side = |index: usize| {
        let group = &groups[index];
        MatchSide::from_team(group.team_id().unwrap_or_default(), group.members())
    };
    let solo_side = |indices: &[usize]| {
        MatchSide::from_solos(
            indices
                .iter()
                .flat_map(|&i| groups[i].members().iter().copied())
                .collect(),
        )
    };

    if let [first, second, ..] = full_teams[..] {
        let plan = MatchPlan {
            kind: PairingKind::TeamVsTeam,
            sides: [team_side(first), team_side(second)],
        };
        return Some((plan, vec![first, second]));
    }

    if let (Some(&team), true) = (full_teams.first(), solos.len() >= TEAM_SIZE) {
        let picked = &solos[..TEAM_SIZE];
        let plan = MatchPlan {
            kind: PairingKind::TeamVsSolos,
            sides: [team_side(team), solo_side(picked)],
        };
        let mut used = vec![team];
        used.extend_from_slice(picked);
        return Some((plan, used));
    }

    if solos.len() >= TEAM_SIZE * 2 {
        let picked = &solos[..TEAM_SIZE * 2];
        let plan = MatchPlan {
            kind: PairingKind::SolosVsSolos,
            sides: [solo_side(&picked[..TEAM_SIZE]), solo_side(&picked[TEAM_SIZE..])],
        };
        return Some((plan, picked.to_vec()));
    }

    None
}

/// The next match to form from a snapshot, if any
pub fn plan_match(groups: &[QueueGroup]) -> Option<MatchPlan> {
    pick(groups).map(|(plan, _)| plan)
}

/// Pack as many matches as the snapshot allows
pub fn plan_all(groups: &[QueueGroup]) -> Vec<MatchPlan> {
    let mut remaining = groups.to_vec();
    let mut plans = Vec::new();

    while remaining.iter().map(QueueGroup::size).sum::<usize>() >= TEAM_SIZE * 2 {
        let Some((plan, used)) = pick(&remaining) else {
            break;
        };
        let mut index = 0;
        remaining.retain(|_| {
            let keep = !used.contains(&index);
            index += 1;
            keep
        });
        plans.push(plan);
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn team(team_id: TeamId, first: PlayerId, size: u64) -> QueueGroup {
        QueueGroup::team(team_id, (first..first + size).collect(), Utc::now())
    }

    fn solos(range: std::ops::Range<PlayerId>) -> Vec<QueueGroup> {
        range.map(|id| QueueGroup::solo(id, Utc::now())).collect()
    }

    #[test]
    fn test_two_full_teams_in_snapshot_order() {
        let groups = vec![team(1, 1, 5), team(2, 11, 5), team(3, 21, 5)];
        let plan = plan_match(&groups).unwrap();

        assert_eq!(plan.kind, PairingKind::TeamVsTeam);
        assert_eq!(plan.sides[0].source_team, Some(1));
        assert_eq!(plan.sides[1].source_team, Some(2));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_team_against_first_five_solos() {
        let mut groups = vec![team(1, 1, 5)];
        groups.extend(solos(10..17));

        let plans = plan_all(&groups);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].kind, PairingKind::TeamVsSolos);
        assert_eq!(plans[0].sides[0].members, vec![1, 2, 3, 4, 5]);
        assert_eq!(plans[0].sides[1].members, vec![10, 11, 12, 13, 14]);
        assert_eq!(plans[0].sides[1].source_team, None);
    }

    #[test]
    fn test_ten_solos_split_in_order() {
        let plan = plan_match(&solos(1..11)).unwrap();
        assert_eq!(plan.kind, PairingKind::SolosVsSolos);
        assert_eq!(plan.sides[0].members, vec![1, 2, 3, 4, 5]);
        assert_eq!(plan.sides[1].members, vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_partial_teams_are_not_split() {
        let mut groups = vec![team(1, 1, 3), team(2, 11, 4)];
        groups.extend(solos(20..24));
        assert!(plan_match(&groups).is_none());
        assert!(plan_all(&groups).is_empty());
    }

    #[test]
    fn test_packs_several_matches() {
        let mut groups = vec![team(1, 1, 5), team(2, 11, 5), team(3, 21, 5)];
        groups.extend(solos(100..117));

        let kinds: Vec<PairingKind> = plan_all(&groups).iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                PairingKind::TeamVsTeam,
                PairingKind::TeamVsSolos,
                PairingKind::SolosVsSolos
            ]
        );
    }

    #[test]
    fn test_validate_rejects_bad_plans() {
        let short = MatchPlan {
            kind: PairingKind::SolosVsSolos,
            sides: [
                MatchSide::from_solos(vec![1, 2, 3, 4]),
                MatchSide::from_solos(vec![5, 6, 7, 8, 9]),
            ],
        };
        assert!(matches!(
            short.validate(),
            Err(FormationError::SideSizeMismatch { side: 0, size: 4, .. })
        ));

        let overlap = MatchPlan {
            kind: PairingKind::SolosVsSolos,
            sides: [
                MatchSide::from_solos(vec![1, 2, 3, 4, 5]),
                MatchSide::from_solos(vec![5, 6, 7, 8, 9]),
            ],
        };
        assert_eq!(
            overlap.validate(),
            Err(FormationError::DuplicatePlayer { player_id: 5 })
        );
    }
}
