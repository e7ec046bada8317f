//! Weng-Lin (OpenSkill) rating system implementation
//!
//! Concrete rating calculator backed by the skillratings crate. Each team is
//! rated as a single entity, so a finished 5v5 is a two-party Weng-Lin game.

use crate::config::app::RatingSettings;
use crate::error::MatchmakingError;
use crate::rating::calculator::{RatingCalculationResult, RatingCalculator};
use crate::types::{RatingChange, TeamId, TeamRating};
use serde::{Deserialize, Serialize};
use skillratings::weng_lin::{expected_score, weng_lin, WengLinConfig, WengLinRating};
use skillratings::Outcomes;

/// Extended configuration for the Weng-Lin rating system
/// This wraps the skillratings WengLinConfig with the initial rating values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedWengLinConfig {
    /// Core Weng-Lin parameters
    pub weng_lin_config: WengLinConfig,
    /// Initial rating for new teams
    pub initial_rating: f64,
    /// Initial uncertainty for new teams
    pub initial_uncertainty: f64,
}

impl Default for ExtendedWengLinConfig {
    fn default() -> Self {
        Self {
            weng_lin_config: WengLinConfig {
                beta: 200.0,
                uncertainty_tolerance: 0.0001,
            },
            initial_rating: 1500.0,
            initial_uncertainty: 200.0,
        }
    }
}

impl From<&RatingSettings> for ExtendedWengLinConfig {
    fn from(settings: &RatingSettings) -> Self {
        Self {
            weng_lin_config: WengLinConfig {
                beta: settings.beta,
                uncertainty_tolerance: settings.uncertainty_tolerance,
            },
            initial_rating: settings.initial_rating,
            initial_uncertainty: settings.initial_uncertainty,
        }
    }
}

impl ExtendedWengLinConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.weng_lin_config.beta <= 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "Beta must be positive".to_string(),
            }
            .into());
        }

        if self.weng_lin_config.uncertainty_tolerance < 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "Uncertainty tolerance must be non-negative".to_string(),
            }
            .into());
        }

        if self.initial_uncertainty <= 0.0 {
            return Err(MatchmakingError::ConfigurationError {
                message: "Initial uncertainty must be positive".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Weng-Lin rating calculator implementation
#[derive(Debug)]
pub struct WengLinRatingCalculator {
    config: ExtendedWengLinConfig,
}

impl WengLinRatingCalculator {
    /// Create a new Weng-Lin rating calculator
    pub fn new(config: ExtendedWengLinConfig) -> crate::error::Result<Self> {
        config.validate()?;

        Ok(Self { config })
    }

    pub fn config(&self) -> &ExtendedWengLinConfig {
        &self.config
    }
}

impl RatingCalculator for WengLinRatingCalculator {
    fn rate_result(
        &self,
        winner: (TeamId, &TeamRating),
        loser: (TeamId, &TeamRating),
    ) -> crate::error::Result<RatingCalculationResult> {
        let (winner_id, winner_rating) = winner;
        let (loser_id, loser_rating) = loser;

        if winner_id == loser_id {
            return Err(MatchmakingError::RatingCalculationFailed {
                reason: format!("Team {} cannot play itself", winner_id),
            }
            .into());
        }

        let winner_weng_lin: WengLinRating = winner_rating.clone().into();
        let loser_weng_lin: WengLinRating = loser_rating.clone().into();

        let (expected_win, _) = expected_score(
            &winner_weng_lin,
            &loser_weng_lin,
            &self.config.weng_lin_config,
        );

        let (new_winner, new_loser) = weng_lin(
            &winner_weng_lin,
            &loser_weng_lin,
            &Outcomes::WIN,
            &self.config.weng_lin_config,
        );

        Ok(RatingCalculationResult {
            rating_changes: vec![
                RatingChange {
                    team_id: winner_id,
                    old_rating: winner_rating.clone(),
                    new_rating: new_winner.into(),
                    rank: 1,
                },
                RatingChange {
                    team_id: loser_id,
                    old_rating: loser_rating.clone(),
                    new_rating: new_loser.into(),
                    rank: 2,
                },
            ],
            expected_win_probability: expected_win,
        })
    }

    fn initial_rating(&self) -> TeamRating {
        TeamRating {
            rating: self.config.initial_rating,
            uncertainty: self.config.initial_uncertainty,
        }
    }

    fn win_probability(&self, team: &TeamRating, opponent: &TeamRating) -> f64 {
        let (win, _) = expected_score(
            &team.clone().into(),
            &opponent.clone().into(),
            &self.config.weng_lin_config,
        );
        win
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> WengLinRatingCalculator {
        WengLinRatingCalculator::new(ExtendedWengLinConfig::default()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        let mut config = ExtendedWengLinConfig::default();
        assert!(config.validate().is_ok());

        config.weng_lin_config.beta = -1.0;
        assert!(config.validate().is_err());

        config = ExtendedWengLinConfig::default();
        config.initial_uncertainty = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_winner_gains_loser_loses() {
        let calculator = calculator();
        let even = TeamRating::default();

        let result = calculator.rate_result((1, &even), (2, &even)).unwrap();

        let winner = result.change_for(1).unwrap();
        let loser = result.change_for(2).unwrap();
        assert!(winner.delta() > 0.0);
        assert!(loser.delta() < 0.0);
        assert_eq!(winner.rank, 1);
        assert_eq!(loser.rank, 2);
        assert!((result.expected_win_probability - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_upset_moves_ratings_further() {
        let calculator = calculator();
        let strong = TeamRating {
            rating: 1800.0,
            uncertainty: 150.0,
        };
        let weak = TeamRating {
            rating: 1300.0,
            uncertainty: 150.0,
        };

        let expected = calculator.rate_result((1, &strong), (2, &weak)).unwrap();
        let upset = calculator.rate_result((2, &weak), (1, &strong)).unwrap();

        assert!(upset.was_upset());
        assert!(!expected.was_upset());
        assert!(upset.change_for(2).unwrap().delta() > expected.change_for(1).unwrap().delta());
    }

    #[test]
    fn test_win_probability_ordering() {
        let calculator = calculator();
        let strong = TeamRating {
            rating: 1700.0,
            uncertainty: 150.0,
        };
        let weak = TeamRating {
            rating: 1300.0,
            uncertainty: 150.0,
        };

        assert!(calculator.win_probability(&strong, &weak) > 0.7);
        assert!(calculator.win_probability(&weak, &strong) < 0.3);
    }

    #[test]
    fn test_rejects_self_match() {
        let calculator = calculator();
        let rating = TeamRating::default();
        assert!(calculator.rate_result((3, &rating), (3, &rating)).is_err());
    }
}
