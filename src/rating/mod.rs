//! Team rating system using the Weng-Lin (OpenSkill) algorithm
//!
//! Finished matches with a declared winner move both teams' ratings; the
//! calculator and storage are traits so the monitor can be tested in isolation.

pub mod calculator;
pub mod storage;
pub mod weng_lin;

// Re-export commonly used types
pub use calculator::{RatingCalculationResult, RatingCalculator};
pub use storage::{InMemoryRatingStorage, RatingEntry, RatingStorage};
pub use weng_lin::{ExtendedWengLinConfig, WengLinRatingCalculator};
