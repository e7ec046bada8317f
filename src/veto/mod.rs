//! Map veto: teams alternately ban maps until one is left

pub mod draft;
pub mod pool;
pub mod turn;

pub use draft::{BanOutcome, DraftSettings, MapVetoDraft, VetoState, VetoStatus};
pub use pool::MapPool;
pub use turn::{is_authorized, role_for_turn, DEFAULT_TURN_TIMEOUT, DEFAULT_VETO_TIMEOUT};
