//! Shared queue of solo players and teams waiting for a match

pub mod backend;
pub mod redis_store;
pub mod store;

pub use backend::{InMemoryStore, KeyValueStore};
pub use redis_store::RedisStore;
pub use store::{JoinOutcome, LeaveOutcome, QueueSettings, QueueStore, QueueTransaction};
