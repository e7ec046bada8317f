//! Utility functions for the matchmaking service

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Generate an owner token for a lock lease
pub fn generate_lock_token() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a per-match game server password
pub fn generate_server_password() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Convert a std duration into a chrono one for timestamp arithmetic
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

/// Whether `duration` has passed between `since` and `now`
pub fn has_elapsed(since: DateTime<Utc>, now: DateTime<Utc>, duration: Duration) -> bool {
    now - since >= to_chrono(duration)
}

/// Source of wall-clock time, injectable so timeouts can be tested
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        current_timestamp()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += to_chrono(by);
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(current_timestamp())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map(|now| *now)
            .unwrap_or_else(|poisoned| *poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_tokens() {
        assert_ne!(generate_lock_token(), generate_lock_token());
        let password = generate_server_password();
        assert_eq!(password.len(), 12);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = current_timestamp();
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(120));
        assert_eq!(clock.now() - start, chrono::Duration::seconds(120));
    }

    #[test]
    fn test_has_elapsed_boundary() {
        let start = current_timestamp();
        let at = start + chrono::Duration::seconds(120);
        assert!(has_elapsed(start, at, Duration::from_secs(120)));
        assert!(!has_elapsed(
            start,
            at - chrono::Duration::milliseconds(1),
            Duration::from_secs(120)
        ));
    }
}
