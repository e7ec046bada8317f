//! Key-value backends holding the shared queue state and its lock

use crate::error::{MatchmakingError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared key-value state with a named, token-owned lock primitive
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value`, expiring it after `ttl`
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Take the lock `name` for `token` unless someone else holds it
    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Release the lock only if `token` still owns it
    async fn unlock(&self, name: &str, token: &str) -> Result<bool>;

    /// Cheap connectivity check for health reporting
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Single-process backend used in tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryStore {
    values: Mutex<HashMap<String, Expiring>>,
    locks: Mutex<HashMap<String, Expiring>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every value operation fail, as if the backend went away
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current holder of a lock, if it has not expired
    pub fn lock_holder(&self, name: &str) -> Option<String> {
        let locks = self.locks.lock().ok()?;
        locks
            .get(name)
            .filter(|lock| lock.is_live())
            .map(|lock| lock.value.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(MatchmakingError::InternalError {
                message: "key-value backend unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let values = self
            .values
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("values"))?;
        Ok(values
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut values = self
            .values
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("values"))?;
        values.insert(key.to_string(), Expiring::new(value, ttl));
        Ok(())
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("locks"))?;
        if locks.get(name).is_some_and(Expiring::is_live) {
            return Ok(false);
        }
        locks.insert(name.to_string(), Expiring::new(token.to_string(), ttl));
        Ok(true)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| MatchmakingError::lock_poisoned("locks"))?;
        match locks.get(name) {
            Some(lock) if lock.value == token => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_expire() {
        let store = InMemoryStore::new();
        store
            .put("k", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_is_owned_by_token() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.try_lock("q", "a", ttl).await.unwrap());
        assert!(!store.try_lock("q", "b", ttl).await.unwrap());
        assert!(!store.unlock("q", "b").await.unwrap());
        assert_eq!(store.lock_holder("q"), Some("a".to_string()));

        assert!(store.unlock("q", "a").await.unwrap());
        assert!(store.try_lock("q", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let store = InMemoryStore::new();
        assert!(store
            .try_lock("q", "crashed", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .try_lock("q", "next", Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_reads() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(store.get("k").await.is_err());
        assert!(store.ping().await.is_err());
    }
}
