//! Redis queue backend
//!
//! Values are plain strings with a millisecond TTL. The lock is a `SET NX PX`
//! key whose value is the owner's token; release goes through a script so a
//! holder whose lease already expired cannot delete someone else's lock.

use crate::error::Result;
use crate::queue::backend::KeyValueStore;
use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tracing::info;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Production backend shared by every service instance
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    unlock: Script,
}

impl RedisStore {
    /// Connect to `url`, e.g. `redis://localhost:6379/0`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("Invalid Redis URL")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis queue backend");
        Ok(Self {
            manager,
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis GET {} failed", key))?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis SET {} failed", key))?;
        Ok(())
    }

    async fn try_lock(&self, name: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("Redis lock {} failed", name))?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .unlock
            .key(name)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("Redis unlock {} failed", name))?;
        Ok(deleted == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;
        Ok(())
    }
}
