//! Stable mapping from IdP opaque object ids to POSIX uid/gid numbers.
//!
//! Two interchangeable backends are provided: [`LocalUidCache`] (an in-process map) and
//! [`RedisUidCache`] (a lazily-connected networked store). Both implement the same small
//! primitive interface; [`UidCache::get_uid`] and [`UidCache::overwrite_uid`] are derived
//! operations built on top of it and shared by every backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;

/// Sentinel used when a category has no existing entries, so the first allocation in that
/// category lands on `min_value`.
const EMPTY_CATEGORY_SENTINEL: i64 = -999;

#[async_trait]
pub trait UidCache: Send + Sync {
    /// Returns the stored value for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Unconditionally stores `value` for `key`.
    async fn set(&self, key: &str, value: i64) -> Result<()>;

    /// Returns every stored key.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Returns the stored values for `keys`, in the same order; missing keys yield `None`.
    async fn values(&self, keys: &[String]) -> Result<Vec<Option<i64>>>;

    /// Returns the existing uid/gid for `(category, id)`, allocating and persisting a new
    /// one — `max(current-max-in-category, min_value) + 1` — on miss.
    async fn get_uid(&self, id: &str, category: &str, min_value: i64) -> Result<i64> {
        let key = cache_key(category, id);
        if let Some(existing) = self.get(&key).await? {
            return Ok(existing);
        }

        let max_existing = self.max_in_category(category).await?;
        let allocated = std::cmp::max(max_existing, min_value - 1) + 1;
        self.set(&key, allocated).await?;
        Ok(allocated)
    }

    /// Installs an IdP-asserted uid/gid into the allocator unconditionally, so that future
    /// allocations in the same category never collide with it.
    async fn overwrite_uid(&self, id: &str, category: &str, uid: i64) -> Result<()> {
        self.set(&cache_key(category, id), uid).await
    }

    /// Highest value currently stored under `category`, or [`EMPTY_CATEGORY_SENTINEL`] if
    /// the category is empty.
    async fn max_in_category(&self, category: &str) -> Result<i64> {
        let prefix = format!("{category}-");
        let matching: Vec<String> = self
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect();
        let values = self.values(&matching).await?;
        Ok(values
            .into_iter()
            .flatten()
            .chain(std::iter::once(EMPTY_CATEGORY_SENTINEL))
            .max()
            .unwrap_or(EMPTY_CATEGORY_SENTINEL))
    }
}

fn cache_key(category: &str, id: &str) -> String {
    format!("{category}-{id}")
}

/// In-memory [`UidCache`] backend. Used when `redis_host`/`redis_port` are not configured.
#[derive(Default)]
pub struct LocalUidCache {
    values: Mutex<HashMap<String, i64>>,
}

impl LocalUidCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UidCache for LocalUidCache {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.values.lock().unwrap().get(key).copied())
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        self.values.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.values.lock().unwrap().keys().cloned().collect())
    }

    async fn values(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        let guard = self.values.lock().unwrap();
        Ok(keys.iter().map(|key| guard.get(key).copied()).collect())
    }
}

/// Networked [`UidCache`] backend, reachable at `redis_host:redis_port`. The connection is
/// created lazily on first use so that a misconfigured Redis target only surfaces as an
/// error on the first allocation, not at construction time.
pub struct RedisUidCache {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisUidCache {
    /// # Errors
    ///
    /// Returns [`crate::error::Error::UidCacheUnavailable`] if the connection URL is malformed.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}"))?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.get_multiplexed_async_connection().await?);
        }
        Ok(guard.as_ref().unwrap().clone())
    }
}

#[async_trait]
impl UidCache for RedisUidCache {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.set(key, value).await?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.keys("*").await?)
    }

    async fn values(&self, keys: &[String]) -> Result<Vec<Option<i64>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        Ok(conn.mget(keys).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_allocation_lands_on_min_value() {
        let cache = LocalUidCache::new();
        let uid = cache.get_uid("user-1", "user", 2000).await.unwrap();
        assert_eq!(uid, 2000);
    }

    #[tokio::test]
    async fn allocations_are_monotonic_within_a_category() {
        let cache = LocalUidCache::new();
        let first = cache.get_uid("user-1", "user", 2000).await.unwrap();
        let second = cache.get_uid("user-2", "user", 2000).await.unwrap();
        assert_eq!(first, 2000);
        assert_eq!(second, 2001);
    }

    #[tokio::test]
    async fn categories_are_independent() {
        let cache = LocalUidCache::new();
        cache.get_uid("user-1", "user", 2000).await.unwrap();
        let group_gid = cache.get_uid("group-1", "group", 3000).await.unwrap();
        assert_eq!(group_gid, 3000);
    }

    #[tokio::test]
    async fn repeated_lookups_are_stable() {
        let cache = LocalUidCache::new();
        let first = cache.get_uid("user-1", "user", 2000).await.unwrap();
        let second = cache.get_uid("user-1", "user", 2000).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn overwrite_pins_future_allocation_above_it() {
        let cache = LocalUidCache::new();
        cache.overwrite_uid("user-1", "user", 5000).await.unwrap();
        let next = cache.get_uid("user-2", "user", 2000).await.unwrap();
        assert_eq!(next, 5001);
    }
}
