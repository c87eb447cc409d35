//! Route resolution with a local TTL cache in front of the registry.
//!
//! The cache is capacity-capped; inserts past the cap evict from a small
//! random sample, preferring expired entries. Staleness is bounded by the
//! cache TTL (default 60 s) plus explicit invalidation on disconnect
//! notifications.

use async_trait::async_trait;
use common::registry::RouteInfo;
use dashmap::DashMap;
use rand::Rng;
use registry_client::{RegistryClient, RegistryClientError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Route resolution seam consumed by the dispatcher and the ack router;
/// tests inject a fixed map.
#[async_trait]
pub trait RouteLookup: Send + Sync + 'static {
    async fn batch(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, RouteInfo>, RegistryClientError>;

    async fn single(&self, user_id: i64) -> Result<Option<RouteInfo>, RegistryClientError>;

    fn invalidate(&self, _user_id: i64) {}
}

/// Entries inspected per eviction.
const EVICTION_SAMPLE: usize = 8;

struct CachedRoute {
    info: RouteInfo,
    expires_at: Instant,
}

/// Concurrent route cache with per-entry TTL.
pub struct RouteCache {
    entries: DashMap<i64, CachedRoute>,
    ttl: Duration,
    max_entries: usize,
}

impl RouteCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn get(&self, user_id: i64) -> Option<RouteInfo> {
        let hit = self.entries.get(&user_id)?;
        if hit.expires_at <= Instant::now() {
            drop(hit);
            self.entries.remove(&user_id);
            return None;
        }
        Some(hit.info.clone())
    }

    pub fn insert(&self, user_id: i64, info: RouteInfo) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&user_id) {
            self.evict_one();
        }
        self.entries.insert(
            user_id,
            CachedRoute {
                info,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn invalidate(&self, user_id: i64) {
        self.entries.remove(&user_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sample a handful of entries; drop every expired one found, or an
    /// arbitrary sampled entry when none has expired.
    fn evict_one(&self) {
        let now = Instant::now();
        let sample: Vec<i64> = self
            .entries
            .iter()
            .take(EVICTION_SAMPLE)
            .map(|e| *e.key())
            .collect();
        if sample.is_empty() {
            return;
        }
        let mut evicted = false;
        for key in &sample {
            if self
                .entries
                .remove_if(key, |_, v| v.expires_at <= now)
                .is_some()
            {
                evicted = true;
            }
        }
        if !evicted {
            let victim = sample[rand::thread_rng().gen_range(0..sample.len())];
            self.entries.remove(&victim);
        }
    }
}

/// Cache-fronted batch route lookups against the registry.
pub struct RouteService {
    cache: RouteCache,
    registry: RegistryClient,
}

impl RouteService {
    pub fn new(registry: RegistryClient, ttl: Duration) -> Self {
        Self {
            cache: RouteCache::new(ttl, 10_000),
            registry,
        }
    }

    /// Resolve routes for a batch of users. Cache hits are merged with a
    /// single registry query for the misses; users absent from the result
    /// have no live route.
    pub async fn batch_lookup(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, RouteInfo>, RegistryClientError> {
        let mut routes = HashMap::with_capacity(user_ids.len());
        let mut missing = Vec::new();
        for &user_id in user_ids {
            match self.cache.get(user_id) {
                Some(info) => {
                    routes.insert(user_id, info);
                }
                None => missing.push(user_id),
            }
        }

        if !missing.is_empty() {
            let fetched = self.registry.query_user_routes(&missing).await?;
            debug!(
                "route lookup: {} cached, {} queried, {} found",
                user_ids.len() - missing.len(),
                missing.len(),
                fetched.len()
            );
            for (user_id, info) in fetched {
                self.cache.insert(user_id, info.clone());
                routes.insert(user_id, info);
            }
        }
        Ok(routes)
    }

    /// Single-user resolution; `None` means no live route.
    pub async fn lookup(&self, user_id: i64) -> Result<Option<RouteInfo>, RegistryClientError> {
        let routes = self.batch_lookup(&[user_id]).await?;
        Ok(routes.get(&user_id).cloned())
    }

    /// Drop a user's cached route (disconnect notification).
    pub fn invalidate(&self, user_id: i64) {
        self.cache.invalidate(user_id);
    }
}

#[async_trait]
impl RouteLookup for RouteService {
    async fn batch(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, RouteInfo>, RegistryClientError> {
        self.batch_lookup(user_ids).await
    }

    async fn single(&self, user_id: i64) -> Result<Option<RouteInfo>, RegistryClientError> {
        self.lookup(user_id).await
    }

    fn invalidate(&self, user_id: i64) {
        RouteService::invalidate(self, user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(gw: &str) -> RouteInfo {
        RouteInfo {
            gateway_id: gw.to_string(),
            address: format!("{gw}:8082"),
        }
    }

    #[tokio::test]
    async fn hit_then_expiry() {
        tokio::time::pause();
        let cache = RouteCache::new(Duration::from_secs(60), 100);
        cache.insert(1, route("gw-a"));
        assert_eq!(cache.get(1).unwrap().gateway_id, "gw-a");

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let cache = RouteCache::new(Duration::from_secs(60), 100);
        cache.insert(2, route("gw-b"));
        cache.invalidate(2);
        assert!(cache.get(2).is_none());
    }

    #[tokio::test]
    async fn cap_holds_under_churn() {
        let cache = RouteCache::new(Duration::from_secs(60), 16);
        for user_id in 0..200 {
            cache.insert(user_id, route("gw-c"));
        }
        assert!(cache.len() <= 17);
    }

    #[tokio::test]
    async fn eviction_prefers_expired_entries() {
        tokio::time::pause();
        let cache = RouteCache::new(Duration::from_secs(10), 4);
        for user_id in 0..4 {
            cache.insert(user_id, route("old"));
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.insert(100, route("new"));
        assert_eq!(cache.get(100).unwrap().gateway_id, "new");
        // every sampled entry had expired, so the stale ones are gone
        assert!(cache.len() <= 2);
    }
}
