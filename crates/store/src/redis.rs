//! Redis client wrapper with bounded-retry command helpers.
//!
//! Transient failures are retried with a 100 ms backoff; the caller picks
//! the attempt budget per call site. A nil reply is never retried.

use crate::error::Result;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Shared Redis client. Cheap to clone; connections are multiplexed.
#[derive(Clone)]
pub struct Store {
    client: redis::Client,
}

impl Store {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// A connection not shared with other callers, for blocking stream
    /// reads.
    pub async fn dedicated_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    // ========================================================================
    // Strings
    // ========================================================================

    pub async fn get(&self, attempts: usize, key: &str) -> Result<Option<String>> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.get::<_, Option<String>>(key).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn set_ex(
        &self,
        attempts: usize,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<()> {
        let secs = ttl.as_secs().max(1);
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.set_ex::<_, _, ()>(key, value, secs).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn del(&self, attempts: usize, key: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.del::<_, ()>(key).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn exists(&self, attempts: usize, key: &str) -> Result<bool> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.exists::<_, bool>(key).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn mget(&self, attempts: usize, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => {
                    match redis::cmd("MGET")
                        .arg(keys)
                        .query_async::<Vec<Option<String>>>(&mut conn)
                        .await
                    {
                        Ok(v) => return Ok(v),
                        Err(e) => last = Some(e.into()),
                    }
                }
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    /// GET + JSON decode. A record that fails to parse is reported, not
    /// retried.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        attempts: usize,
        key: &str,
    ) -> Result<Option<T>> {
        match self.get(attempts, key).await? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(v) => Ok(Some(v)),
                Err(e) => {
                    warn!("malformed record at {}: {}", key, e);
                    Err(e.into())
                }
            },
            None => Ok(None),
        }
    }

    pub async fn set_json_ex<T: Serialize>(
        &self,
        attempts: usize,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_ex(attempts, key, &raw, ttl).await
    }

    // ========================================================================
    // Lists
    // ========================================================================

    pub async fn rpush(&self, attempts: usize, key: &str, value: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.rpush::<_, _, ()>(key, value).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn lpush(&self, attempts: usize, key: &str, value: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.lpush::<_, _, ()>(key, value).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn lpop(&self, attempts: usize, key: &str) -> Result<Option<String>> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.lpop::<_, Option<String>>(key, None).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn llen(&self, attempts: usize, key: &str) -> Result<i64> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.llen::<_, i64>(key).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    // ========================================================================
    // Sets
    // ========================================================================

    pub async fn sadd(&self, attempts: usize, key: &str, member: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.sadd::<_, _, ()>(key, member).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn srem(&self, attempts: usize, key: &str, member: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.srem::<_, _, ()>(key, member).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn smembers(&self, attempts: usize, key: &str) -> Result<Vec<String>> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.smembers::<_, Vec<String>>(key).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn scard(&self, attempts: usize, key: &str) -> Result<i64> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.scard::<_, i64>(key).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    // ========================================================================
    // Sorted sets
    // ========================================================================

    pub async fn zadd(&self, attempts: usize, key: &str, member: &str, score: f64) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.zadd::<_, _, _, ()>(key, member, score).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn zrem(&self, attempts: usize, key: &str, member: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.zrem::<_, _, ()>(key, member).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    /// Members by rank, ascending score order.
    pub async fn zrange(
        &self,
        attempts: usize,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.zrange::<_, Vec<String>>(key, start, stop).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    /// Members with score at or below `max_score`.
    pub async fn zrange_by_score_upto(
        &self,
        attempts: usize,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<String>> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => {
                    match conn
                        .zrangebyscore::<_, _, _, Vec<String>>(key, "-inf", max_score)
                        .await
                    {
                        Ok(v) => return Ok(v),
                        Err(e) => last = Some(e.into()),
                    }
                }
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn zscore(&self, attempts: usize, key: &str, member: &str) -> Result<Option<f64>> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.zscore::<_, _, Option<f64>>(key, member).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    // ========================================================================
    // Key lifetime
    // ========================================================================

    pub async fn expire(&self, attempts: usize, key: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1) as i64;
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.expire::<_, ()>(key, secs).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }

    pub async fn persist(&self, attempts: usize, key: &str) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.persist::<_, ()>(key).await {
                    Ok(()) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
        Err(last.expect("at least one attempt"))
    }
}
