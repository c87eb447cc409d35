//! Chat-message write-behind queue.
//!
//! Send serializes each accepted message into `cache:send:messages`; the
//! flusher drains the list in batches into MySQL.

use crate::error::Result;
use crate::keys;
use crate::redis::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ATTEMPTS: usize = 2;

/// One queued chat message awaiting relational insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMessage {
    pub id: i64,
    pub room_id: i64,
    pub sender_id: i64,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub async fn enqueue_message(&self, msg: &CachedMessage) -> Result<()> {
        let raw = serde_json::to_string(msg)?;
        self.rpush(ATTEMPTS, keys::MESSAGE_CACHE, &raw).await
    }

    /// Pop up to `batch` queued messages. Stops at the first error or
    /// empty reply; unparseable entries are skipped.
    pub async fn drain_messages(&self, batch: usize) -> Result<Vec<CachedMessage>> {
        let mut out = Vec::new();
        for _ in 0..batch {
            let Some(raw) = self.lpop(ATTEMPTS, keys::MESSAGE_CACHE).await? else {
                break;
            };
            match serde_json::from_str::<CachedMessage>(&raw) {
                Ok(msg) => out.push(msg),
                Err(e) => tracing::warn!("skipping malformed cached message: {}", e),
            }
        }
        Ok(out)
    }

    /// Return a failed batch to the head of the queue, preserving order.
    pub async fn requeue_messages(&self, msgs: &[CachedMessage]) -> Result<()> {
        for msg in msgs.iter().rev() {
            let raw = serde_json::to_string(msg)?;
            self.lpush(ATTEMPTS, keys::MESSAGE_CACHE, &raw).await?;
        }
        Ok(())
    }
}
