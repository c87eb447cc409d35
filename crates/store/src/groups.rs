//! Group-membership cache reads and dirty bookkeeping.
//!
//! Membership lives in per-room and per-user sets owned by the chat-room
//! metadata service; this side only reads them (recipient resolution,
//! write-back) and maintains key lifetimes: dirty keys are kept
//! persistent until the flusher writes them back, clean keys carry a
//! sliding TTL refreshed on access.

use crate::error::Result;
use crate::keys;
use crate::redis::Store;
use std::time::Duration;

const ATTEMPTS: usize = 3;

/// Sliding TTL applied to clean membership keys on access.
pub const GROUP_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

fn parse_ids(raw: Vec<String>) -> Vec<i64> {
    raw.iter().filter_map(|s| s.parse::<i64>().ok()).collect()
}

impl Store {
    pub async fn room_member_ids(&self, room_id: i64) -> Result<Vec<i64>> {
        let gkey = keys::group_members(room_id);
        let members = self.smembers(ATTEMPTS, &gkey).await?;
        self.touch_cache_key(&gkey, keys::GROUPS_DIRTY, &room_id.to_string())
            .await;
        Ok(parse_ids(members))
    }

    pub async fn user_joined_rooms(&self, user_id: i64) -> Result<Vec<i64>> {
        let ukey = keys::user_joined(user_id);
        let rooms = self.smembers(ATTEMPTS, &ukey).await?;
        self.touch_cache_key(&ukey, keys::USERS_DIRTY, &user_id.to_string())
            .await;
        Ok(parse_ids(rooms))
    }

    /// Dirty keys stay persistent; clean keys get the sliding TTL.
    async fn touch_cache_key(&self, key: &str, dirty_set: &str, member: &str) {
        match self.zscore(1, dirty_set, member).await {
            Ok(Some(_)) => {
                let _ = self.persist(1, key).await;
            }
            _ => {
                let _ = self.expire(1, key, GROUP_CACHE_TTL).await;
            }
        }
    }

    // ========================================================================
    // Dirty sets (consumed by the flusher)
    // ========================================================================

    /// Up to `n` oldest dirty room ids. Does not remove them; the caller
    /// clears each mark after a successful write-back.
    pub async fn dirty_group_ids(&self, n: usize) -> Result<Vec<i64>> {
        let raw = self
            .zrange(ATTEMPTS, keys::GROUPS_DIRTY, 0, n as isize - 1)
            .await?;
        Ok(parse_ids(raw))
    }

    pub async fn dirty_user_ids(&self, n: usize) -> Result<Vec<i64>> {
        let raw = self
            .zrange(ATTEMPTS, keys::USERS_DIRTY, 0, n as isize - 1)
            .await?;
        Ok(parse_ids(raw))
    }

    /// Dirty room ids whose first mutation is at or before `cutoff_secs`
    /// (unix seconds).
    pub async fn stale_dirty_group_ids(&self, cutoff_secs: i64) -> Result<Vec<i64>> {
        let raw = self
            .zrange_by_score_upto(ATTEMPTS, keys::GROUPS_DIRTY, cutoff_secs as f64)
            .await?;
        Ok(parse_ids(raw))
    }

    pub async fn stale_dirty_user_ids(&self, cutoff_secs: i64) -> Result<Vec<i64>> {
        let raw = self
            .zrange_by_score_upto(ATTEMPTS, keys::USERS_DIRTY, cutoff_secs as f64)
            .await?;
        Ok(parse_ids(raw))
    }

    /// Clear a room's dirty mark and start the post-flush TTL on its key.
    pub async fn clear_dirty_group(&self, room_id: i64, post_flush_ttl: Duration) -> Result<()> {
        self.zrem(ATTEMPTS, keys::GROUPS_DIRTY, &room_id.to_string())
            .await?;
        let _ = self
            .expire(1, &keys::group_members(room_id), post_flush_ttl)
            .await;
        Ok(())
    }

    pub async fn clear_dirty_user(&self, user_id: i64, post_flush_ttl: Duration) -> Result<()> {
        self.zrem(ATTEMPTS, keys::USERS_DIRTY, &user_id.to_string())
            .await?;
        let _ = self
            .expire(1, &keys::user_joined(user_id), post_flush_ttl)
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ids_skips_non_numeric_members() {
        let raw = vec![
            "17".to_string(),
            "".to_string(),
            "not-an-id".to_string(),
            "-3".to_string(),
        ];
        assert_eq!(parse_ids(raw), vec![17, -3]);
    }
}
