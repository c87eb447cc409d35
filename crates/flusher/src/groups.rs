//! Group-membership flusher.
//!
//! Each tick: drop dirty entries older than the retention window (after a
//! best-effort write-back), then flush up to a batch of dirty rooms and
//! dirty users. A room flush replaces the member table contents inside
//! one transaction; a user flush rewrites the comma-delimited
//! joined-rooms column. Dirty marks clear only after a successful write,
//! at which point the cache key gets the short post-flush TTL.

use crate::error::Result;
use chrono::Utc;
use common::config::FlusherConfig;
use metrics::counter;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use store::Store;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct GroupFlusher {
    store: Store,
    pool: MySqlPool,
    cfg: FlusherConfig,
}

impl GroupFlusher {
    pub fn new(store: Store, pool: MySqlPool, cfg: FlusherConfig) -> Self {
        Self { store, pool, cfg }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("group flusher started");
        let mut ticker = tokio::time::interval(self.cfg.group_flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("group flusher exiting");
                    return;
                }
                _ = ticker.tick() => {
                    self.clean_stale_dirty().await;
                    self.flush_dirty_groups().await;
                    self.flush_dirty_users().await;
                }
            }
        }
    }

    /// Write back and drop dirty entries past the retention window so the
    /// dirty sets cannot grow without bound.
    async fn clean_stale_dirty(&self) {
        let cutoff = Utc::now().timestamp() - self.cfg.dirty_retention.as_secs() as i64;

        match self.store.stale_dirty_group_ids(cutoff).await {
            Ok(room_ids) => {
                for room_id in room_ids {
                    match self.write_back_group(room_id).await {
                        Ok(()) => {
                            if let Err(e) = self
                                .store
                                .clear_dirty_group(room_id, self.cfg.post_flush_ttl)
                                .await
                            {
                                warn!("failed to clear stale dirty room {}: {}", room_id, e);
                            }
                        }
                        Err(e) => warn!("stale write-back for room {} failed: {}", room_id, e),
                    }
                }
            }
            Err(e) => warn!("failed to fetch stale dirty rooms: {}", e),
        }

        match self.store.stale_dirty_user_ids(cutoff).await {
            Ok(user_ids) => {
                for user_id in user_ids {
                    match self.write_back_user(user_id).await {
                        Ok(()) => {
                            if let Err(e) = self
                                .store
                                .clear_dirty_user(user_id, self.cfg.post_flush_ttl)
                                .await
                            {
                                warn!("failed to clear stale dirty user {}: {}", user_id, e);
                            }
                        }
                        Err(e) => warn!("stale write-back for user {} failed: {}", user_id, e),
                    }
                }
            }
            Err(e) => warn!("failed to fetch stale dirty users: {}", e),
        }
    }

    async fn flush_dirty_groups(&self) {
        let room_ids = match self.store.dirty_group_ids(self.cfg.group_batch_size).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("failed to fetch dirty rooms: {}", e);
                return;
            }
        };
        for room_id in room_ids {
            match self.write_back_group(room_id).await {
                Ok(()) => {
                    counter!("flusher_groups_flushed_total").increment(1);
                    if let Err(e) = self
                        .store
                        .clear_dirty_group(room_id, self.cfg.post_flush_ttl)
                        .await
                    {
                        warn!("failed to clear dirty mark for room {}: {}", room_id, e);
                    }
                }
                Err(e) => warn!("flush for room {} failed: {}", room_id, e),
            }
        }
    }

    async fn flush_dirty_users(&self) {
        let user_ids = match self.store.dirty_user_ids(self.cfg.group_batch_size).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("failed to fetch dirty users: {}", e);
                return;
            }
        };
        for user_id in user_ids {
            match self.write_back_user(user_id).await {
                Ok(()) => {
                    counter!("flusher_users_flushed_total").increment(1);
                    if let Err(e) = self
                        .store
                        .clear_dirty_user(user_id, self.cfg.post_flush_ttl)
                        .await
                    {
                        warn!("failed to clear dirty mark for user {}: {}", user_id, e);
                    }
                }
                Err(e) => warn!("flush for user {} failed: {}", user_id, e),
            }
        }
    }

    /// Replace the room's member rows with the cached set, atomically.
    async fn write_back_group(&self, room_id: i64) -> Result<()> {
        let members = match self.store.room_member_ids(room_id).await {
            Ok(members) => members,
            Err(e) => {
                // cache unreadable: leave the dirty mark for a later tick
                // rather than destructively overwriting the table
                warn!("cannot read cached members for room {}: {}", room_id, e);
                return Err(e.into());
            }
        };

        self.ensure_member_table(room_id).await?;
        let table = member_table_name(room_id);

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;
        if !members.is_empty() {
            let mut qb: QueryBuilder<MySql> =
                QueryBuilder::new(format!("INSERT INTO {table} (user_id) "));
            qb.push_values(members.iter(), |mut row, user_id| {
                row.push_bind(*user_id);
            });
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!("room {} membership written back", room_id);
        Ok(())
    }

    /// Rewrite the user's joined-rooms column from the cached set.
    async fn write_back_user(&self, user_id: i64) -> Result<()> {
        let rooms = match self.store.user_joined_rooms(user_id).await {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!("cannot read cached rooms for user {}: {}", user_id, e);
                return Err(e.into());
            }
        };
        let csv = joined_rooms_csv(&rooms);
        sqlx::query("UPDATE users SET joined_chatrooms = ? WHERE id = ?")
            .bind(csv)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        debug!("user {} joined rooms written back", user_id);
        Ok(())
    }

    async fn ensure_member_table(&self, room_id: i64) -> Result<()> {
        let table = member_table_name(room_id);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (user_id BIGINT NOT NULL)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn member_table_name(room_id: i64) -> String {
    format!("chat_room_members_room_{room_id}")
}

/// Trailing-comma CSV, matching the legacy column format.
fn joined_rooms_csv(rooms: &[i64]) -> String {
    if rooms.is_empty() {
        return String::new();
    }
    let mut csv = rooms
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(",");
    csv.push(',');
    csv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_table_names_are_per_room() {
        assert_eq!(member_table_name(42), "chat_room_members_room_42");
    }

    #[test]
    fn joined_rooms_csv_keeps_trailing_comma() {
        assert_eq!(joined_rooms_csv(&[]), "");
        assert_eq!(joined_rooms_csv(&[7]), "7,");
        assert_eq!(joined_rooms_csv(&[1, 2, 3]), "1,2,3,");
    }
}
