//! Chat-message flusher.
//!
//! Drains the write-behind queue in batches and lands each batch as one
//! multi-row insert. A failed insert pushes the batch back to the head of
//! the queue so ordering is approximately preserved.

use crate::error::Result;
use common::config::FlusherConfig;
use metrics::counter;
use sqlx::{MySql, MySqlPool, QueryBuilder};
use store::{CachedMessage, Store};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct MessageFlusher {
    store: Store,
    pool: MySqlPool,
    cfg: FlusherConfig,
}

impl MessageFlusher {
    pub fn new(store: Store, pool: MySqlPool, cfg: FlusherConfig) -> Self {
        Self { store, pool, cfg }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("message flusher started");
        let mut ticker = tokio::time::interval(self.cfg.message_flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("message flusher exiting");
                    return;
                }
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }
    }

    async fn flush_once(&self) {
        let msgs = match self.store.drain_messages(self.cfg.message_batch_size).await {
            Ok(msgs) => msgs,
            Err(e) => {
                warn!("failed to drain message queue: {}", e);
                return;
            }
        };
        if msgs.is_empty() {
            return;
        }
        match self.insert_batch(&msgs).await {
            Ok(()) => {
                counter!("flusher_messages_flushed_total").increment(msgs.len() as u64);
                debug!("flushed {} chat messages", msgs.len());
            }
            Err(e) => {
                warn!(
                    "insert of {} messages failed ({}), requeueing",
                    msgs.len(),
                    e
                );
                if let Err(e) = self.store.requeue_messages(&msgs).await {
                    warn!("requeue failed, {} messages at risk: {}", msgs.len(), e);
                }
            }
        }
    }

    async fn insert_batch(&self, msgs: &[CachedMessage]) -> Result<()> {
        let mut qb: QueryBuilder<MySql> = QueryBuilder::new(
            "INSERT INTO chat_messages (id, room_id, sender_id, type, content, created_at) ",
        );
        qb.push_values(msgs.iter(), |mut row, msg| {
            row.push_bind(msg.id)
                .push_bind(msg.room_id)
                .push_bind(msg.sender_id)
                .push_bind(&msg.msg_type)
                .push_bind(msg.content.to_string())
                .push_bind(msg.created_at);
        });
        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}
