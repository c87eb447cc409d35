//! Stream pull loop: the single task that reads this gateway's stream.
//!
//! Pulls are gated by two conditions: the task channel must be under 80%
//! full and the outstanding-work counter under its threshold. Writer
//! progress nudges the gate open again. Entries that fail to parse are
//! acked immediately so a poison pill cannot loop forever.

use crate::connection::ConnectionManager;
use crate::pending::PendingCounts;
use common::PushMessage;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use store::{stream::offer_ack, Store};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Max entries per blocking read.
const PULL_BATCH: usize = 100;

pub struct StreamPuller {
    store: Store,
    gateway_id: String,
    manager: ConnectionManager,
    pending: Arc<PendingCounts>,
    ack_tx: mpsc::Sender<String>,
    task_tx: mpsc::Sender<PushMessage>,
    task_capacity: usize,
    pending_threshold: i64,
}

impl StreamPuller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        gateway_id: impl Into<String>,
        manager: ConnectionManager,
        pending: Arc<PendingCounts>,
        ack_tx: mpsc::Sender<String>,
        task_tx: mpsc::Sender<PushMessage>,
        task_capacity: usize,
        pending_threshold: i64,
    ) -> Self {
        Self {
            store,
            gateway_id: gateway_id.into(),
            manager,
            pending,
            ack_tx,
            task_tx,
            task_capacity,
            pending_threshold,
        }
    }

    /// Run until shutdown. Exits promptly: the blocking read future is
    /// dropped when the signal fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let consumer = self.gateway_id.clone();
        let mut conn = loop {
            match self.store.dedicated_connection().await {
                Ok(conn) => break conn,
                Err(e) => {
                    error!("puller cannot reach store: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        };
        info!("stream puller started for {}", self.gateway_id);

        loop {
            // back-pressure gates
            loop {
                let channel_ok = self.task_tx.capacity() > self.task_capacity / 5;
                let pending_ok = self.manager.outstanding() < self.pending_threshold;
                if channel_ok && pending_ok {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("stream puller exiting");
                        return;
                    }
                    _ = self.manager.notify_drained() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }

            let entries = tokio::select! {
                _ = shutdown.changed() => {
                    info!("stream puller exiting");
                    return;
                }
                res = self.store.read_push_batch(
                    &mut conn,
                    &self.gateway_id,
                    &consumer,
                    PULL_BATCH,
                    0,
                ) => match res {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!("stream read failed: {}", e);
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                        continue;
                    }
                },
            };

            for entry in entries {
                match entry.message {
                    None => {
                        // poison entry: treat as delivered
                        warn!("acking unparseable entry {}", entry.entry_id);
                        offer_ack(&self.ack_tx, entry.entry_id);
                    }
                    Some(msg) if msg.target_ids.is_empty() => {
                        offer_ack(&self.ack_tx, entry.entry_id);
                    }
                    Some(msg) => {
                        counter!("gateway_stream_entries_pulled_total").increment(1);
                        self.pending
                            .track(msg.id, msg.target_ids.len() as i32, entry.entry_id);
                        if self.task_tx.send(msg).await.is_err() {
                            warn!("task channel closed, stream puller exiting");
                            return;
                        }
                    }
                }
            }
        }
    }
}
