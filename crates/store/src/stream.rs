//! Per-gateway delivery streams.
//!
//! One stream per gateway id carries serialized `PushMessage` envelopes
//! from Send to that gateway. Gateways read through a consumer group so a
//! restart resumes from the last acknowledged offset; acknowledgements are
//! batched by [`AckBatcher`].

use crate::error::Result;
use crate::keys;
use crate::redis::Store;
use common::PushMessage;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Ack ids buffered before the batcher drops new ones.
pub const ACK_CHANNEL_SIZE: usize = 10_000;
/// Flush the ack batch when it reaches this many ids.
const ACK_BATCH_MAX: usize = 1024;

/// One entry pulled from a gateway stream. `message` is `None` when the
/// payload failed to parse; such entries are acked immediately so a
/// poison pill cannot loop.
#[derive(Debug)]
pub struct PulledEntry {
    pub entry_id: String,
    pub message: Option<PushMessage>,
}

impl Store {
    /// Append one envelope to a gateway's stream. Returns the entry id.
    pub async fn publish_push(&self, gateway_id: &str, msg: &PushMessage) -> Result<String> {
        let raw = serde_json::to_string(msg)?;
        let mut conn = self.connection().await?;
        let id: String = conn
            .xadd(keys::stream(gateway_id), "*", &[("data", raw.as_str())])
            .await?;
        Ok(id)
    }

    /// Create the stream + consumer group if missing; tolerates an
    /// already-existing group.
    pub async fn ensure_stream_group(&self, gateway_id: &str) -> Result<()> {
        let stream = keys::stream(gateway_id);
        let group = keys::stream_group(gateway_id);
        let mut last = None;
        for _ in 0..2 {
            match self.connection().await {
                Ok(mut conn) => {
                    match conn
                        .xgroup_create_mkstream::<_, _, _, ()>(&stream, &group, "0")
                        .await
                    {
                        Ok(()) => {
                            info!("stream {} group {} ready", stream, group);
                            return Ok(());
                        }
                        Err(e) if e.code() == Some("BUSYGROUP") => return Ok(()),
                        Err(e) => last = Some(e.into()),
                    }
                }
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(last.expect("at least one attempt"))
    }

    /// Blocking consumer-group read on a dedicated connection.
    /// `block_ms = 0` blocks until data arrives or the future is dropped.
    pub async fn read_push_batch(
        &self,
        conn: &mut MultiplexedConnection,
        gateway_id: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<PulledEntry>> {
        let stream = keys::stream(gateway_id);
        let group = keys::stream_group(gateway_id);
        let opts = StreamReadOptions::default()
            .group(&group, consumer)
            .count(count)
            .block(block_ms);

        let reply: StreamReadReply = conn.xread_options(&[&stream], &[">"], &opts).await?;

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let message = entry
                    .map
                    .get("data")
                    .and_then(|v| redis::from_redis_value::<String>(v).ok())
                    .and_then(|raw| match serde_json::from_str::<PushMessage>(&raw) {
                        Ok(msg) => Some(msg),
                        Err(e) => {
                            warn!("unparseable stream entry {}: {}", entry.id, e);
                            None
                        }
                    });
                out.push(PulledEntry {
                    entry_id: entry.id,
                    message,
                });
            }
        }
        Ok(out)
    }

    pub async fn ack_entries(
        &self,
        attempts: usize,
        gateway_id: &str,
        entry_ids: &[String],
    ) -> Result<()> {
        if entry_ids.is_empty() {
            return Ok(());
        }
        let stream = keys::stream(gateway_id);
        let group = keys::stream_group(gateway_id);
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match self.connection().await {
                Ok(mut conn) => match conn.xack::<_, _, _, i64>(&stream, &group, entry_ids).await {
                    Ok(_) => return Ok(()),
                    Err(e) => last = Some(e.into()),
                },
                Err(e) => last = Some(e),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(last.expect("at least one attempt"))
    }
}

/// Coalesces stream acknowledgements: ids arrive on a bounded channel and
/// are XACKed every `interval` or once 1024 accumulate, whichever comes
/// first. Remaining ids are flushed on shutdown.
pub struct AckBatcher {
    store: Store,
    gateway_id: String,
    rx: mpsc::Receiver<String>,
    interval: Duration,
}

impl AckBatcher {
    pub fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(ACK_CHANNEL_SIZE)
    }

    pub fn new(
        store: Store,
        gateway_id: impl Into<String>,
        rx: mpsc::Receiver<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            gateway_id: gateway_id.into(),
            rx,
            interval,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut batch: Vec<String> = Vec::with_capacity(ACK_BATCH_MAX);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // drain whatever is still queued, then flush
                    while let Ok(id) = self.rx.try_recv() {
                        batch.push(id);
                    }
                    self.flush(&mut batch).await;
                    info!("ack batcher exiting");
                    return;
                }
                id = self.rx.recv() => {
                    match id {
                        Some(id) => {
                            batch.push(id);
                            if batch.len() >= ACK_BATCH_MAX {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<String>) {
        if batch.is_empty() {
            return;
        }
        if let Err(e) = self.store.ack_entries(3, &self.gateway_id, batch).await {
            warn!("failed to ack {} stream entries: {}", batch.len(), e);
        } else {
            metrics::counter!("stream_entries_acked_total").increment(batch.len() as u64);
        }
        batch.clear();
    }
}

/// Enqueue an ack id without blocking; drops (with a warning) when the
/// batcher is saturated. Redelivery after a restart covers the loss.
pub fn offer_ack(tx: &mpsc::Sender<String>, entry_id: String) {
    if let Err(e) = tx.try_send(entry_id) {
        warn!("ack buffer full, dropping entry id: {}", e);
    }
}
