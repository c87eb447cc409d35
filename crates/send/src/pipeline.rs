//! Offline and wait pipelines.
//!
//! Messages for absent recipients go to the per-user offline list and are
//! replayed in batches when the user reconnects; messages for congested
//! recipients go to the wait list. When the store itself is down, inserts
//! fall back to bounded in-process buffers that a recovery sweep replays
//! once the store answers again.

use async_trait::async_trait;
use common::envelope::{MSG_TYPE_BATCH, MSG_TYPE_INFO};
use common::{ClientMessage, DeliveryError, PushMessage};
use dashmap::DashMap;
use metrics::counter;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Per-user capacity of the in-process fallback buffers.
const LOCAL_BUFFER_CAP: usize = 100;
/// Offline messages bundled into one `batch` envelope.
const REPLAY_BATCH: usize = 50;
/// Recovery sweep cadence while local buffers are non-empty.
const RECOVERY_INTERVAL: Duration = Duration::from_secs(5);
/// Budget for delivering one replayed batch.
const REPLAY_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Delivers one envelope to one user; the concrete impl decides how
/// (publish to the user's gateway stream, or write to a local holder).
#[async_trait]
pub trait UserSink: Send + Sync + 'static {
    async fn deliver(&self, user_id: i64, msg: ClientMessage)
        -> std::result::Result<(), DeliveryError>;
}

pub struct OfflinePipeline {
    store: Store,
    local_offline: DashMap<i64, VecDeque<String>>,
    local_wait: DashMap<i64, VecDeque<String>>,
    wait_set: DashMap<i64, ()>,
}

impl OfflinePipeline {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            local_offline: DashMap::new(),
            local_wait: DashMap::new(),
            wait_set: DashMap::new(),
        }
    }

    /// Queue a message for an absent recipient. Store failure diverts to
    /// the in-process buffer so the acceptance is not lost.
    pub async fn insert_offline(&self, user_id: i64, msg: &ClientMessage) {
        let raw = match serde_json::to_string(msg) {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to serialize offline message {}: {}", msg.id, e);
                return;
            }
        };
        self.insert_offline_raw(user_id, raw).await;
    }

    pub async fn insert_offline_raw(&self, user_id: i64, raw: String) {
        counter!("send_offline_queued_total").increment(1);
        if let Err(e) = self.store.push_offline(user_id, &raw).await {
            warn!(
                "offline push for user {} failed, buffering locally: {}",
                user_id, e
            );
            buffer_local(&self.local_offline, user_id, raw);
        }
    }

    /// Queue a message for a congested recipient and mark the user for
    /// the wait scanner.
    pub async fn insert_wait(&self, user_id: i64, msg: &ClientMessage) {
        let raw = match serde_json::to_string(msg) {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to serialize wait message {}: {}", msg.id, e);
                return;
            }
        };
        self.wait_set.insert(user_id, ());
        counter!("send_wait_queued_total").increment(1);
        if let Err(e) = self.store.push_wait(user_id, &raw).await {
            warn!(
                "wait push for user {} failed, buffering locally: {}",
                user_id, e
            );
            buffer_local(&self.local_wait, user_id, raw);
        }
    }

    /// Drain the user's offline list in batches of 50, delivering each
    /// batch as one synthetic `batch` envelope. A failed delivery pushes
    /// the batch back and aborts the replay.
    pub async fn replay_offline(&self, user_id: i64, sink: &dyn UserSink) {
        let total = match self.offline_len_with_retry(user_id).await {
            Some(total) => total,
            None => return,
        };
        if total == 0 {
            return;
        }
        debug!("replaying {} offline messages for user {}", total, user_id);

        let mut batch: Vec<ClientMessage> = Vec::with_capacity(REPLAY_BATCH);
        for _ in 0..total {
            if batch.len() >= REPLAY_BATCH {
                if self.deliver_batch(user_id, &mut batch, sink).await.is_err() {
                    return;
                }
            }
            match self.store.pop_offline(user_id).await {
                Ok(Some(raw)) => match serde_json::from_str::<ClientMessage>(&raw) {
                    Ok(msg) => batch.push(msg),
                    Err(e) => {
                        warn!("skipping malformed offline entry for user {}: {}", user_id, e);
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!("offline pop for user {} failed: {}", user_id, e);
                    // tell the client something is waiting that we could
                    // not fetch
                    let notice = ClientMessage::synthetic(
                        MSG_TYPE_INFO,
                        json!("You have offline messages but they could not be retrieved."),
                    );
                    if let Err(e) = sink.deliver(user_id, notice).await {
                        warn!("offline notice for user {} failed: {}", user_id, e);
                    }
                    break;
                }
            }
        }
        if !batch.is_empty() {
            let _ = self.deliver_batch(user_id, &mut batch, sink).await;
        }
    }

    async fn deliver_batch(
        &self,
        user_id: i64,
        batch: &mut Vec<ClientMessage>,
        sink: &dyn UserSink,
    ) -> std::result::Result<(), DeliveryError> {
        let payload = Value::Array(
            batch
                .iter()
                .map(|msg| serde_json::to_value(msg).unwrap_or(Value::Null))
                .collect(),
        );
        let envelope = ClientMessage::synthetic(MSG_TYPE_BATCH, payload);
        match sink.deliver(user_id, envelope).await {
            Ok(()) => {
                counter!("send_offline_replayed_total").increment(batch.len() as u64);
                batch.clear();
                Ok(())
            }
            Err(e) => {
                warn!(
                    "offline batch for user {} failed ({}), pushing {} entries back",
                    user_id,
                    e,
                    batch.len()
                );
                for msg in batch.iter() {
                    if let Ok(raw) = serde_json::to_string(msg) {
                        if let Err(e) = self.store.push_offline(user_id, &raw).await {
                            error!(
                                "failed to return offline message {} for user {}: {}",
                                msg.id, user_id, e
                            );
                        }
                    }
                }
                batch.clear();
                Err(e)
            }
        }
    }

    async fn offline_len_with_retry(&self, user_id: i64) -> Option<i64> {
        match self.store.offline_len(user_id).await {
            Ok(len) => Some(len),
            Err(e) => {
                warn!("offline len for user {} failed: {}, retrying", user_id, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                match self.store.offline_len(user_id).await {
                    Ok(len) => Some(len),
                    Err(e) => {
                        error!("offline len for user {} failed again: {}", user_id, e);
                        None
                    }
                }
            }
        }
    }

    /// Periodically replay the local fallback buffers into the store.
    /// The first failed push per user ends that user's drain for this
    /// cycle (the store is likely still down).
    pub async fn run_recovery_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("recovery sweep exiting");
                    return;
                }
                _ = tokio::time::sleep(RECOVERY_INTERVAL) => {}
            }
            self.drain_local(&self.local_offline, true).await;
            self.drain_local(&self.local_wait, false).await;
        }
    }

    async fn drain_local(&self, buffers: &DashMap<i64, VecDeque<String>>, offline: bool) {
        let users: Vec<i64> = buffers.iter().map(|e| *e.key()).collect();
        for user_id in users {
            loop {
                let raw = match buffers.get_mut(&user_id) {
                    Some(mut queue) => match queue.pop_front() {
                        Some(raw) => raw,
                        None => {
                            drop(queue);
                            buffers.remove_if(&user_id, |_, q| q.is_empty());
                            break;
                        }
                    },
                    None => break,
                };
                let result = if offline {
                    self.store.push_offline(user_id, &raw).await
                } else {
                    self.store.push_wait(user_id, &raw).await
                };
                if let Err(e) = result {
                    debug!("recovery push for user {} still failing: {}", user_id, e);
                    if let Some(mut queue) = buffers.get_mut(&user_id) {
                        queue.push_front(raw);
                    }
                    break;
                }
                counter!("send_local_buffer_recovered_total").increment(1);
            }
        }
    }

    /// Buffered entries awaiting store recovery (both pipelines).
    pub fn local_backlog(&self) -> usize {
        let offline: usize = self.local_offline.iter().map(|e| e.len()).sum();
        let wait: usize = self.local_wait.iter().map(|e| e.len()).sum();
        offline + wait
    }

    /// Wait scanner for the colocated deployment: pop one parked message
    /// per waiting user per cycle and retry the local enqueue.
    pub async fn run_wait_scanner(
        self: Arc<Self>,
        manager: gateway::ConnectionManager,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("wait-queue scanner started");
        loop {
            if *shutdown.borrow() {
                info!("wait-queue scanner exiting");
                return;
            }
            if self.wait_set.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
            let users: Vec<i64> = self.wait_set.iter().map(|e| *e.key()).collect();
            let mut congested = false;
            for user_id in users {
                if *shutdown.borrow() {
                    return;
                }
                let raw = match self.store.pop_wait(user_id).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => {
                        self.wait_set.remove(&user_id);
                        continue;
                    }
                    Err(e) => {
                        warn!("wait pop for user {} failed: {}", user_id, e);
                        continue;
                    }
                };
                let msg = match serde_json::from_str::<ClientMessage>(&raw) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                match manager
                    .enqueue(user_id, Duration::from_millis(100), msg)
                    .await
                {
                    Ok(()) => {
                        if matches!(self.store.wait_len(user_id).await, Ok(0)) {
                            self.wait_set.remove(&user_id);
                        }
                    }
                    Err(_) => {
                        if let Err(e) = self.store.push_wait(user_id, &raw).await {
                            error!("failed to return wait entry for user {}: {}", user_id, e);
                        }
                        congested = true;
                        break;
                    }
                }
            }
            if congested {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
}

fn buffer_local(buffers: &DashMap<i64, VecDeque<String>>, user_id: i64, raw: String) {
    let mut queue = buffers.entry(user_id).or_default();
    if queue.len() >= LOCAL_BUFFER_CAP {
        error!(
            "local fallback buffer full for user {}, dropping message",
            user_id
        );
        return;
    }
    queue.push_back(raw);
}

/// Delivers through the recipient's gateway stream (decoupled mode).
pub struct GatewayRoutedSender {
    route: Arc<dyn crate::route::RouteLookup>,
    sink: Arc<dyn crate::dispatcher::GatewaySink>,
}

impl GatewayRoutedSender {
    pub fn new(
        route: Arc<dyn crate::route::RouteLookup>,
        sink: Arc<dyn crate::dispatcher::GatewaySink>,
    ) -> Self {
        Self { route, sink }
    }
}

#[async_trait]
impl UserSink for GatewayRoutedSender {
    async fn deliver(
        &self,
        user_id: i64,
        msg: ClientMessage,
    ) -> std::result::Result<(), DeliveryError> {
        let route = self
            .route
            .single(user_id)
            .await
            .map_err(|e| DeliveryError::StoreUnavailable(e.to_string()))?
            .ok_or(DeliveryError::RouteMiss)?;
        let envelope = PushMessage {
            id: msg.id,
            msg_type: msg.msg_type,
            room_id: msg.room_id,
            sender_id: msg.sender_id,
            target_ids: vec![user_id],
            payload: msg.payload,
        };
        self.sink
            .publish(&route.gateway_id, &envelope)
            .await
            .map_err(|e| DeliveryError::StoreUnavailable(e.to_string()))
    }
}

/// Writes straight to a local holder (standalone mode), with one quick
/// retry; a failing connection is torn down.
pub struct LocalSender {
    manager: gateway::ConnectionManager,
}

impl LocalSender {
    pub fn new(manager: gateway::ConnectionManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl UserSink for LocalSender {
    async fn deliver(
        &self,
        user_id: i64,
        msg: ClientMessage,
    ) -> std::result::Result<(), DeliveryError> {
        match self
            .manager
            .write_blocking(user_id, REPLAY_WRITE_WAIT, msg.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(DeliveryError::NoConn) => Err(DeliveryError::NoConn),
            Err(first) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                match self
                    .manager
                    .write_blocking(user_id, REPLAY_WRITE_WAIT, msg)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(DeliveryError::NoConn) => Err(DeliveryError::NoConn),
                    Err(_) => {
                        let _ = self.manager.remove(user_id).await;
                        Err(first)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn local_buffer_caps_per_user() {
        let buffers: DashMap<i64, VecDeque<String>> = DashMap::new();
        for n in 0..(LOCAL_BUFFER_CAP + 10) {
            buffer_local(&buffers, 1, format!("m{n}"));
        }
        assert_eq!(buffers.get(&1).unwrap().len(), LOCAL_BUFFER_CAP);
        assert_eq!(buffers.get(&1).unwrap().front().unwrap(), "m0");
    }

    /// Minimal RESP responder: records every byte it receives and answers
    /// `+OK` per complete command array, which is enough for RPUSH (the
    /// callers decode replies as `()`).
    async fn run_fake_store(listener: TcpListener, seen: Arc<StdMutex<Vec<u8>>>) {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut acc: Vec<u8> = Vec::new();
                let mut replied = 0usize;
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            acc.extend_from_slice(&buf[..n]);
                            seen.lock().unwrap().extend_from_slice(&buf[..n]);
                            // count complete `*N\r` array headers seen so far
                            let commands = acc
                                .split(|b| *b == b'\n')
                                .filter(|line| {
                                    line.first() == Some(&b'*') && line.last() == Some(&b'\r')
                                })
                                .count();
                            while replied < commands {
                                if socket.write_all(b"+OK\r\n").await.is_err() {
                                    return;
                                }
                                replied += 1;
                            }
                        }
                    }
                }
            });
        }
    }

    #[tokio::test]
    async fn store_outage_buffers_locally_and_recovery_replays() {
        // grab a free port, then leave it closed: the store is "down"
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let store = Store::connect(&format!("redis://{addr}")).unwrap();
        let pipeline = OfflinePipeline::new(store);

        pipeline
            .insert_offline_raw(7, "offline-message-1".to_string())
            .await;
        assert_eq!(pipeline.local_backlog(), 1);

        // store recovers on the same port
        let listener = TcpListener::bind(addr).await.unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let server = tokio::spawn(run_fake_store(listener, seen.clone()));

        pipeline.drain_local(&pipeline.local_offline, true).await;

        assert_eq!(pipeline.local_backlog(), 0);
        let received = String::from_utf8_lossy(&seen.lock().unwrap()).to_string();
        assert!(received.contains("RPUSH"), "store never saw the replay");
        assert!(received.contains("offline:push:7"));
        assert!(received.contains("offline-message-1"));
        server.abort();
    }
}
