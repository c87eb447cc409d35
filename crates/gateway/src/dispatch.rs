//! Local fan-out: stream-pulled messages to this gateway's holders.
//!
//! Workers consume the puller's task channel. Per target: a short-deadline
//! enqueue; `NoConn` settles the target and pushes the message back to a
//! Send instance, any other failure parks it on the wait list for the
//! scanner to retry. Targets left on the wait list keep their stream entry
//! unacked, so a crash before delivery redelivers them.

use crate::connection::ConnectionManager;
use crate::pending::PendingCounts;
use crate::pushback::PushbackClient;
use common::{ClientMessage, DeliveryError, PushMessage};
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use store::Store;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Deadline for a non-blocking enqueue on the dispatch path.
const ENQUEUE_WAIT: Duration = Duration::from_millis(100);
/// Idle sleep when the wait set is empty.
const WAIT_SCAN_IDLE: Duration = Duration::from_secs(1);

pub struct LocalDispatcher {
    manager: ConnectionManager,
    pending: Arc<PendingCounts>,
    store: Store,
    pushback: Arc<PushbackClient>,
    /// Users with parked messages awaiting a writer-queue slot.
    wait_set: Arc<DashMap<i64, ()>>,
}

impl LocalDispatcher {
    pub fn new(
        manager: ConnectionManager,
        pending: Arc<PendingCounts>,
        store: Store,
        pushback: Arc<PushbackClient>,
    ) -> Self {
        Self {
            manager,
            pending,
            store,
            pushback,
            wait_set: Arc::new(DashMap::new()),
        }
    }

    /// Spawn `workers` tasks consuming the puller's channel.
    pub fn spawn_workers(
        self: Arc<Self>,
        workers: usize,
        task_rx: mpsc::Receiver<PushMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let task_rx = Arc::new(Mutex::new(task_rx));
        (0..workers.max(1))
            .map(|_| {
                let dispatcher = self.clone();
                let task_rx = task_rx.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let msg = {
                            let mut rx = task_rx.lock().await;
                            tokio::select! {
                                _ = shutdown.changed() => return,
                                msg = rx.recv() => msg,
                            }
                        };
                        let Some(msg) = msg else { return };
                        dispatcher.dispatch(msg).await;
                    }
                })
            })
            .collect()
    }

    /// Deliver one stream message to its local targets.
    async fn dispatch(&self, msg: PushMessage) {
        let client = ClientMessage::from(&msg);
        debug!(
            "dispatching message {} to {} local targets",
            msg.id,
            msg.target_ids.len()
        );
        for &user_id in &msg.target_ids {
            match self
                .manager
                .enqueue(user_id, ENQUEUE_WAIT, client.clone())
                .await
            {
                Ok(()) => {}
                Err(DeliveryError::NoConn) => {
                    // route was stale; hand the copy back for the offline
                    // list and settle the target
                    counter!("gateway_dispatch_no_conn_total").increment(1);
                    self.pending.done(msg.id);
                    if let Err(e) = self.pushback.push_back(user_id, &client).await {
                        error!("pushback for user {} failed: {}", user_id, e);
                    }
                }
                Err(e) => {
                    debug!("enqueue for user {} congested: {}", user_id, e);
                    counter!("gateway_dispatch_waitlisted_total").increment(1);
                    self.insert_wait(user_id, &client).await;
                }
            }
        }
    }

    /// Park a message on the user's wait list. Not settled in the pending
    /// counter: the unacked stream entry redelivers it if this gateway
    /// dies before the scanner gets there.
    async fn insert_wait(&self, user_id: i64, msg: &ClientMessage) {
        self.wait_set.insert(user_id, ());
        let raw = match serde_json::to_string(msg) {
            Ok(raw) => raw,
            Err(e) => {
                error!("failed to serialize wait message {}: {}", msg.id, e);
                return;
            }
        };
        if let Err(e) = self.store.push_wait(user_id, &raw).await {
            error!(
                "failed to park message {} for user {}: {}",
                msg.id, user_id, e
            );
        }
    }

    /// Long-lived scanner: one pop per waiting user per cycle; a failed
    /// enqueue pushes the item back and ends the cycle (broad congestion
    /// signal). Users with empty wait lists are purged from the set.
    pub async fn run_wait_scanner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("wait-queue scanner started");
        loop {
            if *shutdown.borrow() {
                info!("wait-queue scanner exiting");
                return;
            }
            if self.wait_set.is_empty() {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("wait-queue scanner exiting");
                        return;
                    }
                    _ = tokio::time::sleep(WAIT_SCAN_IDLE) => {}
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
                    Err(e) => {
                        warn!("dropping malformed wait entry for user {}: {}", user_id, e);
                        continue;
                    }
                };
                match self.manager.enqueue(user_id, ENQUEUE_WAIT, msg).await {
                    Ok(()) => {
                        counter!("gateway_wait_delivered_total").increment(1);
                        match self.store.wait_len(user_id).await {
                            Ok(0) => {
                                self.wait_set.remove(&user_id);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("wait len for user {} failed: {}", user_id, e),
                        }
                    }
                    Err(_) => {
                        if let Err(e) = self.store.push_wait(user_id, &raw).await {
                            error!(
                                "failed to return wait entry for user {}: {}",
                                user_id, e
                            );
                        }
                        congested = true;
                        break;
                    }
                }
            }
            if congested {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(WAIT_SCAN_IDLE) => {}
                }
            }
        }
    }
}
