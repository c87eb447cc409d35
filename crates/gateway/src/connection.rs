//! Per-user connection ownership.
//!
//! Every online user has exactly one [`ConnectionManager`] holder on this
//! gateway: the socket's write half plus a bounded send queue consumed by
//! a single writer task, so all writes are serialized. Reconnects migrate
//! the old holder's buffered items to the head of the new queue; removal
//! drains them into the pushback pipeline so nothing accepted is lost.

use async_trait::async_trait;
use common::{ClientMessage, DeliveryError};
use dashmap::DashMap;
use metrics::gauge;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Write half of a client connection. Abstract so tests can observe
/// frames without a real socket.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_text(&mut self, text: String) -> std::result::Result<(), String>;
    async fn send_ping(&mut self) -> std::result::Result<(), String>;
    async fn close(&mut self);
}

/// Callbacks fired by the writer and teardown paths.
#[async_trait]
pub trait WriterHooks: Send + Sync + 'static {
    /// A tracked data frame left the send queue (delivery is considered
    /// dispatched from this gateway's point of view).
    fn message_done(&self, _msg_id: i64) {}

    /// A message left the queue without reaching the socket (write
    /// failure or holder teardown); divert it so it is not lost.
    async fn undeliverable(&self, _user_id: i64, _msg: ClientMessage) {}
}

/// Hooks that do nothing; used where no pending/pushback plumbing exists.
pub struct NoopHooks;

#[async_trait]
impl WriterHooks for NoopHooks {}

enum SendRequest {
    Frame {
        msg: ClientMessage,
        done: Option<oneshot::Sender<std::result::Result<(), DeliveryError>>>,
    },
    /// Control ping, written as a control frame rather than a data frame.
    Ping {
        done: oneshot::Sender<std::result::Result<(), DeliveryError>>,
    },
}

struct Holder {
    epoch: u64,
    tx: mpsc::Sender<SendRequest>,
    close_tx: watch::Sender<bool>,
    /// Writer hands its receiver back on exit so teardown can drain it.
    writer: Mutex<Option<JoinHandle<mpsc::Receiver<SendRequest>>>>,
}

struct ManagerInner {
    holders: DashMap<i64, Arc<Holder>>,
    buffer: usize,
    write_timeout: Duration,
    /// Requests accepted into queues but not yet consumed by a writer;
    /// gates stream pulls.
    outstanding: AtomicI64,
    drained: Notify,
    hooks: Arc<dyn WriterHooks>,
    epochs: AtomicU64,
}

/// Store of per-user connection holders. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(buffer: usize, write_timeout: Duration, hooks: Arc<dyn WriterHooks>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                holders: DashMap::new(),
                buffer: buffer.max(1),
                write_timeout,
                outstanding: AtomicI64::new(0),
                drained: Notify::new(),
                hooks,
                epochs: AtomicU64::new(0),
            }),
        }
    }

    /// Register a connection for `user_id`, replacing any existing holder.
    ///
    /// Buffered items of the old holder are carried into the head of the
    /// new queue, which is sized `buffer + drained` so the migration can
    /// never block. Returns the holder's epoch, used by the reader and
    /// heartbeat tasks to avoid tearing down a successor.
    pub async fn register(&self, user_id: i64, sink: Box<dyn FrameSink>) -> u64 {
        let drained = match self.inner.holders.remove(&user_id) {
            Some((_, old)) => {
                debug!("replacing existing holder for user {}", user_id);
                teardown(&old).await
            }
            None => Vec::new(),
        };

        let capacity = self.inner.buffer + drained.len();
        let (tx, rx) = mpsc::channel(capacity);
        // migrated items were already counted as outstanding
        for req in drained {
            let _ = tx.try_send(req);
        }

        let (close_tx, close_rx) = watch::channel(false);
        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let writer = tokio::spawn(writer_loop(
            self.inner.clone(),
            user_id,
            rx,
            sink,
            close_rx,
        ));

        self.inner.holders.insert(
            user_id,
            Arc::new(Holder {
                epoch,
                tx,
                close_tx,
                writer: Mutex::new(Some(writer)),
            }),
        );
        gauge!("gateway_active_connections").set(self.inner.holders.len() as f64);
        epoch
    }

    /// Place a message in the user's send queue before `deadline`,
    /// without waiting for the socket write.
    pub async fn enqueue(
        &self,
        user_id: i64,
        deadline: Duration,
        msg: ClientMessage,
    ) -> std::result::Result<(), DeliveryError> {
        let tx = {
            let holder = self
                .inner
                .holders
                .get(&user_id)
                .ok_or(DeliveryError::NoConn)?;
            holder.tx.clone()
        };
        match tokio::time::timeout(deadline, tx.send(SendRequest::Frame { msg, done: None })).await
        {
            Ok(Ok(())) => {
                self.inner.outstanding.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_)) => Err(DeliveryError::NoConn),
            Err(_) => Err(DeliveryError::EnqueueTimeout),
        }
    }

    /// Like [`enqueue`](Self::enqueue), but carries a completion channel
    /// and waits (bounded by `deadline`) for the writer's result.
    pub async fn write_blocking(
        &self,
        user_id: i64,
        deadline: Duration,
        msg: ClientMessage,
    ) -> std::result::Result<(), DeliveryError> {
        let (done_tx, done_rx) = oneshot::channel();
        let tx = {
            let holder = self
                .inner
                .holders
                .get(&user_id)
                .ok_or(DeliveryError::NoConn)?;
            holder.tx.clone()
        };
        let req = SendRequest::Frame {
            msg,
            done: Some(done_tx),
        };
        match tokio::time::timeout(deadline, tx.send(req)).await {
            Ok(Ok(())) => self.inner.outstanding.fetch_add(1, Ordering::Relaxed),
            Ok(Err(_)) => return Err(DeliveryError::NoConn),
            Err(_) => return Err(DeliveryError::EnqueueTimeout),
        };
        match tokio::time::timeout(deadline, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeliveryError::Write("writer exited".to_string())),
            Err(_) => Err(DeliveryError::EnqueueTimeout),
        }
    }

    /// Send a control ping through the writer queue.
    pub async fn ping(
        &self,
        user_id: i64,
        deadline: Duration,
    ) -> std::result::Result<(), DeliveryError> {
        let (done_tx, done_rx) = oneshot::channel();
        let tx = {
            let holder = self
                .inner
                .holders
                .get(&user_id)
                .ok_or(DeliveryError::NoConn)?;
            holder.tx.clone()
        };
        match tokio::time::timeout(deadline, tx.send(SendRequest::Ping { done: done_tx })).await {
            Ok(Ok(())) => self.inner.outstanding.fetch_add(1, Ordering::Relaxed),
            Ok(Err(_)) => return Err(DeliveryError::NoConn),
            Err(_) => return Err(DeliveryError::EnqueueTimeout),
        };
        match tokio::time::timeout(deadline, done_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeliveryError::Write("writer exited".to_string())),
            Err(_) => Err(DeliveryError::EnqueueTimeout),
        }
    }

    /// Tear down the user's holder: stop the writer, drain pending items
    /// into the hooks, close the socket.
    pub async fn remove(&self, user_id: i64) -> std::result::Result<(), DeliveryError> {
        let (_, holder) = self
            .inner
            .holders
            .remove(&user_id)
            .ok_or(DeliveryError::NoConn)?;
        self.finish_removal(user_id, &holder).await;
        Ok(())
    }

    /// Remove only if the current holder still belongs to `epoch`, so a
    /// stale reader or heartbeat task cannot destroy its successor.
    pub async fn remove_if(&self, user_id: i64, epoch: u64) {
        let removed = self
            .inner
            .holders
            .remove_if(&user_id, |_, holder| holder.epoch == epoch);
        if let Some((_, holder)) = removed {
            self.finish_removal(user_id, &holder).await;
        }
    }

    async fn finish_removal(&self, user_id: i64, holder: &Arc<Holder>) {
        let drained = teardown(holder).await;
        if !drained.is_empty() {
            self.inner
                .outstanding
                .fetch_sub(drained.len() as i64, Ordering::Relaxed);
            self.inner.drained.notify_waiters();
        }
        for req in drained {
            match req {
                SendRequest::Frame { msg, done } => {
                    if let Some(done) = done {
                        let _ = done.send(Err(DeliveryError::NoConn));
                    }
                    self.inner.hooks.message_done(msg.id);
                    self.inner.hooks.undeliverable(user_id, msg).await;
                }
                SendRequest::Ping { done } => {
                    let _ = done.send(Err(DeliveryError::NoConn));
                }
            }
        }
        gauge!("gateway_active_connections").set(self.inner.holders.len() as f64);
        info!("connection removed for user {}", user_id);
    }

    /// Epoch of the user's current holder, if any.
    pub fn epoch_of(&self, user_id: i64) -> Option<u64> {
        self.inner.holders.get(&user_id).map(|h| h.epoch)
    }

    pub fn is_connected(&self, user_id: i64) -> bool {
        self.inner.holders.contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.holders.len()
    }

    /// Requests accepted but not yet consumed by any writer.
    pub fn outstanding(&self) -> i64 {
        self.inner.outstanding.load(Ordering::Relaxed)
    }

    /// Resolves the next time a writer consumes work or a teardown frees
    /// queued items; used to re-evaluate the stream pull gate.
    pub async fn notify_drained(&self) {
        self.inner.drained.notified().await;
    }
}

/// Signal the writer to stop, wait for it, and collect whatever was left
/// in its queue.
async fn teardown(holder: &Arc<Holder>) -> Vec<SendRequest> {
    let _ = holder.close_tx.send(true);
    let handle = holder.writer.lock().expect("writer slot").take();
    let mut rx = match handle {
        Some(handle) => match handle.await {
            Ok(rx) => rx,
            Err(e) => {
                error!("writer task panicked during teardown: {}", e);
                return Vec::new();
            }
        },
        None => return Vec::new(),
    };
    rx.close();
    let mut drained = Vec::new();
    while let Ok(req) = rx.try_recv() {
        drained.push(req);
    }
    drained
}

/// One per holder. Consumes the send queue in FIFO order and serializes
/// all socket writes; exits on close signal, queue closure, or the first
/// write error. Returns the receiver so teardown can drain it.
async fn writer_loop(
    inner: Arc<ManagerInner>,
    user_id: i64,
    mut rx: mpsc::Receiver<SendRequest>,
    mut sink: Box<dyn FrameSink>,
    mut close_rx: watch::Receiver<bool>,
) -> mpsc::Receiver<SendRequest> {
    loop {
        let req = tokio::select! {
            biased;
            _ = close_rx.changed() => break,
            req = rx.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        inner.outstanding.fetch_sub(1, Ordering::Relaxed);
        inner.drained.notify_waiters();

        match req {
            SendRequest::Ping { done } => {
                // the close signal aborts an in-flight write so teardown
                // is never blocked behind a dead socket
                let result = tokio::select! {
                    biased;
                    _ = close_rx.changed() => Err(DeliveryError::Write("connection closing".to_string())),
                    res = write_frame(&mut *sink, None, inner.write_timeout) => res,
                };
                let failed = result.is_err();
                let _ = done.send(result);
                if failed {
                    warn!("ping write failed for user {}, closing", user_id);
                    sink.close().await;
                    break;
                }
            }
            SendRequest::Frame { msg, done } => {
                inner.hooks.message_done(msg.id);
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to serialize message {}: {}", msg.id, e);
                        if let Some(done) = done {
                            let _ = done.send(Err(DeliveryError::Write(e.to_string())));
                        }
                        continue;
                    }
                };
                let result = tokio::select! {
                    biased;
                    _ = close_rx.changed() => Err(DeliveryError::Write("connection closing".to_string())),
                    res = write_frame(&mut *sink, Some(text), inner.write_timeout) => res,
                };
                match result {
                    Ok(()) => {
                        metrics::counter!("gateway_messages_written_total").increment(1);
                        if let Some(done) = done {
                            let _ = done.send(Ok(()));
                        }
                    }
                    Err(err) => {
                        warn!("write failed for user {}: {}, closing", user_id, err);
                        if let Some(done) = done {
                            let _ = done.send(Err(err));
                        }
                        inner.hooks.undeliverable(user_id, msg).await;
                        sink.close().await;
                        break;
                    }
                }
            }
        }
    }
    rx
}

async fn write_frame(
    sink: &mut dyn FrameSink,
    text: Option<String>,
    write_timeout: Duration,
) -> std::result::Result<(), DeliveryError> {
    let write = async {
        match text {
            Some(text) => sink.send_text(text).await,
            None => sink.send_ping().await,
        }
    };
    match tokio::time::timeout(write_timeout, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DeliveryError::Write(e)),
        Err(_) => Err(DeliveryError::Write("write deadline exceeded".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    /// Sink that records written frames.
    struct RecordingSink {
        frames: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> std::result::Result<(), String> {
            self.frames.lock().unwrap().push(text);
            Ok(())
        }
        async fn send_ping(&mut self) -> std::result::Result<(), String> {
            self.frames.lock().unwrap().push("<ping>".to_string());
            Ok(())
        }
        async fn close(&mut self) {}
    }

    /// Sink whose writes never complete, so enqueued frames stay queued.
    struct StuckSink;

    #[async_trait]
    impl FrameSink for StuckSink {
        async fn send_text(&mut self, _text: String) -> std::result::Result<(), String> {
            std::future::pending().await
        }
        async fn send_ping(&mut self) -> std::result::Result<(), String> {
            std::future::pending().await
        }
        async fn close(&mut self) {}
    }

    struct DivertHooks {
        diverted: Arc<StdMutex<Vec<i64>>>,
    }

    #[async_trait]
    impl WriterHooks for DivertHooks {
        async fn undeliverable(&self, _user_id: i64, msg: ClientMessage) {
            self.diverted.lock().unwrap().push(msg.id);
        }
    }

    fn msg(id: i64) -> ClientMessage {
        ClientMessage {
            id,
            msg_type: "chat".into(),
            room_id: 1,
            sender_id: 2,
            payload: json!({"type": "text", "text": format!("m{id}")}),
        }
    }

    fn ids_of(frames: &[String]) -> Vec<i64> {
        frames
            .iter()
            .filter(|f| *f != "<ping>")
            .map(|f| serde_json::from_str::<ClientMessage>(f).unwrap().id)
            .collect()
    }

    #[tokio::test]
    async fn enqueue_without_holder_is_no_conn() {
        let manager =
            ConnectionManager::new(8, Duration::from_secs(10), Arc::new(NoopHooks));
        let err = manager
            .enqueue(42, Duration::from_millis(10), msg(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NoConn));
    }

    #[tokio::test]
    async fn full_queue_times_out_within_deadline() {
        let manager =
            ConnectionManager::new(1, Duration::from_secs(60), Arc::new(NoopHooks));
        manager.register(7, Box::new(StuckSink)).await;

        // first frame is consumed by the writer and sticks in the sink,
        // second fills the queue, third must time out
        manager
            .enqueue(7, Duration::from_millis(50), msg(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager
            .enqueue(7, Duration::from_millis(50), msg(2))
            .await
            .unwrap();
        let err = manager
            .enqueue(7, Duration::from_millis(50), msg(3))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::EnqueueTimeout));
    }

    #[tokio::test]
    async fn reconnect_migrates_buffered_items_in_order() {
        let manager =
            ConnectionManager::new(4, Duration::from_secs(60), Arc::new(NoopHooks));
        manager.register(9, Box::new(StuckSink)).await;

        // one frame is stuck in the writer; these stay buffered
        manager
            .enqueue(9, Duration::from_millis(50), msg(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for id in [2, 3, 4] {
            manager
                .enqueue(9, Duration::from_millis(50), msg(id))
                .await
                .unwrap();
        }

        let frames = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(
                9,
                Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
            )
            .await;
        manager
            .enqueue(9, Duration::from_millis(50), msg(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // buffered head-prefix first, then the post-reconnect enqueue
        assert_eq!(ids_of(&frames.lock().unwrap()), vec![2, 3, 4, 5]);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_with_empty_old_holder_is_trivial() {
        let manager =
            ConnectionManager::new(4, Duration::from_secs(60), Arc::new(NoopHooks));
        manager.register(11, Box::new(StuckSink)).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(
                11,
                Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
            )
            .await;
        manager
            .enqueue(11, Duration::from_millis(50), msg(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ids_of(&frames.lock().unwrap()), vec![1]);
    }

    #[tokio::test]
    async fn remove_diverts_drained_frames() {
        let diverted = Arc::new(StdMutex::new(Vec::new()));
        let manager = ConnectionManager::new(
            4,
            Duration::from_secs(60),
            Arc::new(DivertHooks {
                diverted: diverted.clone(),
            }),
        );
        manager.register(5, Box::new(StuckSink)).await;
        manager
            .enqueue(5, Duration::from_millis(50), msg(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for id in [2, 3] {
            manager
                .enqueue(5, Duration::from_millis(50), msg(id))
                .await
                .unwrap();
        }

        manager.remove(5).await.unwrap();
        // the in-flight frame is aborted by the close signal, then the
        // queued ones are drained; all three reach the pushback hook
        assert_eq!(*diverted.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.outstanding(), 0);
    }

    #[tokio::test]
    async fn stale_epoch_cannot_remove_successor() {
        let manager =
            ConnectionManager::new(4, Duration::from_secs(60), Arc::new(NoopHooks));
        let old_epoch = manager.register(3, Box::new(StuckSink)).await;
        let new_epoch = manager.register(3, Box::new(StuckSink)).await;
        assert_ne!(old_epoch, new_epoch);

        manager.remove_if(3, old_epoch).await;
        assert!(manager.is_connected(3));
        manager.remove_if(3, new_epoch).await;
        assert!(!manager.is_connected(3));
    }

    #[tokio::test]
    async fn write_blocking_reports_completion() {
        let manager =
            ConnectionManager::new(8, Duration::from_secs(60), Arc::new(NoopHooks));
        let frames = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(
                2,
                Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
            )
            .await;
        manager
            .write_blocking(2, Duration::from_secs(1), msg(9))
            .await
            .unwrap();
        assert_eq!(ids_of(&frames.lock().unwrap()), vec![9]);
    }

    #[tokio::test]
    async fn write_blocking_times_out_when_writer_is_stuck() {
        let manager =
            ConnectionManager::new(8, Duration::from_secs(60), Arc::new(NoopHooks));
        manager.register(2, Box::new(StuckSink)).await;
        let err = manager
            .write_blocking(2, Duration::from_millis(50), msg(9))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::EnqueueTimeout));
    }

    #[tokio::test]
    async fn ping_goes_out_as_a_control_frame() {
        let manager =
            ConnectionManager::new(8, Duration::from_secs(60), Arc::new(NoopHooks));
        let frames = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(
                6,
                Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
            )
            .await;
        manager.ping(6, Duration::from_secs(1)).await.unwrap();
        assert_eq!(*frames.lock().unwrap(), vec!["<ping>".to_string()]);
    }

    #[tokio::test]
    async fn outstanding_counter_tracks_writer_progress() {
        let manager =
            ConnectionManager::new(8, Duration::from_secs(60), Arc::new(NoopHooks));
        let frames = Arc::new(StdMutex::new(Vec::new()));
        manager
            .register(
                1,
                Box::new(RecordingSink {
                    frames: frames.clone(),
                }),
            )
            .await;
        for id in [1, 2, 3] {
            manager
                .enqueue(1, Duration::from_millis(50), msg(id))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.outstanding(), 0);
        assert_eq!(ids_of(&frames.lock().unwrap()), vec![1, 2, 3]);
    }
}
