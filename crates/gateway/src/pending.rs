//! Per-message remaining-target counters on the gateway side.
//!
//! Each stream entry is tracked until every local target has been written,
//! diverted, or pushed back; the zero transition releases the entry's
//! acknowledgement to the batcher. Sharded 64 ways; the shard mutex is
//! held only for insert and delete, decrements are atomic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const SHARD_COUNT: usize = 64;

struct PendingEntry {
    remaining: AtomicI32,
    stream_entry_id: String,
}

/// message id -> (remaining targets, owning stream entry).
pub struct PendingCounts {
    shards: Vec<Mutex<HashMap<i64, Arc<PendingEntry>>>>,
    ack_tx: mpsc::Sender<String>,
}

impl PendingCounts {
    pub fn new(ack_tx: mpsc::Sender<String>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards, ack_tx }
    }

    fn shard(&self, msg_id: i64) -> &Mutex<HashMap<i64, Arc<PendingEntry>>> {
        &self.shards[(msg_id.unsigned_abs() as usize) % SHARD_COUNT]
    }

    /// Start tracking a pulled entry with `count` local targets.
    pub fn track(&self, msg_id: i64, count: i32, stream_entry_id: String) {
        let entry = Arc::new(PendingEntry {
            remaining: AtomicI32::new(count),
            stream_entry_id,
        });
        self.shard(msg_id).lock().expect("pending shard").insert(msg_id, entry);
    }

    /// One target settled. Absent ids are ignored.
    pub fn done(&self, msg_id: i64) {
        self.done_n(msg_id, 1);
    }

    /// `n` targets settled at once (batch divert paths).
    pub fn done_n(&self, msg_id: i64, n: i32) {
        let entry = {
            let shard = self.shard(msg_id).lock().expect("pending shard");
            match shard.get(&msg_id) {
                Some(entry) => entry.clone(),
                None => return,
            }
        };
        let remaining = entry.remaining.fetch_sub(n, Ordering::AcqRel) - n;
        if remaining <= 0 {
            // whoever actually removes the entry releases the ack; a
            // racing decrement past zero finds it gone
            let removed = self
                .shard(msg_id)
                .lock()
                .expect("pending shard")
                .remove(&msg_id)
                .is_some();
            if removed {
                store::stream::offer_ack(&self.ack_tx, entry.stream_entry_id.clone());
            }
        }
    }

    /// Drop tracking without acknowledging.
    pub fn forget(&self, msg_id: i64) {
        self.shard(msg_id).lock().expect("pending shard").remove(&msg_id);
    }

    pub fn contains(&self, msg_id: i64) -> bool {
        self.shard(msg_id)
            .lock()
            .expect("pending shard")
            .contains_key(&msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> (PendingCounts, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        (PendingCounts::new(tx), rx)
    }

    #[tokio::test]
    async fn zero_releases_exactly_one_ack() {
        let (pending, mut rx) = counts();
        pending.track(10, 3, "1-0".into());
        pending.done(10);
        pending.done(10);
        assert!(rx.try_recv().is_err());
        pending.done(10);
        assert_eq!(rx.try_recv().unwrap(), "1-0");
        assert!(!pending.contains(10));

        // late completions after the entry is gone are no-ops
        pending.done(10);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn done_n_settles_batches() {
        let (pending, mut rx) = counts();
        pending.track(11, 100, "2-0".into());
        pending.done_n(11, 99);
        assert!(rx.try_recv().is_err());
        pending.done(11);
        assert_eq!(rx.try_recv().unwrap(), "2-0");
    }

    #[tokio::test]
    async fn done_on_unknown_id_is_ignored() {
        let (pending, mut rx) = counts();
        pending.done(999);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forget_suppresses_the_ack() {
        let (pending, mut rx) = counts();
        pending.track(12, 2, "3-0".into());
        pending.forget(12);
        pending.done_n(12, 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn negative_ids_shard_safely() {
        let (pending, mut rx) = counts();
        pending.track(-5, 1, "4-0".into());
        pending.done(-5);
        assert_eq!(rx.try_recv().unwrap(), "4-0");
    }
}
