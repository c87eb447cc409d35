//! Per-message remaining-recipient counters on the Send side.
//!
//! `init` records how many recipients a message fans out to; dispatcher
//! workers settle them in batches as route groups publish or divert. The
//! zero transition emits the message id on an unbounded channel consumed
//! by the sender-ack task. Sharded 64 ways; decrements are atomic, the
//! shard mutex is held only for insert and delete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const SHARD_COUNT: usize = 64;

pub struct PendingTracker {
    shards: Vec<Mutex<HashMap<i64, Arc<AtomicI32>>>>,
    zero_tx: mpsc::UnboundedSender<i64>,
}

impl PendingTracker {
    pub fn new(zero_tx: mpsc::UnboundedSender<i64>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self { shards, zero_tx }
    }

    fn shard(&self, msg_id: i64) -> &Mutex<HashMap<i64, Arc<AtomicI32>>> {
        &self.shards[(msg_id.unsigned_abs() as usize) % SHARD_COUNT]
    }

    pub fn init(&self, msg_id: i64, count: i32) {
        self.shard(msg_id)
            .lock()
            .expect("pending shard")
            .insert(msg_id, Arc::new(AtomicI32::new(count)));
    }

    pub fn done(&self, msg_id: i64) {
        self.done_n(msg_id, 1);
    }

    pub fn done_n(&self, msg_id: i64, n: i32) {
        let counter = {
            let shard = self.shard(msg_id).lock().expect("pending shard");
            match shard.get(&msg_id) {
                Some(counter) => counter.clone(),
                None => return,
            }
        };
        let remaining = counter.fetch_sub(n, Ordering::AcqRel) - n;
        if remaining <= 0 {
            let removed = self
                .shard(msg_id)
                .lock()
                .expect("pending shard")
                .remove(&msg_id)
                .is_some();
            // only the remover emits, so the zero fires at most once
            if removed {
                let _ = self.zero_tx.send(msg_id);
            }
        }
    }

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

    fn tracker() -> (PendingTracker, mpsc::UnboundedReceiver<i64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PendingTracker::new(tx), rx)
    }

    #[tokio::test]
    async fn zero_fires_exactly_once() {
        let (pending, mut rx) = tracker();
        pending.init(7, 4);
        pending.done_n(7, 3);
        assert!(rx.try_recv().is_err());
        pending.done(7);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert!(!pending.contains(7));
        pending.done(7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mixed_done_and_done_n_never_double_fire() {
        let (pending, mut rx) = tracker();
        pending.init(8, 5);
        pending.done_n(8, 5);
        assert_eq!(rx.try_recv().unwrap(), 8);
        // a straggling per-target completion after the batch drained it
        pending.done(8);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_ids_are_ignored() {
        let (pending, mut rx) = tracker();
        pending.done(123);
        pending.done_n(123, 10);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forget_suppresses_the_zero_event() {
        let (pending, mut rx) = tracker();
        pending.init(9, 1);
        pending.forget(9);
        pending.done(9);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completions_fire_one_zero_per_message() {
        let (pending, mut rx) = tracker();
        let pending = std::sync::Arc::new(pending);
        for msg_id in 0..32 {
            pending.init(msg_id, 40);
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pending = pending.clone();
            handles.push(tokio::spawn(async move {
                for msg_id in 0..32 {
                    for _ in 0..10 {
                        pending.done(msg_id);
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let mut zeroes = Vec::new();
        while let Ok(msg_id) = rx.try_recv() {
            zeroes.push(msg_id);
        }
        zeroes.sort_unstable();
        assert_eq!(zeroes, (0..32).collect::<Vec<_>>());
    }
}
