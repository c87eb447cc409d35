//! Snowflake-layout message id generation.
//!
//! 41 bits of millisecond timestamp, 10 bits of machine id, 12 bits of
//! per-millisecond sequence. Ids are strictly positive and monotonic per
//! generator; negative ids are reserved for synthetic envelopes.

use std::sync::atomic::{AtomicI64, Ordering};

/// Custom epoch (2024-01-01T00:00:00Z) so the 41-bit timestamp lasts.
const EPOCH_MS: i64 = 1_704_067_200_000;

const MACHINE_BITS: u8 = 10;
const SEQUENCE_BITS: u8 = 12;
const MACHINE_MAX: i64 = (1 << MACHINE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

/// Lock-free message id generator.
///
/// Packs the last-issued `(timestamp, sequence)` pair into one atomic so
/// concurrent callers race on a single compare-exchange.
pub struct MessageIdGenerator {
    machine_id: i64,
    /// `timestamp_ms << SEQUENCE_BITS | sequence` of the last issued id.
    state: AtomicI64,
}

impl MessageIdGenerator {
    /// Create a generator for the given machine id (wrapped into 10 bits).
    pub fn new(machine_id: i64) -> Self {
        Self {
            machine_id: machine_id & MACHINE_MAX,
            state: AtomicI64::new(0),
        }
    }

    /// Issue the next id. Spins into the next millisecond when the
    /// 4096-per-ms sequence space is exhausted.
    pub fn next_id(&self) -> i64 {
        loop {
            let now = now_ms();
            let prev = self.state.load(Ordering::Acquire);
            let last_ts = prev >> SEQUENCE_BITS;
            let last_seq = prev & SEQUENCE_MASK;

            let (ts, seq) = if now > last_ts {
                (now, 0)
            } else if last_seq < SEQUENCE_MASK {
                (last_ts, last_seq + 1)
            } else {
                // sequence exhausted for this millisecond
                std::hint::spin_loop();
                continue;
            };

            let next = (ts << SEQUENCE_BITS) | seq;
            if self
                .state
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ((ts - EPOCH_MS) << (MACHINE_BITS + SEQUENCE_BITS))
                    | (self.machine_id << SEQUENCE_BITS)
                    | seq;
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn ids_are_positive_and_strictly_increasing() {
        let gen = MessageIdGenerator::new(1);
        let mut last = 0;
        for _ in 0..5_000 {
            let id = gen.next_id();
            assert!(id > 0);
            assert!(id > last, "id {} not greater than {}", id, last);
            last = id;
        }
    }

    #[test]
    fn concurrent_issuance_never_collides() {
        let gen = Arc::new(MessageIdGenerator::new(3));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let gen = gen.clone();
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| gen.next_id()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
    }

    #[test]
    fn machine_id_lands_in_its_field() {
        let gen = MessageIdGenerator::new(5);
        let id = gen.next_id();
        assert_eq!((id >> SEQUENCE_BITS) & MACHINE_MAX, 5);
    }
}
