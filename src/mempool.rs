// src/mempool.rs
// C10 mempool bridge: the pending-transaction queue the consensus driver
// drains from when proposing a block. Grounded in the teacher's
// select_transactions/MAX_MEMPOOL_SIZE/pop_for_block pattern, rebuilt as a
// plain bounded FIFO over opaque transaction strings instead of a
// RocksDB-backed fee-tiered index — transaction execution semantics and
// account-state storage are an explicit non-goal, so the mempool only
// orders and hands off opaque payloads.

use parking_lot::Mutex;
use std::collections::VecDeque;

pub const MEMPOOL_CAPACITY: usize = 10_000;
pub const MAX_TXS_PER_BLOCK: usize = 500;

/// FIFO queue of pending transactions awaiting inclusion. Oldest entries are
/// evicted once `capacity` is exceeded, mirroring the teacher's
/// DoS-protection size cap.
pub struct Mempool {
    pending: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Mempool { pending: Mutex::new(VecDeque::new()), capacity }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accepts a gossiped transaction, evicting the oldest pending entry if
    /// already at capacity.
    pub fn submit(&self, tx: String) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            pending.pop_front();
        }
        pending.push_back(tx);
    }

    /// Selects up to `limit` transactions for the next proposed block,
    /// without removing them — they are cleared only once the block they
    /// were included in is applied locally, so a failed proposal does not
    /// lose them.
    pub fn select_for_block(&self, limit: usize) -> Vec<String> {
        self.pending.lock().iter().take(limit).cloned().collect()
    }

    /// Drops transactions that made it into an applied block.
    pub fn remove_included(&self, included: &[String]) {
        if included.is_empty() {
            return;
        }
        let mut pending = self.pending.lock();
        pending.retain(|tx| !included.contains(tx));
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Mempool::new(MEMPOOL_CAPACITY)
    }
}
