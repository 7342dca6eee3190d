use std::sync::atomic::{AtomicU64, Ordering};

use crate::format::MAX_SEQUENCE;

/// Vends monotonically increasing sequence numbers to writers, wait-free.
/// Sequence numbers start at 1; zero means "nothing allocated yet".
pub struct SequenceAllocator {
    last: AtomicU64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Reserves `n` consecutive sequence numbers and returns the first.
    pub fn assign(&self, n: u64) -> u64 {
        debug_assert!(n > 0);
        let old = self.last.fetch_add(n, Ordering::AcqRel);
        debug_assert!(old + n <= MAX_SEQUENCE);
        old + 1
    }

    /// The most recently allocated sequence number.
    pub fn last_sequence(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Recovery only: rebases the allocator.
    pub fn set_last_sequence(&self, seq: u64) {
        self.last.store(seq, Ordering::Release);
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}
