//! In-memory table buffering the writes of one sequence window.
//!
//! The memtable is an ordered map from internal key to value over a
//! concurrent skip list, so many writers insert concurrently while the
//! flush worker iterates, with no external locking.
//!
//! Each memtable owns an inclusive sequence window
//! `[first_seq, largest_seq_supposed]`. Writer admission routes a sequence
//! number to the memtable whose window contains it; completion of every
//! admitted write is tracked with `completed_count`, and the table becomes
//! flushable only once the whole window has completed. A completed write
//! with no entry in the table (a failed or deliberately burned sequence
//! number) is indistinguishable from a not-yet-inserted one to readers.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;

use crate::format::{InternalKey, LookupKey, ValueType, TRAILER_SIZE};

/// Lifecycle of a memtable with respect to the flush worker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    Open = 0,
    Requested = 1,
    Scheduled = 2,
    Done = 3,
}

impl FlushState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FlushState::Open,
            1 => FlushState::Requested,
            2 => FlushState::Scheduled,
            _ => FlushState::Done,
        }
    }
}

/// Outcome of a point lookup at a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(Vec<u8>),
    Deleted,
    Missing,
}

pub struct Memtable {
    table: SkipMap<InternalKey, Vec<u8>>,
    first_seq: AtomicU64,
    largest_seq_supposed: AtomicU64,
    // Number of admitted sequence numbers whose write has completed,
    // incremented only after the skip-list insert is published.
    completed_count: AtomicU64,
    memory_usage: AtomicUsize,
    flush_state: AtomicU8,
}

impl Memtable {
    pub fn new(first_seq: u64, largest_seq_supposed: u64) -> Self {
        debug_assert!(first_seq <= largest_seq_supposed);
        Self {
            table: SkipMap::new(),
            first_seq: AtomicU64::new(first_seq),
            largest_seq_supposed: AtomicU64::new(largest_seq_supposed),
            completed_count: AtomicU64::new(0),
            memory_usage: AtomicUsize::new(0),
            flush_state: AtomicU8::new(FlushState::Open as u8),
        }
    }

    pub fn first_seq(&self) -> u64 {
        self.first_seq.load(Ordering::Acquire)
    }

    pub fn largest_seq_supposed(&self) -> u64 {
        self.largest_seq_supposed.load(Ordering::Acquire)
    }

    /// Recovery only: adjusts the window before the table is published to
    /// writers.
    pub fn set_window(&self, first_seq: u64, largest_seq_supposed: u64) {
        self.first_seq.store(first_seq, Ordering::Release);
        self.largest_seq_supposed
            .store(largest_seq_supposed, Ordering::Release);
    }

    pub fn window_width(&self) -> u64 {
        self.largest_seq_supposed() - self.first_seq() + 1
    }

    /// True once the sequence number lies inside this table's window.
    pub fn contains_seq(&self, seq: u64) -> bool {
        seq >= self.first_seq() && seq <= self.largest_seq_supposed()
    }

    /// Inserts one entry. The caller must have been admitted for `seq`,
    /// i.e. `seq` lies inside the window; the completion counter is bumped
    /// only after the entry is visible in the skip list.
    pub fn insert(&self, seq: u64, vtype: ValueType, user_key: &[u8], value: &[u8]) {
        debug_assert!(self.contains_seq(seq));
        let key = InternalKey::new(user_key, seq, vtype);
        let charge = key.encoded().len() + value.len() + TRAILER_SIZE;
        self.table.insert(key, value.to_vec());
        self.memory_usage.fetch_add(charge, Ordering::Relaxed);
        self.completed_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Accounts for `n` admitted sequence numbers that will never produce
    /// an entry (burned during a forced flush, or belonging to a previous
    /// incarnation when a WAL is reused).
    pub fn add_completed(&self, n: u64) {
        self.completed_count.fetch_add(n, Ordering::AcqRel);
    }

    /// Every sequence number admitted to this window has finished its
    /// write; the flush worker may now iterate the table.
    pub fn able_to_flush(&self) -> bool {
        self.completed_count.load(Ordering::Acquire) >= self.window_width()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Looks up `user_key` at `snapshot`, resolving to the entry with the
    /// largest sequence at or below the snapshot.
    pub fn get(&self, user_key: &[u8], snapshot: u64) -> LookupResult {
        let lookup = LookupKey::new(user_key, snapshot);
        if let Some(entry) = self.table.range(lookup.internal_key().clone()..).next() {
            let key = entry.key();
            if key.user_key() == user_key {
                return match key.value_type() {
                    ValueType::Value => LookupResult::Found(entry.value().clone()),
                    ValueType::Deletion => LookupResult::Deleted,
                };
            }
        }
        LookupResult::Missing
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    /// Ordered traversal over `(internal_key, value)` pairs; used by the
    /// flush path to build a sorted table.
    pub fn iter(&self) -> impl Iterator<Item = (InternalKey, Vec<u8>)> + '_ {
        self.table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }

    pub fn flush_state(&self) -> FlushState {
        FlushState::from_u8(self.flush_state.load(Ordering::Acquire))
    }

    pub fn set_flush_state(&self, state: FlushState) {
        self.flush_state.store(state as u8, Ordering::Release);
    }

    pub fn check_flush_scheduled(&self) -> bool {
        self.flush_state() == FlushState::Scheduled
    }
}
