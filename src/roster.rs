//! The memtable roster: one writable memtable plus at most one immutable
//! memtable awaiting flush.
//!
//! Rotation is a compare-and-swap on the writable slot: exactly one writer
//! wins per window boundary, stores the retired memtable into the immutable
//! slot, and installs its candidate. Memtables are never reused, so pointer
//! identity cannot suffer ABA. Wait coordination (writers blocking while
//! the immutable slot is occupied) lives with the database state mutex; the
//! roster itself only owns the slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::memtable::Memtable;

pub struct MemtableRoster {
    current: RwLock<Arc<Memtable>>,
    immutable: RwLock<Option<Arc<Memtable>>>,
    // Fast-path check writers use before deciding to block.
    has_immutable: AtomicBool,
}

impl MemtableRoster {
    pub fn new(initial: Arc<Memtable>) -> Self {
        Self {
            current: RwLock::new(initial),
            immutable: RwLock::new(None),
            has_immutable: AtomicBool::new(false),
        }
    }

    pub fn current(&self) -> Arc<Memtable> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn immutable(&self) -> Option<Arc<Memtable>> {
        self.immutable
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_immutable(&self) -> bool {
        self.has_immutable.load(Ordering::Acquire)
    }

    /// Loads of both slots. The pair is not taken atomically; admission
    /// re-reads after any failed step, so tearing is harmless.
    pub fn snapshot(&self) -> (Arc<Memtable>, Option<Arc<Memtable>>) {
        (self.current(), self.immutable())
    }

    /// Swings `current` from `old` to `new` and parks `old` in the
    /// immutable slot. Fails if another writer rotated first. Must only be
    /// attempted while the immutable slot is empty.
    pub fn try_rotate(&self, old: &Arc<Memtable>, new: Arc<Memtable>) -> bool {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if !Arc::ptr_eq(&current, old) {
            return false;
        }
        let mut immutable = self.immutable.write().unwrap_or_else(|e| e.into_inner());
        debug_assert!(immutable.is_none(), "rotation with occupied immutable slot");
        *immutable = Some(current.clone());
        *current = new;
        self.has_immutable.store(true, Ordering::Release);
        true
    }

    /// Recovery only: replaces the writable memtable before any writer can
    /// observe the roster.
    pub(crate) fn install_current(&self, mem: Arc<Memtable>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = mem;
    }

    /// Called by the flush worker after the immutable memtable's table is
    /// durably committed.
    pub fn clear_immutable(&self) {
        let mut immutable = self.immutable.write().unwrap_or_else(|e| e.into_inner());
        *immutable = None;
        self.has_immutable.store(false, Ordering::Release);
    }
}
