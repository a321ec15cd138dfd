#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock, RwLockWriteGuard,
};

/// Page or tree latch strength.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RwLatch {
    /// Shared: readers only.
    Shared,
    /// Exclusive: a single modifier.
    Exclusive,
}

impl RwLatch {
    /// True when a held latch of strength `self` satisfies a request for `wanted`.
    pub fn covers(self, wanted: RwLatch) -> bool {
        matches!((self, wanted), (RwLatch::Exclusive, _) | (RwLatch::Shared, RwLatch::Shared))
    }
}

/// Shared guard on a tree lock that can live inside a mini-transaction memo.
pub type TreeReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Exclusive guard on a tree lock that can live inside a mini-transaction memo.
pub type TreeWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Per-index reader/writer lock protecting the shape of the tree.
///
/// Descents hold it shared; page splits, merges and root changes hold it
/// exclusively.
#[derive(Clone, Default)]
pub struct TreeLatch {
    inner: Arc<RwLock<()>>,
}

impl TreeLatch {
    /// Creates an unlocked tree latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the latch is held shared.
    pub fn s_lock(&self) -> TreeReadGuard {
        self.inner.read_arc()
    }

    /// Blocks until the latch is held exclusively.
    pub fn x_lock(&self) -> TreeWriteGuard {
        self.inner.write_arc()
    }

    /// Returns true when some thread holds the latch exclusively.
    pub fn is_x_locked(&self) -> bool {
        self.inner.is_locked_exclusive()
    }
}

/// Snapshot of hash-index latch usage for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LatchSnapshot {
    /// Exclusive acquisitions around record patches.
    pub exclusive: u64,
    /// Patches that skipped the latch because the page was not hashed.
    pub skipped: u64,
}

/// Process-wide latch serialising in-place patches of hash-indexed pages
/// against adaptive hash lookups.
///
/// Owned explicitly and passed to the engine so independent engines in one
/// process never share it by accident.
#[derive(Default)]
pub struct HashIndexLatch {
    lock: RwLock<()>,
    exclusive: AtomicU64,
    skipped: AtomicU64,
}

impl HashIndexLatch {
    /// Creates an unlocked latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the latch exclusively when `hashed` is set.
    pub fn x_lock_if(&self, hashed: bool) -> Option<RwLockWriteGuard<'_, ()>> {
        if hashed {
            self.exclusive.fetch_add(1, AtomicOrdering::Relaxed);
            Some(self.lock.write())
        } else {
            self.skipped.fetch_add(1, AtomicOrdering::Relaxed);
            None
        }
    }

    /// Shared access for hash lookups.
    pub fn s_lock(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Returns a snapshot of the usage counters.
    pub fn snapshot(&self) -> LatchSnapshot {
        LatchSnapshot {
            exclusive: self.exclusive.load(AtomicOrdering::Relaxed),
            skipped: self.skipped.load(AtomicOrdering::Relaxed),
        }
    }
}
