use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};

use crate::primitives::concurrency::RwLatch;

/// One buffered page. `resident` simulates whether the page is in memory;
/// a non-resident frame is "read from disk" (checksum verified) on the next
/// normal fetch.
pub struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    resident: AtomicBool,
}

impl Frame {
    pub fn new(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            resident: AtomicBool::new(true),
        }
    }

    pub fn is_resident(&self) -> bool {
        self.resident.load(AtomicOrdering::Acquire)
    }

    pub fn set_resident(&self, resident: bool) {
        self.resident.store(resident, AtomicOrdering::Release);
    }
}

/// A held page latch. Shared latches expose the page read-only.
pub enum PageLatch {
    /// S-latched page.
    Shared(ArcRwLockReadGuard<RawRwLock, Box<[u8]>>),
    /// X-latched page.
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>),
}

impl PageLatch {
    pub(crate) fn acquire(frame: &Frame, latch: RwLatch) -> Self {
        match latch {
            RwLatch::Shared => PageLatch::Shared(frame.buf.read_arc()),
            RwLatch::Exclusive => PageLatch::Exclusive(frame.buf.write_arc()),
        }
    }

    /// Strength of the held latch.
    pub fn mode(&self) -> RwLatch {
        match self {
            PageLatch::Shared(_) => RwLatch::Shared,
            PageLatch::Exclusive(_) => RwLatch::Exclusive,
        }
    }

    /// Page bytes.
    pub fn data(&self) -> &[u8] {
        match self {
            PageLatch::Shared(guard) => guard,
            PageLatch::Exclusive(guard) => guard,
        }
    }

    /// Mutable page bytes, available only under an exclusive latch.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PageLatch::Shared(_) => None,
            PageLatch::Exclusive(guard) => Some(guard),
        }
    }
}
