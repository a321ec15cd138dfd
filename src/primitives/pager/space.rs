use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{CairnError, Result, SpaceId};

/// Default number of pages per extent.
pub const DEFAULT_EXTENT_PAGES: u32 = 64;

/// Who is asking for extents; decides how much headroom must remain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReserveClass {
    /// Ordinary inserts and updates; keeps 2% of the space free.
    Normal,
    /// Undo log growth; keeps 1% free.
    Undo,
    /// Purge and rollback; may use everything left.
    Cleaning,
}

#[derive(Default)]
struct SpaceState {
    next_page_no: u32,
    free: BTreeSet<u32>,
    reserved: u64,
}

/// A tablespace with a hard page limit, a free list and outstanding extent
/// reservations.
pub struct FileSpace {
    id: SpaceId,
    limit_pages: u32,
    extent_pages: u32,
    state: Mutex<SpaceState>,
}

impl FileSpace {
    /// Creates an empty space that may grow to `limit_pages`.
    pub fn new(id: SpaceId, limit_pages: u32, extent_pages: u32) -> Self {
        Self {
            id,
            limit_pages,
            extent_pages: extent_pages.max(1),
            state: Mutex::new(SpaceState::default()),
        }
    }

    /// Space identifier.
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Maximum number of pages.
    pub fn limit_pages(&self) -> u32 {
        self.limit_pages
    }

    /// Pages per extent.
    pub fn extent_pages(&self) -> u32 {
        self.extent_pages
    }

    /// Pages currently allocated.
    pub fn used_pages(&self) -> u32 {
        let state = self.state.lock();
        state.next_page_no - state.free.len() as u32
    }

    /// Pages held back by live reservations.
    pub fn reserved_pages(&self) -> u64 {
        self.state.lock().reserved
    }

    /// Reserves `n_extents` extents so a structural change can complete.
    ///
    /// The reservation is returned as an RAII value; whatever it has not
    /// handed out is released when it is dropped.
    pub fn reserve(self: &Arc<Self>, n_extents: u32, class: ReserveClass) -> Result<ExtentReservation> {
        let pages = u64::from(n_extents) * u64::from(self.extent_pages);
        let limit = u64::from(self.limit_pages);
        let margin = match class {
            ReserveClass::Normal => limit / 50,
            ReserveClass::Undo => limit / 100,
            ReserveClass::Cleaning => 0,
        };
        let mut state = self.state.lock();
        let used = u64::from(state.next_page_no) - state.free.len() as u64;
        let available = limit.saturating_sub(used + state.reserved);
        if pages + margin > available {
            debug!(
                target: "cairn::pager",
                space = self.id.0,
                n_extents,
                available,
                ?class,
                "extent reservation refused"
            );
            return Err(CairnError::OutOfFileSpace);
        }
        state.reserved += pages;
        Ok(ExtentReservation {
            space: Arc::clone(self),
            granted: pages,
            remaining: AtomicU64::new(pages),
        })
    }

    pub(crate) fn allocate(&self, hint: Option<u32>, reservation: Option<&ExtentReservation>) -> Result<u32> {
        let mut state = self.state.lock();
        let used = u64::from(state.next_page_no) - state.free.len() as u64;
        let from_reservation = reservation
            .filter(|r| r.space.id == self.id)
            .map(|r| r.take_one())
            .unwrap_or(false);
        if from_reservation {
            state.reserved -= 1;
        } else if used + state.reserved >= u64::from(self.limit_pages) {
            return Err(CairnError::OutOfFileSpace);
        }
        let page_no = match hint {
            Some(h) if state.free.remove(&h) => h,
            Some(h) if h == state.next_page_no => {
                state.next_page_no += 1;
                h
            }
            _ => {
                if let Some(&first) = state.free.iter().next() {
                    state.free.remove(&first);
                    first
                } else {
                    let page_no = state.next_page_no;
                    state.next_page_no += 1;
                    page_no
                }
            }
        };
        Ok(page_no)
    }

    pub(crate) fn free(&self, page_no: u32) -> Result<()> {
        let mut state = self.state.lock();
        if page_no >= state.next_page_no || !state.free.insert(page_no) {
            return Err(CairnError::Corruption("freeing a page that is not allocated"));
        }
        Ok(())
    }

    fn release(&self, pages: u64) {
        if pages == 0 {
            return;
        }
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(pages);
    }
}

/// Pages set aside ahead of a pessimistic operation.
pub struct ExtentReservation {
    space: Arc<FileSpace>,
    granted: u64,
    remaining: AtomicU64,
}

impl ExtentReservation {
    /// Space the pages were reserved in.
    pub fn space_id(&self) -> SpaceId {
        self.space.id
    }

    /// Pages originally reserved.
    pub fn granted_pages(&self) -> u64 {
        self.granted
    }

    /// Pages not yet consumed by allocations.
    pub fn remaining_pages(&self) -> u64 {
        self.remaining.load(AtomicOrdering::Acquire)
    }

    fn take_one(&self) -> bool {
        self.remaining
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Drop for ExtentReservation {
    fn drop(&mut self) {
        let left = self.remaining.swap(0, AtomicOrdering::AcqRel);
        self.space.release(left);
    }
}
