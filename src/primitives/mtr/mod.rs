#![forbid(unsafe_code)]
//! Mini-transactions: a memo of held latches plus the redo they produce.
//!
//! Every page change happens under a latch recorded here. `commit` appends
//! the collected redo as one group, stamps LSN and checksum on each modified
//! page, then releases latches in reverse acquisition order.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::primitives::concurrency::{RwLatch, TreeLatch, TreeReadGuard, TreeWriteGuard};
use crate::primitives::pager::{ExtentReservation, FetchMode, PageLatch, PageStore};
use crate::types::{page, stamp_page_checksum, CairnError, IndexId, Lsn, PageId, Result, SpaceId};

/// Redo kind for a full page image.
pub const MLOG_PAGE_IMAGE: u8 = 0x01;
/// Length of the `kind | space | page_no` envelope in front of every record.
pub const REDO_ENVELOPE_LEN: usize = 9;

enum MemoSlot {
    TreeS {
        index: IndexId,
        _guard: TreeReadGuard,
    },
    TreeX {
        index: IndexId,
        _guard: TreeWriteGuard,
    },
    Page {
        id: PageId,
        latch: PageLatch,
        dirty: bool,
        image: bool,
    },
    Released,
}

/// One atomic unit of page changes.
pub struct Mtr {
    store: Arc<dyn PageStore>,
    memo: Vec<MemoSlot>,
    log: Vec<u8>,
    n_records: usize,
    freed: Vec<PageId>,
    reservation: Option<ExtentReservation>,
}

impl Mtr {
    /// Starts an empty mini-transaction against `store`.
    pub fn start(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            memo: Vec::new(),
            log: Vec::new(),
            n_records: 0,
            freed: Vec::new(),
            reservation: None,
        }
    }

    /// Page store this mini-transaction latches from.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Page size of the underlying store.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Position in the memo; later acquisitions can be released back to it.
    pub fn savepoint(&self) -> usize {
        self.memo.len()
    }

    /// Takes the tree latch shared.
    pub fn s_lock_tree(&mut self, index: IndexId, tree: &TreeLatch) {
        let guard = tree.s_lock();
        self.memo.push(MemoSlot::TreeS {
            index,
            _guard: guard,
        });
    }

    /// Takes the tree latch exclusively.
    pub fn x_lock_tree(&mut self, index: IndexId, tree: &TreeLatch) {
        let guard = tree.x_lock();
        self.memo.push(MemoSlot::TreeX {
            index,
            _guard: guard,
        });
    }

    /// True when this mini-transaction holds the tree latch of `index` exclusively.
    pub fn holds_tree_x(&self, index: IndexId) -> bool {
        self.memo
            .iter()
            .any(|slot| matches!(slot, MemoSlot::TreeX { index: i, .. } if *i == index))
    }

    /// True when this mini-transaction holds the tree latch of `index` in any mode.
    pub fn holds_tree_latch(&self, index: IndexId) -> bool {
        self.memo.iter().any(|slot| {
            matches!(slot, MemoSlot::TreeX { index: i, .. } | MemoSlot::TreeS { index: i, .. } if *i == index)
        })
    }

    /// Latches a page, reusing a latch already in the memo.
    ///
    /// Returns `false` only for an `IfResident` miss. Asking for X on a page
    /// this mini-transaction holds S is rejected: the upgrade would deadlock.
    pub fn latch(&mut self, id: PageId, latch: RwLatch, fetch: FetchMode) -> Result<bool> {
        if let Some(held) = self.held_latch(id) {
            if held.covers(latch) {
                return Ok(true);
            }
            return Err(CairnError::Invalid("page latch upgrade inside one mini-transaction"));
        }
        match self.store.latch_page(id, latch, fetch)? {
            Some(guard) => {
                self.memo.push(MemoSlot::Page {
                    id,
                    latch: guard,
                    dirty: false,
                    image: false,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Latches a page with `FetchMode::Normal`.
    pub fn latch_page(&mut self, id: PageId, latch: RwLatch) -> Result<()> {
        self.latch(id, latch, FetchMode::Normal).map(|_| ())
    }

    /// Strength of the latch held on `id`, if any.
    pub fn held_latch(&self, id: PageId) -> Option<RwLatch> {
        self.memo.iter().find_map(|slot| match slot {
            MemoSlot::Page { id: pid, latch, .. } if *pid == id => Some(latch.mode()),
            _ => None,
        })
    }

    /// Releases the single memo entry at `savepoint`.
    ///
    /// Modified pages stay latched until commit.
    pub fn release_at_savepoint(&mut self, savepoint: usize) {
        if let Some(slot) = self.memo.get_mut(savepoint) {
            let keep = matches!(slot, MemoSlot::Page { dirty: true, .. });
            if !keep {
                *slot = MemoSlot::Released;
            }
        }
    }

    /// Releases every unmodified entry acquired since `savepoint`.
    pub fn rollback_to_savepoint(&mut self, savepoint: usize) {
        for idx in (savepoint..self.memo.len()).rev() {
            self.release_at_savepoint(idx);
        }
    }

    /// Releases the latch on `id` if the page is unmodified.
    pub fn release_page(&mut self, id: PageId) {
        if let Some(pos) = self
            .memo
            .iter()
            .position(|slot| matches!(slot, MemoSlot::Page { id: pid, .. } if *pid == id))
        {
            self.release_at_savepoint(pos);
        }
    }

    fn slot(&self, id: PageId) -> Result<&PageLatch> {
        self.memo
            .iter()
            .find_map(|slot| match slot {
                MemoSlot::Page { id: pid, latch, .. } if *pid == id => Some(latch),
                _ => None,
            })
            .ok_or(CairnError::Corruption("page not latched in mini-transaction"))
    }

    fn slot_mut(&mut self, id: PageId, image: bool) -> Result<&mut [u8]> {
        for slot in self.memo.iter_mut() {
            if let MemoSlot::Page {
                id: pid,
                latch,
                dirty,
                image: img,
            } = slot
            {
                if *pid == id {
                    let data = latch
                        .data_mut()
                        .ok_or(CairnError::Corruption("page modified under a shared latch"))?;
                    *dirty = true;
                    *img |= image;
                    return Ok(data);
                }
            }
        }
        Err(CairnError::Corruption("page not latched in mini-transaction"))
    }

    /// Read access to a latched page.
    pub fn page(&self, id: PageId) -> Result<&[u8]> {
        self.slot(id).map(PageLatch::data)
    }

    /// Write access; the full page image is logged at commit.
    pub fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]> {
        self.slot_mut(id, true)
    }

    /// Write access for changes the caller logs with a compact record.
    pub fn page_mut_compact(&mut self, id: PageId) -> Result<&mut [u8]> {
        self.slot_mut(id, false)
    }

    /// Appends a redo record addressed to `id`.
    pub fn log_record(&mut self, kind: u8, id: PageId, body: &[u8]) {
        self.log.push(kind);
        self.log.extend_from_slice(&id.space.0.to_be_bytes());
        self.log.extend_from_slice(&id.page_no.to_be_bytes());
        self.log.extend_from_slice(body);
        self.n_records += 1;
    }

    /// Number of records logged so far.
    pub fn n_log_records(&self) -> usize {
        self.n_records
    }

    /// Allocates a page, drawing on the attached reservation when present.
    pub fn allocate_page(&mut self, space: SpaceId, hint: Option<u32>) -> Result<PageId> {
        let (id, latch) = self
            .store
            .allocate_page(space, hint, self.reservation.as_ref())?;
        self.memo.push(MemoSlot::Page {
            id,
            latch,
            dirty: true,
            image: true,
        });
        Ok(id)
    }

    /// Frees an X-latched page once the mini-transaction commits.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        let mut found = false;
        for slot in self.memo.iter_mut() {
            if let MemoSlot::Page {
                id: pid,
                latch,
                dirty,
                image,
            } = slot
            {
                if *pid == id {
                    if latch.mode() != RwLatch::Exclusive {
                        return Err(CairnError::Corruption("freeing a page without an X latch"));
                    }
                    *dirty = false;
                    *image = false;
                    found = true;
                }
            }
        }
        if !found {
            return Err(CairnError::Corruption("page not latched in mini-transaction"));
        }
        self.freed.push(id);
        Ok(())
    }

    /// Pages scheduled to be freed at commit.
    pub fn is_freed(&self, id: PageId) -> bool {
        self.freed.contains(&id)
    }

    /// Attaches an extent reservation; allocations draw from it until commit.
    pub fn attach_reservation(&mut self, reservation: ExtentReservation) {
        self.reservation = Some(reservation);
    }

    /// Currently attached reservation.
    pub fn reservation(&self) -> Option<&ExtentReservation> {
        self.reservation.as_ref()
    }

    /// Detaches the reservation so the caller can release it.
    pub fn take_reservation(&mut self) -> Option<ExtentReservation> {
        self.reservation.take()
    }

    /// Writes the redo group, stamps modified pages and releases all latches.
    pub fn commit(mut self) -> Result<Lsn> {
        let mut images = Vec::new();
        for slot in &self.memo {
            if let MemoSlot::Page {
                id,
                latch,
                dirty: true,
                image: true,
            } = slot
            {
                let data = latch.data();
                let mut body = Vec::with_capacity(4 + data.len());
                body.extend_from_slice(&(data.len() as u32).to_be_bytes());
                body.extend_from_slice(data);
                images.push((*id, body));
            }
        }
        for (id, body) in images {
            self.log_record(MLOG_PAGE_IMAGE, id, &body);
        }
        let lsn = if self.log.is_empty() {
            self.store.redo().current_lsn()
        } else {
            self.store.redo().append_group(&self.log)?
        };
        for slot in self.memo.iter_mut() {
            if let MemoSlot::Page {
                latch, dirty: true, ..
            } = slot
            {
                if let Some(buf) = latch.data_mut() {
                    page::set_lsn(buf, lsn.0);
                    stamp_page_checksum(buf);
                }
            }
        }
        trace!(
            target: "cairn::mtr",
            lsn = lsn.0,
            records = self.n_records,
            latches = self.memo.len(),
            "mini-transaction committed"
        );
        self.log.clear();
        self.release_all();
        let freed = std::mem::take(&mut self.freed);
        for id in freed {
            self.store.free_page(id)?;
        }
        self.reservation = None;
        Ok(lsn)
    }

    fn release_all(&mut self) {
        while let Some(slot) = self.memo.pop() {
            drop(slot);
        }
    }
}

impl Drop for Mtr {
    fn drop(&mut self) {
        if !self.log.is_empty()
            || self
                .memo
                .iter()
                .any(|slot| matches!(slot, MemoSlot::Page { dirty: true, .. }))
        {
            warn!(target: "cairn::mtr", "mini-transaction dropped without commit");
        }
        self.release_all();
    }
}
