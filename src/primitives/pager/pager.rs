use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use super::frame::{Frame, PageLatch};
use super::space::{ExtentReservation, FileSpace};
use crate::primitives::concurrency::RwLatch;
use crate::primitives::wal::RedoLog;
use crate::types::{
    page::{self, PageKind, MAX_PAGE_SIZE, MIN_PAGE_SIZE},
    verify_page_checksum, CairnError, PageId, Result, SpaceId,
};

/// How a fetch treats pages that are not memory-resident.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FetchMode {
    /// Read the page in if needed.
    Normal,
    /// Return `None` instead of reading the page.
    IfResident,
}

/// Snapshot of pager counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct PagerStats {
    /// Fetches that had to bring a page back into memory.
    pub page_reads: u64,
    /// `IfResident` fetches that found the page absent.
    pub resident_misses: u64,
    /// Pages allocated.
    pub allocations: u64,
    /// Pages freed.
    pub frees: u64,
}

/// Page accessor consumed by the cursor engine.
pub trait PageStore: Send + Sync + 'static {
    /// Returns the page size in bytes.
    fn page_size(&self) -> usize;
    /// Latches a page; `None` only for `FetchMode::IfResident` misses.
    fn latch_page(&self, id: PageId, latch: RwLatch, fetch: FetchMode) -> Result<Option<PageLatch>>;
    /// Allocates a zeroed page, returned X-latched.
    fn allocate_page(
        &self,
        space: SpaceId,
        hint: Option<u32>,
        reservation: Option<&ExtentReservation>,
    ) -> Result<(PageId, PageLatch)>;
    /// Returns a page to its space.
    fn free_page(&self, id: PageId) -> Result<()>;
    /// Looks up a tablespace.
    fn space(&self, id: SpaceId) -> Result<Arc<FileSpace>>;
    /// Redo sink for committed mini-transactions.
    fn redo(&self) -> &RedoLog;
    /// Returns true when the page is currently in memory.
    fn is_resident(&self, id: PageId) -> bool;
    /// Returns a snapshot of pager statistics.
    fn stats(&self) -> PagerStats;

    /// Enables or disables checksum verification on page reads.
    fn set_checksum_verification(&self, enabled: bool) {
        let _ = enabled;
    }

    /// Returns whether checksum verification is enabled.
    fn checksum_verification_enabled(&self) -> bool {
        true
    }
}

/// In-memory page store with simulated residency.
pub struct MemPager {
    page_size: usize,
    frames: Mutex<FxHashMap<PageId, Arc<Frame>>>,
    spaces: RwLock<FxHashMap<SpaceId, Arc<FileSpace>>>,
    redo: RedoLog,
    verify_checksums: AtomicBool,
    page_reads: AtomicU64,
    resident_misses: AtomicU64,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl MemPager {
    /// Creates a pager for pages of `page_size` bytes.
    pub fn new(page_size: u32) -> Result<Self> {
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(CairnError::Invalid("page size must be a power of two in 4K..=16K"));
        }
        Ok(Self {
            page_size: page_size as usize,
            frames: Mutex::new(FxHashMap::default()),
            spaces: RwLock::new(FxHashMap::default()),
            redo: RedoLog::new(),
            verify_checksums: AtomicBool::new(true),
            page_reads: AtomicU64::new(0),
            resident_misses: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Registers a tablespace limited to `limit_pages`.
    pub fn add_space(&self, id: SpaceId, limit_pages: u32, extent_pages: u32) -> Result<Arc<FileSpace>> {
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&id) {
            return Err(CairnError::Invalid("space already registered"));
        }
        let space = Arc::new(FileSpace::new(id, limit_pages, extent_pages));
        spaces.insert(id, Arc::clone(&space));
        debug!(target: "cairn::pager", space = id.0, limit_pages, "registered space");
        Ok(space)
    }

    /// Drops a page from memory. Returns false when the page is latched.
    pub fn evict(&self, id: PageId) -> bool {
        let Some(frame) = self.frames.lock().get(&id).cloned() else {
            return false;
        };
        if frame.buf.is_locked() {
            return false;
        }
        frame.set_resident(false);
        trace!(target: "cairn::pager", page = %id, "evicted page");
        true
    }

    /// Copies the current page image, bypassing latches held by others.
    pub fn snapshot_page(&self, id: PageId) -> Result<Vec<u8>> {
        let frame = self.frame(id)?;
        let guard = frame.buf.read();
        Ok(guard.to_vec())
    }

    fn frame(&self, id: PageId) -> Result<Arc<Frame>> {
        self.frames
            .lock()
            .get(&id)
            .cloned()
            .ok_or(CairnError::Corruption("page is not allocated"))
    }
}

impl PageStore for MemPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn latch_page(&self, id: PageId, latch: RwLatch, fetch: FetchMode) -> Result<Option<PageLatch>> {
        let frame = self.frame(id)?;
        if !frame.is_resident() {
            if fetch == FetchMode::IfResident {
                self.resident_misses.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(None);
            }
            self.page_reads.fetch_add(1, AtomicOrdering::Relaxed);
            if self.checksum_verification_enabled() {
                let guard = frame.buf.read();
                if !verify_page_checksum(&guard) {
                    warn!(target: "cairn::pager", page = %id, "checksum mismatch on read");
                    return Err(CairnError::Corruption("page checksum mismatch"));
                }
            }
            frame.set_resident(true);
        }
        Ok(Some(PageLatch::acquire(&frame, latch)))
    }

    fn allocate_page(
        &self,
        space: SpaceId,
        hint: Option<u32>,
        reservation: Option<&ExtentReservation>,
    ) -> Result<(PageId, PageLatch)> {
        let file_space = self.space(space)?;
        let page_no = file_space.allocate(hint, reservation)?;
        let id = PageId::new(space, page_no);
        let frame = Arc::new(Frame::new(self.page_size));
        let mut latch = PageLatch::acquire(&frame, RwLatch::Exclusive);
        if let Some(buf) = latch.data_mut() {
            page::format(buf, space.0, page_no, PageKind::Allocated);
        }
        self.frames.lock().insert(id, frame);
        self.allocations.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "cairn::pager", page = %id, ?hint, "allocated page");
        Ok((id, latch))
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        self.space(id.space)?.free(id.page_no)?;
        self.frames.lock().remove(&id);
        self.frees.fetch_add(1, AtomicOrdering::Relaxed);
        trace!(target: "cairn::pager", page = %id, "freed page");
        Ok(())
    }

    fn space(&self, id: SpaceId) -> Result<Arc<FileSpace>> {
        self.spaces.read().get(&id).cloned().ok_or(CairnError::NotFound)
    }

    fn redo(&self) -> &RedoLog {
        &self.redo
    }

    fn is_resident(&self, id: PageId) -> bool {
        self.frames
            .lock()
            .get(&id)
            .map(|f| f.is_resident())
            .unwrap_or(false)
    }

    fn stats(&self) -> PagerStats {
        PagerStats {
            page_reads: self.page_reads.load(AtomicOrdering::Relaxed),
            resident_misses: self.resident_misses.load(AtomicOrdering::Relaxed),
            allocations: self.allocations.load(AtomicOrdering::Relaxed),
            frees: self.frees.load(AtomicOrdering::Relaxed),
        }
    }

    fn set_checksum_verification(&self, enabled: bool) {
        self.verify_checksums.store(enabled, AtomicOrdering::Relaxed);
    }

    fn checksum_verification_enabled(&self) -> bool {
        self.verify_checksums.load(AtomicOrdering::Relaxed)
    }
}
