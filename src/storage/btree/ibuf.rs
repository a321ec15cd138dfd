//! Insert buffering for secondary indexes.
//!
//! Inserts into a non-resident leaf of a non-unique secondary index may be
//! parked here instead of reading the page. Each leaf carries two "free bits"
//! that bound how much can be parked for it.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::types::{page as fil, CairnError, IndexId, PageId, Result, FIL_NULL};

use super::engine::IndexEngine;
use super::index::Index;
use super::latch::{peek, LeafLatchPlan};
use super::page::{self, PageSearchMode};
use super::rec::{self, Tuple};

const FREE_SPACE_PER_BIT_DIVISOR: usize = 32;

/// Free-space class (0..=3) for a page whose largest insertable record after
/// reorganizing is `max_ins_size` bytes.
pub fn calc_free_bits(page_size: usize, max_ins_size: usize) -> u8 {
    let n = max_ins_size / (page_size / FREE_SPACE_PER_BIT_DIVISOR);
    match n {
        0..=2 => n as u8,
        3 => 2,
        _ => 3,
    }
}

/// Bytes guaranteed free for a page in class `bits`.
pub fn free_from_bits(page_size: usize, bits: u8) -> usize {
    let unit = page_size / FREE_SPACE_PER_BIT_DIVISOR;
    if bits >= 3 {
        4 * unit
    } else {
        bits as usize * unit
    }
}

/// Deferred insert store consulted by the search engine.
pub trait InsertBuffer: Send + Sync {
    /// Parks `entry` for `page`; returns false when it cannot be taken.
    fn buffer_insert(&self, index: &Index, page: PageId, page_size: usize, entry: &Tuple) -> bool;
    /// Refreshes the free bits of a leaf.
    fn update_free_bits(&self, page: PageId, page_size: usize, max_ins_size: usize);
    /// Forgets the free bits of a leaf whose contents moved.
    fn reset_free_bits(&self, page: PageId);
    /// True when entries are parked for `page`.
    fn has_buffered(&self, page: PageId) -> bool;
    /// Removes and returns the entries parked for `page`.
    fn take_buffered(&self, page: PageId) -> Vec<(IndexId, Tuple)>;
}

/// Insert buffer that never takes anything.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoInsertBuffer;

impl InsertBuffer for NoInsertBuffer {
    fn buffer_insert(&self, _index: &Index, _page: PageId, _page_size: usize, _entry: &Tuple) -> bool {
        false
    }
    fn update_free_bits(&self, _page: PageId, _page_size: usize, _max_ins_size: usize) {}
    fn reset_free_bits(&self, _page: PageId) {}
    fn has_buffered(&self, _page: PageId) -> bool {
        false
    }
    fn take_buffered(&self, _page: PageId) -> Vec<(IndexId, Tuple)> {
        Vec::new()
    }
}

#[derive(Default)]
struct IbufState {
    bits: FxHashMap<PageId, u8>,
    buffered: FxHashMap<PageId, Vec<(IndexId, Tuple)>>,
}

/// In-memory insert buffer.
#[derive(Default)]
pub struct MemInsertBuffer {
    state: Mutex<IbufState>,
}

impl MemInsertBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Free bits recorded for `page`.
    pub fn free_bits(&self, page: PageId) -> u8 {
        self.state.lock().bits.get(&page).copied().unwrap_or(0)
    }

    /// Entries parked across all pages.
    pub fn len(&self) -> usize {
        self.state.lock().buffered.values().map(Vec::len).sum()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl InsertBuffer for MemInsertBuffer {
    fn buffer_insert(&self, index: &Index, page: PageId, page_size: usize, entry: &Tuple) -> bool {
        let mut state = self.state.lock();
        let bits = state.bits.get(&page).copied().unwrap_or(0);
        let parked: usize = state
            .buffered
            .get(&page)
            .map(|v| v.iter().map(|(_, t)| rec::converted_size(t) + page::SLOT_SIZE).sum())
            .unwrap_or(0);
        let needed = rec::converted_size(entry) + page::SLOT_SIZE;
        if parked + needed > free_from_bits(page_size, bits) {
            return false;
        }
        state
            .buffered
            .entry(page)
            .or_default()
            .push((index.id, entry.clone()));
        true
    }

    fn update_free_bits(&self, page: PageId, page_size: usize, max_ins_size: usize) {
        self.state
            .lock()
            .bits
            .insert(page, calc_free_bits(page_size, max_ins_size));
    }

    fn reset_free_bits(&self, page: PageId) {
        self.state.lock().bits.remove(&page);
    }

    fn has_buffered(&self, page: PageId) -> bool {
        self.state
            .lock()
            .buffered
            .get(&page)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    fn take_buffered(&self, page: PageId) -> Vec<(IndexId, Tuple)> {
        self.state.lock().buffered.remove(&page).unwrap_or_default()
    }
}

impl IndexEngine {
    /// Applies every entry parked for leaf `page` of `index`.
    ///
    /// An entry equal to a delete-marked record unmarks it; anything else is
    /// inserted in key order. Returns the number of entries applied.
    pub fn merge_insert_buffer(&self, index: &Index, page_id: PageId) -> Result<usize> {
        let entries = self.ibuf().take_buffered(page_id);
        if entries.is_empty() {
            return Ok(0);
        }
        let mut mtr = self.start_mtr();
        mtr.latch_page(page_id, RwLatch::Exclusive)?;
        let mut applied = 0;
        for (index_id, entry) in entries {
            if index_id != index.id {
                return Err(CairnError::Invalid("buffered entry belongs to another index"));
            }
            self.merge_one(&mut mtr, index, page_id, &entry)?;
            applied += 1;
        }
        let max_ins = page::max_insert_size_after_reorganize(mtr.page(page_id)?);
        self.ibuf().update_free_bits(page_id, mtr.page_size(), max_ins);
        mtr.commit()?;
        debug!(target: "cairn::btree::insert", page = %page_id, applied, "merged insert buffer");
        Ok(applied)
    }

    /// Applies the entries parked for leaf `page_id` before `mtr` reads it.
    ///
    /// With the page already X-latched in `mtr` the entries go in through
    /// that latch; with no latch held a separate mini-transaction applies
    /// them. A page `mtr` holds shared is left alone.
    pub(crate) fn merge_if_buffered(&self, index: &Index, page_id: PageId, mtr: &mut Mtr) -> Result<usize> {
        if !index.is_ibuf_eligible() || !self.ibuf().has_buffered(page_id) {
            return Ok(0);
        }
        match mtr.held_latch(page_id) {
            None => self.merge_insert_buffer(index, page_id),
            Some(RwLatch::Exclusive) => {
                let entries = self.ibuf().take_buffered(page_id);
                let applied = entries.len();
                for (index_id, entry) in entries {
                    if index_id != index.id {
                        return Err(CairnError::Invalid("buffered entry belongs to another index"));
                    }
                    self.merge_one(mtr, index, page_id, &entry)?;
                }
                let max_ins = page::max_insert_size_after_reorganize(mtr.page(page_id)?);
                self.ibuf().update_free_bits(page_id, mtr.page_size(), max_ins);
                debug!(target: "cairn::btree::insert", page = %page_id, applied, "merged insert buffer in place");
                Ok(applied)
            }
            Some(_) => Ok(0),
        }
    }

    /// Applies parked entries for the leaves a `plan` latch on `target`
    /// covers, left to right.
    pub(crate) fn merge_for_plan(&self, index: &Index, plan: LeafLatchPlan, target: PageId, mtr: &mut Mtr) -> Result<()> {
        if !index.is_ibuf_eligible() {
            return Ok(());
        }
        if plan.wants_left() || plan.wants_right() {
            let (prev, next) = peek(mtr, target, |frame| (fil::prev(frame), fil::next(frame)))?;
            if plan.wants_left() && prev != FIL_NULL {
                self.merge_if_buffered(index, index.page_id(prev), mtr)?;
            }
            self.merge_if_buffered(index, target, mtr)?;
            if plan.wants_right() && next != FIL_NULL {
                self.merge_if_buffered(index, index.page_id(next), mtr)?;
            }
            return Ok(());
        }
        self.merge_if_buffered(index, target, mtr).map(|_| ())
    }

    fn merge_one(&self, mtr: &mut Mtr, index: &Index, page_id: PageId, entry: &Tuple) -> Result<()> {
        let frame = mtr.page(page_id)?;
        page::check_index_page(frame)?;
        let m = page::search_with_match(frame, entry, index.n_uniq, PageSearchMode::LE)?;
        let n_cmp = entry.n_fields_cmp.min(index.n_uniq);
        if m.pos > 0 && m.low_match >= n_cmp {
            let rec = page::rec_at(frame, m.pos)?;
            if rec.is_deleted() {
                let offset = rec.offset;
                self.del_unmark_for_ibuf(mtr, page_id, offset)?;
                return Ok(());
            }
        }
        let frame = mtr.page_mut(page_id)?;
        if page::insert_after(frame, m.pos, entry)?.is_none() {
            page::reorganize(frame)?;
            if page::insert_after(frame, m.pos, entry)?.is_none() {
                return Err(CairnError::Corruption("buffered insert does not fit its page"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_bits_follow_size_classes() {
        assert_eq!(calc_free_bits(16384, 100), 0);
        assert_eq!(calc_free_bits(16384, 600), 1);
        assert_eq!(calc_free_bits(16384, 1600), 2);
        assert_eq!(calc_free_bits(16384, 2100), 3);
        assert_eq!(free_from_bits(16384, 3), 2048);
        assert_eq!(free_from_bits(16384, 1), 512);
    }
}
