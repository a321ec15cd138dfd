//! Row-level driver over the cursor operations.
//!
//! Each call runs the usual ladder: an optimistic attempt in a leaf-latched
//! mini-transaction, then a pessimistic retry under the tree latch, then
//! the off-page store of any converted fields in the same mini-transaction.
//! Extents for off-page fields are reserved up front, so a store never runs
//! out of space halfway.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::ReserveClass;
use crate::storage::txn::TxnCtx;
use crate::types::{page as fil, CairnError, PageId, Result, FIL_NULL};

use super::cursor::{BtrCursor, CursorFlag, LatchMode, LatchRequest};
use super::engine::{IndexEngine, OpFlags};
use super::error::{DeleteError, InsertError, UpdateError};
use super::index::Index;
use super::overflow::{needs_big_rec, BigRec};
use super::page::{self, PageSearchMode};
use super::rec::{self, Tuple, REC_INFO_DELETED};
use super::update::{UpdateVector, UPD_NODE_NO_ORD_CHANGE};

/// Update vector for one record and the record it would produce, unchanged
/// external fields still as local references.
struct StagedUpdate {
    update: UpdateVector,
    entry: Tuple,
}

/// What a positioned search found under the cursor.
enum Existing {
    Absent,
    Live,
    DeleteMarked,
}

fn exact_match(cursor: &BtrCursor, key: &Tuple, mtr: &Mtr) -> Result<Existing> {
    let n_cmp = key.n_fields_cmp.min(cursor.index.n_uniq);
    let frame = mtr.page(cursor.page_id())?;
    let pos = cursor.pos();
    if n_cmp == 0 || pos == 0 || pos > page::n_recs(frame) || cursor.low_match < n_cmp {
        return Ok(Existing::Absent);
    }
    if page::rec_at(frame, pos)?.is_deleted() {
        Ok(Existing::DeleteMarked)
    } else {
        Ok(Existing::Live)
    }
}

impl IndexEngine {
    fn position(&self, index: &Arc<Index>, key: &Tuple, latch: LatchRequest, mtr: &mut Mtr) -> Result<BtrCursor> {
        let mut cursor = BtrCursor::new(Arc::clone(index));
        self.search_to_nth_level(&mut cursor, 0, key, PageSearchMode::LE, latch, None, mtr)?;
        Ok(cursor)
    }

    /// Reserves extents for the blob pages `entry` would need, plus the
    /// usual headroom for a split, and attaches them to `mtr`.
    fn reserve_for_big_rec(&self, index: &Index, entry: &Tuple, mtr: &mut Mtr) -> Result<()> {
        if !needs_big_rec(entry, mtr.page_size()) {
            return Ok(());
        }
        let mut converted = entry.clone();
        let Some(big) = self.convert_big_rec(index, &mut converted) else {
            return Ok(());
        };
        let space = self.store().space(index.space)?;
        let pages = big.n_pages(mtr.page_size()) as u32;
        let n_extents = pages.div_ceil(space.extent_pages()) + 3;
        mtr.attach_reservation(space.reserve(n_extents, ReserveClass::Normal)?);
        Ok(())
    }

    /// Inserts a leaf entry.
    ///
    /// A live record with the same unique fields is a duplicate and is
    /// reported as `Storage(Invalid)`. A delete-marked one is revived: a
    /// clustered record takes the new field values, a secondary record
    /// only loses its mark. Secondary entries for pages not in memory may
    /// go to the insert buffer.
    pub fn insert_entry(&self, index: &Arc<Index>, entry: Tuple, ctx: TxnCtx) -> std::result::Result<(), InsertError> {
        let mut entry = entry;
        if rec::node_ptr_size(&entry, index.n_uniq) > page::max_rec_size(self.page_size()) {
            return Err(InsertError::RecordTooBig);
        }
        let mut latch = LatchRequest::new(LatchMode::ModifyLeaf);
        if index.is_ibuf_eligible() {
            latch = latch.insert_planned();
        }

        let mut mtr = self.start_mtr();
        self.reserve_for_big_rec(index, &entry, &mut mtr)?;
        let mut cursor = self.position(index, &entry, latch, &mut mtr)?;
        if cursor.flag == CursorFlag::InsertBuffered {
            mtr.commit()?;
            return Ok(());
        }
        let mut inserted = false;
        let first = match self.revive_or_reject(&cursor, &entry, ctx, &mut mtr)? {
            Some(done) => done,
            None => match self.optimistic_insert(OpFlags::NONE, &mut cursor, &mut entry, ctx, &mut mtr) {
                Ok(out) => {
                    inserted = true;
                    self.store_pending(&mut mtr, index, out.page, out.offset, out.big_rec.as_ref())
                        .map_err(InsertError::from)
                }
                Err(err) => Err(err),
            },
        };
        mtr.commit()?;
        match first {
            Err(InsertError::RequiresSplit) => {}
            other => {
                if inserted && other.is_ok() {
                    self.count_row(index, 1);
                }
                return other;
            }
        }

        let mut mtr = self.start_mtr();
        self.reserve_for_big_rec(index, &entry, &mut mtr)?;
        let mut cursor = self.position(index, &entry, LatchRequest::new(LatchMode::ModifyTree), &mut mtr)?;
        let mut inserted = false;
        let second = match self.revive_or_reject(&cursor, &entry, ctx, &mut mtr)? {
            Some(done) => done,
            None => match self.pessimistic_insert(OpFlags::NONE, &mut cursor, &mut entry, ctx, &mut mtr) {
                Ok(out) => {
                    inserted = true;
                    self.store_pending(&mut mtr, index, out.page, out.offset, out.big_rec.as_ref())
                        .map_err(InsertError::from)
                }
                Err(err) => Err(err),
            },
        };
        mtr.commit()?;
        if inserted && second.is_ok() {
            self.count_row(index, 1);
        }
        second
    }

    fn store_pending(
        &self,
        mtr: &mut Mtr,
        index: &Index,
        page_id: PageId,
        offset: usize,
        big: Option<&BigRec>,
    ) -> Result<()> {
        match big {
            Some(big) => self.store_big_rec_extern_fields(mtr, index, page_id, offset, big),
            None => Ok(()),
        }
    }

    /// Handles an existing record with the entry's key. `None` means the
    /// key is free and the insert should proceed.
    fn revive_or_reject(
        &self,
        cursor: &BtrCursor,
        entry: &Tuple,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> Result<Option<std::result::Result<(), InsertError>>> {
        match exact_match(cursor, entry, mtr)? {
            Existing::Absent => Ok(None),
            Existing::Live => Ok(Some(Err(InsertError::Storage(CairnError::Invalid("duplicate key"))))),
            Existing::DeleteMarked if cursor.index.is_clustered() => {
                let old = page::rec_at(mtr.page(cursor.page_id())?, cursor.pos())?.to_tuple();
                let mut update = UpdateVector::diff(&cursor.index, &old, entry);
                update.info_bits = old.info_bits & !REC_INFO_DELETED;
                let mut cursor = cursor.clone();
                let outcome = match self.optimistic_update(OpFlags::NONE, &mut cursor, &update, ctx, mtr) {
                    Ok(()) => Ok(()),
                    Err(UpdateError::Overflow | UpdateError::Underflow) if mtr.holds_tree_x(cursor.index.id) => {
                        match self.pessimistic_update(OpFlags::NONE, &mut cursor, &update, ctx, mtr) {
                            Ok(out) => self
                                .store_pending(mtr, &cursor.index, out.page, out.offset, out.big_rec.as_ref())
                                .map_err(InsertError::from),
                            Err(err) => Err(revive_error(err)),
                        }
                    }
                    Err(err) => Err(revive_error(err)),
                };
                Ok(Some(outcome))
            }
            Existing::DeleteMarked => Ok(Some(
                self.del_mark_set_sec_rec(OpFlags::NONE, cursor, false, ctx, mtr)
                    .map_err(|err| match err {
                        DeleteError::LockWait => InsertError::LockWait,
                        DeleteError::OutOfFileSpace => InsertError::OutOfFileSpace,
                        DeleteError::Storage(e) => InsertError::Storage(e),
                    }),
            )),
        }
    }

    /// Replaces the row with `key` by `new_row`. Returns `false` when no
    /// record has that key. Ordering fields must not change.
    pub fn update_entry(
        &self,
        index: &Arc<Index>,
        key: &Tuple,
        new_row: Tuple,
        ctx: TxnCtx,
    ) -> std::result::Result<bool, UpdateError> {
        let mut mtr = self.start_mtr();
        let mut cursor = self.position(index, key, LatchRequest::new(LatchMode::ModifyLeaf), &mut mtr)?;
        let Some(staged) = self.build_update(&cursor, key, &new_row, &mut mtr)? else {
            mtr.commit()?;
            return Ok(false);
        };
        match self.optimistic_update(OpFlags::NONE, &mut cursor, &staged.update, ctx, &mut mtr) {
            Ok(()) => {
                mtr.commit()?;
                return Ok(true);
            }
            Err(UpdateError::Overflow | UpdateError::Underflow) => mtr.commit()?,
            Err(err) => {
                mtr.commit()?;
                return Err(err);
            }
        };

        let mut mtr = self.start_mtr();
        // Fields already off-page keep their chains; only new ones need room.
        self.reserve_for_big_rec(index, &staged.entry, &mut mtr)?;
        let mut cursor = self.position(index, key, LatchRequest::new(LatchMode::ModifyTree), &mut mtr)?;
        let Some(staged) = self.build_update(&cursor, key, &new_row, &mut mtr)? else {
            mtr.commit()?;
            return Ok(false);
        };
        let result = self
            .pessimistic_update(OpFlags::NONE, &mut cursor, &staged.update, ctx, &mut mtr)
            .and_then(|out| {
                self.store_pending(&mut mtr, index, out.page, out.offset, out.big_rec.as_ref())
                    .map_err(UpdateError::from)
            });
        mtr.commit()?;
        result.map(|()| true)
    }

    /// Diffs `new_row` against the record under the cursor. External
    /// fields are read through the leaf latch held in `mtr`.
    fn build_update(
        &self,
        cursor: &BtrCursor,
        key: &Tuple,
        new_row: &Tuple,
        mtr: &mut Mtr,
    ) -> Result<Option<StagedUpdate>> {
        if matches!(exact_match(cursor, key, mtr)?, Existing::Absent) {
            return Ok(None);
        }
        let old = page::rec_at(mtr.page(cursor.page_id())?, cursor.pos())?.to_tuple();
        if new_row.n_fields() != old.n_fields() {
            return Err(CairnError::Invalid("row field count does not match the index"));
        }
        let full = self.fetch_full_tuple(mtr, &old)?;
        let mut update = UpdateVector::diff(&cursor.index, &full, new_row);
        if update.cmpl_info & UPD_NODE_NO_ORD_CHANGE == 0 {
            return Err(CairnError::Invalid("update changes ordering fields"));
        }
        update.info_bits = old.info_bits;
        let entry = update.apply_to(&old).map_err(CairnError::from)?;
        Ok(Some(StagedUpdate { update, entry }))
    }

    /// Sets the delete mark on the record with `key`. Returns `false` when
    /// no record has that key.
    pub fn delete_mark_entry(&self, index: &Arc<Index>, key: &Tuple, ctx: TxnCtx) -> std::result::Result<bool, DeleteError> {
        let mut mtr = self.start_mtr();
        let cursor = self.position(index, key, LatchRequest::new(LatchMode::ModifyLeaf), &mut mtr)?;
        let found = !matches!(exact_match(&cursor, key, &mtr)?, Existing::Absent);
        let result = if !found {
            Ok(())
        } else if index.is_clustered() {
            self.del_mark_set_clust_rec(OpFlags::NONE, &cursor, true, ctx, &mut mtr)
        } else {
            self.del_mark_set_sec_rec(OpFlags::NONE, &cursor, true, ctx, &mut mtr)
        };
        mtr.commit()?;
        result.map(|()| found)
    }

    /// Physically removes the record with `key`, delete-marked or not.
    /// Returns `false` when no record has that key.
    pub fn purge_entry(&self, index: &Arc<Index>, key: &Tuple) -> std::result::Result<bool, DeleteError> {
        let mut mtr = self.start_mtr();
        let cursor = self.position(index, key, LatchRequest::new(LatchMode::ModifyLeaf), &mut mtr)?;
        if matches!(exact_match(&cursor, key, &mtr)?, Existing::Absent) {
            mtr.commit()?;
            return Ok(false);
        }
        let removed = self.optimistic_delete(&cursor, &mut mtr);
        mtr.commit()?;
        if removed? {
            self.count_row(index, -1);
            return Ok(true);
        }

        let mut mtr = self.start_mtr();
        let mut cursor = self.position(index, key, LatchRequest::new(LatchMode::ModifyTree), &mut mtr)?;
        if matches!(exact_match(&cursor, key, &mtr)?, Existing::Absent) {
            mtr.commit()?;
            return Ok(false);
        }
        let result = self.pessimistic_delete(&mut cursor, &mut mtr);
        mtr.commit()?;
        result?;
        self.count_row(index, -1);
        trace!(target: "cairn::btree::delete", index = %index.name, "purged through the tree path");
        Ok(true)
    }

    /// Reads the record with `key`, external fields reassembled. The
    /// record may carry a delete mark; check `info_bits`.
    ///
    pub fn lookup(&self, index: &Arc<Index>, key: &Tuple) -> Result<Option<Tuple>> {
        let mut mtr = self.start_mtr();
        let cursor = self.position(index, key, LatchRequest::new(LatchMode::SearchLeaf), &mut mtr)?;
        let found = match exact_match(&cursor, key, &mtr)? {
            Existing::Absent => None,
            _ => {
                let local = page::rec_at(mtr.page(cursor.page_id())?, cursor.pos())?.to_tuple();
                Some(self.fetch_full_tuple(&mut mtr, &local)?)
            }
        };
        mtr.commit()?;
        Ok(found)
    }

    /// Calls `f` on every leaf record in key order, external fields left
    /// as local prefixes with their references.
    ///
    /// Leaves are S-latched one at a time, left to right; entries parked in
    /// the insert buffer for a leaf are merged before it is read.
    pub fn for_each_entry(&self, index: &Arc<Index>, mut f: impl FnMut(&Tuple) -> Result<()>) -> Result<()> {
        let mut mtr = self.start_mtr();
        let mut cursor = BtrCursor::new(Arc::clone(index));
        self.open_at_index_side(true, &mut cursor, LatchMode::SearchLeaf, None, &mut mtr)?;
        let mut page_id = cursor.page_id();
        let mut pages = 0usize;
        loop {
            let next = {
                let frame = mtr.page(page_id)?;
                for rec in page::records(frame)? {
                    f(&rec.to_tuple())?;
                }
                fil::next(frame)
            };
            pages += 1;
            if next == FIL_NULL {
                break;
            }
            let next_id = index.page_id(next);
            self.merge_if_buffered(index, next_id, &mut mtr)?;
            mtr.latch_page(next_id, RwLatch::Shared)?;
            mtr.release_page(page_id);
            page_id = next_id;
        }
        mtr.commit()?;
        debug!(target: "cairn::btree::search", index = %index.name, pages, "leaf scan");
        Ok(())
    }

    /// Every leaf record in key order.
    pub fn collect_entries(&self, index: &Arc<Index>) -> Result<Vec<Tuple>> {
        let mut out = Vec::new();
        self.for_each_entry(index, |t| {
            out.push(t.clone());
            Ok(())
        })?;
        Ok(out)
    }

    fn count_row(&self, index: &Index, delta: i64) {
        if index.is_clustered() {
            index.adjust_stat_n_rows(delta);
        }
    }
}

fn revive_error(err: UpdateError) -> InsertError {
    match err {
        UpdateError::LockWait => InsertError::LockWait,
        UpdateError::RecordTooBig => InsertError::RecordTooBig,
        UpdateError::Overflow | UpdateError::Underflow => InsertError::RequiresSplit,
        UpdateError::OutOfFileSpace => InsertError::OutOfFileSpace,
        UpdateError::Storage(e) => InsertError::Storage(e),
    }
}
