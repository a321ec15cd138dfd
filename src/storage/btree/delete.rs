//! Delete marking and physical record removal.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::ReserveClass;
use crate::storage::txn::{LockStatus, TxnCtx, UndoOp};
use crate::types::{page as fil, CairnError, PageId, Result, FIL_NULL};

use super::cursor::BtrCursor;
use super::engine::{IndexEngine, OpFlags};
use super::error::DeleteError;
#[cfg(debug_assertions)]
use super::index::Index;
use super::page;
use super::rec;
use super::redo::{self, SysFields};

impl IndexEngine {
    /// Sets or clears the delete mark of the clustered record under the
    /// cursor.
    ///
    /// Takes the row lock and writes a modify undo record first; unless
    /// `KEEP_SYS` is set the record's system fields are restamped.
    pub fn del_mark_set_clust_rec(
        &self,
        flags: OpFlags,
        cursor: &BtrCursor,
        val: bool,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> std::result::Result<(), DeleteError> {
        let index = &cursor.index;
        if !index.is_clustered() {
            return Err(CairnError::Invalid("clustered delete mark on a secondary index").into());
        }
        let page_id = cursor.page_id();
        let (offset, heap, image) = {
            let frame = mtr.page(page_id)?;
            if !page::is_leaf(frame) {
                return Err(CairnError::Invalid("delete mark on a node pointer").into());
            }
            let rec = page::rec_at(frame, cursor.pos())?;
            (rec.offset, rec.heap_no(), rec.to_tuple())
        };

        if !flags.contains(OpFlags::NO_LOCKING)
            && self.locks().lock_modify_clust(ctx, index, (page_id, heap))? == LockStatus::Wait
        {
            return Err(DeleteError::LockWait);
        }
        let roll_ptr = if flags.contains(OpFlags::NO_UNDO_LOG) {
            0
        } else {
            self.locks()
                .report_row_operation(ctx, UndoOp::Modify, index, &image, None)?
                .0
        };
        let sys = SysFields {
            pos: index
                .trx_id_pos()
                .ok_or(CairnError::Corruption("clustered index without system fields"))?,
            trx_id: ctx.trx_id.0,
            roll_ptr,
        };

        {
            let _hash = self.ahi_latch().x_lock_if(self.ahi().is_page_hashed(page_id));
            let frame = mtr.page_mut_compact(page_id)?;
            rec::set_deleted(frame, offset, val);
            if !flags.contains(OpFlags::KEEP_SYS) {
                redo::apply_sys(frame, offset, sys)?;
            }
        }
        redo::log_clust_del_mark(mtr, page_id, offset, flags, val, sys);
        trace!(
            target: "cairn::btree::delete",
            index = %index.name,
            page = %page_id,
            heap_no = heap,
            val,
            "clustered delete mark"
        );
        Ok(())
    }

    /// Sets or clears the delete mark of the secondary record under the
    /// cursor. No undo is written.
    pub fn del_mark_set_sec_rec(
        &self,
        flags: OpFlags,
        cursor: &BtrCursor,
        val: bool,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> std::result::Result<(), DeleteError> {
        let index = &cursor.index;
        let page_id = cursor.page_id();
        let (offset, heap) = {
            let frame = mtr.page(page_id)?;
            if !page::is_leaf(frame) {
                return Err(CairnError::Invalid("delete mark on a node pointer").into());
            }
            let rec = page::rec_at(frame, cursor.pos())?;
            (rec.offset, rec.heap_no())
        };
        if !flags.contains(OpFlags::NO_LOCKING)
            && self.locks().lock_modify_sec(ctx, index, (page_id, heap))? == LockStatus::Wait
        {
            return Err(DeleteError::LockWait);
        }
        {
            let _hash = self.ahi_latch().x_lock_if(self.ahi().is_page_hashed(page_id));
            rec::set_deleted(mtr.page_mut_compact(page_id)?, offset, val);
        }
        redo::log_sec_del_mark(mtr, page_id, offset, val);
        Ok(())
    }

    /// Clears the delete mark of a secondary record while merging the
    /// insert buffer. Takes no lock and writes no redo record.
    pub fn del_unmark_for_ibuf(&self, mtr: &mut Mtr, page_id: PageId, offset: usize) -> Result<()> {
        let _hash = self.ahi_latch().x_lock_if(self.ahi().is_page_hashed(page_id));
        rec::set_deleted(mtr.page_mut_compact(page_id)?, offset, false);
        Ok(())
    }

    /// Removes the leaf record under the cursor if that needs no tree change.
    ///
    /// Returns `Ok(false)` with nothing changed when the record has
    /// externally stored fields or the page would become a merge candidate.
    pub fn optimistic_delete(&self, cursor: &BtrCursor, mtr: &mut Mtr) -> std::result::Result<bool, DeleteError> {
        let index = Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        let pos = cursor.pos();
        let (size, heap, next_heap, entry) = {
            let frame = mtr.page(page_id)?;
            if !page::is_leaf(frame) {
                return Err(CairnError::Invalid("optimistic delete above the leaf level").into());
            }
            let rec = page::rec_at(frame, pos)?;
            if rec.has_ext() {
                return Ok(false);
            }
            (rec.size(), rec.heap_no(), page::heap_no_at(frame, pos + 1)?, rec.to_tuple())
        };
        if !self.can_delete_without_compress(cursor, size, mtr)? {
            return Ok(false);
        }

        self.locks().on_delete((page_id, heap), (page_id, next_heap));
        self.ahi().on_delete(&index, &entry, page_id);
        page::delete(mtr.page_mut(page_id)?, pos)?;
        if index.is_ibuf_eligible() {
            let max_ins = page::max_insert_size_after_reorganize(mtr.page(page_id)?);
            self.ibuf().update_free_bits(page_id, mtr.page_size(), max_ins);
        }
        trace!(target: "cairn::btree::delete", index = %index.name, page = %page_id, pos, "optimistic delete");
        Ok(true)
    }

    /// Removes the record under the cursor, changing the tree as needed.
    ///
    /// Requires the tree latch in X. Unless the mini-transaction already
    /// carries a reservation, `tree_height / 32 + 1` extents are reserved
    /// from the cleaning margin and released before returning. The cursor
    /// is invalid afterwards.
    pub fn pessimistic_delete(&self, cursor: &mut BtrCursor, mtr: &mut Mtr) -> std::result::Result<(), DeleteError> {
        let index = Arc::clone(&cursor.index);
        if !mtr.holds_tree_x(index.id) {
            return Err(CairnError::Invalid("pessimistic delete without the tree latch").into());
        }
        let reserved_here = mtr.reservation().is_none();
        if reserved_here {
            let n_extents = (cursor.tree_height / 32 + 1) as u32;
            let reservation = self
                .store()
                .space(index.space)
                .and_then(|space| space.reserve(n_extents, ReserveClass::Cleaning))?;
            mtr.attach_reservation(reservation);
        }
        let result = self.pessimistic_delete_low(cursor, mtr);
        if reserved_here {
            drop(mtr.take_reservation());
        }
        result
    }

    fn pessimistic_delete_low(&self, cursor: &mut BtrCursor, mtr: &mut Mtr) -> std::result::Result<(), DeleteError> {
        let index = Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        let pos = cursor.pos();
        let (leaf, n_recs, level, prev) = {
            let frame = mtr.page(page_id)?;
            (page::is_leaf(frame), page::n_recs(frame), page::level(frame), fil::prev(frame))
        };
        if pos == 0 || pos > n_recs {
            return Err(CairnError::Invalid("delete cursor is not on a user record").into());
        }

        if leaf {
            self.free_record_externs(mtr, page_id, pos)?;
        }
        if n_recs < 2 && page_id != index.root() {
            self.discard_page(&index, page_id, mtr)?;
            return Ok(());
        }

        if !leaf && pos == 1 && n_recs >= 2 {
            if prev == FIL_NULL {
                let offset = page::rec_offset(mtr.page(page_id)?, 2)?;
                rec::set_min_rec(mtr.page_mut(page_id)?, offset);
            } else {
                let mut father = self.page_get_father(&index, page_id, mtr)?;
                self.pessimistic_delete(&mut father, mtr)?;
                let node_ptr = {
                    let frame = mtr.page(page_id)?;
                    rec::build_node_ptr(&page::rec_at(frame, 2)?, index.n_uniq, page_id.page_no)
                };
                self.insert_on_non_leaf_level(&index, level as usize + 1, node_ptr, mtr)?;
            }
        }

        let (heap, next_heap, entry) = {
            let frame = mtr.page(page_id)?;
            let rec = page::rec_at(frame, pos)?;
            (rec.heap_no(), page::heap_no_at(frame, pos + 1)?, rec.to_tuple())
        };
        self.locks().on_delete((page_id, heap), (page_id, next_heap));
        if leaf {
            self.ahi().on_delete(&index, &entry, page_id);
        }
        page::delete(mtr.page_mut(page_id)?, pos)?;
        #[cfg(debug_assertions)]
        if !leaf && pos == 1 {
            self.check_node_ptr(&index, page_id, mtr)?;
        }
        if leaf && index.is_ibuf_eligible() {
            let max_ins = page::max_insert_size_after_reorganize(mtr.page(page_id)?);
            self.ibuf().update_free_bits(page_id, mtr.page_size(), max_ins);
        }
        cursor.set(page_id, pos - 1);
        let compressed = self.compress_if_useful(cursor, mtr)?;
        debug!(
            target: "cairn::btree::structure",
            index = %index.name,
            page = %page_id,
            pos,
            level,
            compressed,
            "pessimistic delete"
        );
        Ok(())
    }

    /// Checks that the node pointer to `page_id` carries the key of the
    /// page's first record, or the minimum-record mark on both.
    #[cfg(debug_assertions)]
    fn check_node_ptr(&self, index: &Arc<Index>, page_id: PageId, mtr: &mut Mtr) -> Result<()> {
        if page_id == index.root() {
            return Ok(());
        }
        let father = self.page_get_father(index, page_id, mtr)?;
        let first = page::rec_at(mtr.page(page_id)?, 1)?;
        let node_ptr = page::rec_at(mtr.page(father.page_id())?, father.pos())?;
        let matches = first.is_min_rec() == node_ptr.is_min_rec()
            && (first.is_min_rec() || rec::common_prefix_fields(&first, &node_ptr, index.n_uniq) == index.n_uniq);
        if !matches {
            return Err(CairnError::Corruption("node pointer does not match the first record of its child"));
        }
        Ok(())
    }
}
