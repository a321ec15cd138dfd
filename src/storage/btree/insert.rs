//! Record insertion: the in-page fast path and the splitting slow path.

use tracing::{debug, trace};

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::ReserveClass;
use crate::storage::txn::{LockStatus, TxnCtx, UndoOp};
use crate::types::{CairnError, PageId, Result};

use super::cursor::BtrCursor;
use super::engine::{IndexEngine, OpFlags};
use super::error::InsertError;
use super::index::{Index, DATA_ROLL_PTR_LEN, DATA_TRX_ID_LEN};
use super::overflow::{needs_big_rec, restore_big_rec, BigRec};
use super::page;
use super::rec::{self, Field, Tuple};

/// Where an inserted record landed.
#[derive(Debug)]
pub struct InsertOutcome {
    /// Page holding the new record.
    pub page: PageId,
    /// Position of the new record on `page`.
    pub pos: usize,
    /// Byte offset of the new record on `page`.
    pub offset: usize,
    /// Fields that still have to be written to blob pages, in the same
    /// mini-transaction, with [`IndexEngine::store_big_rec_extern_fields`].
    pub big_rec: Option<BigRec>,
}

/// Writes `trx_id` and `roll_ptr` into the system fields of a clustered entry.
pub(crate) fn write_sys_fields(index: &Index, entry: &mut Tuple, trx_id: u64, roll_ptr: u64) -> Result<()> {
    let (Some(trx_pos), Some(roll_pos)) = (index.trx_id_pos(), index.roll_ptr_pos()) else {
        return Ok(());
    };
    if entry.fields.len() <= roll_pos {
        return Err(CairnError::Invalid("clustered entry lacks system fields"));
    }
    entry.fields[trx_pos] = Field::new(trx_id.to_be_bytes()[8 - DATA_TRX_ID_LEN..].to_vec());
    entry.fields[roll_pos] = Field::new(roll_ptr.to_be_bytes()[8 - DATA_ROLL_PTR_LEN..].to_vec());
    Ok(())
}

/// Checks that a leaf entry has the shape of `index`.
pub(crate) fn check_entry(index: &Index, entry: &Tuple) -> Result<()> {
    if entry.n_fields() != index.n_fields {
        return Err(CairnError::Invalid("entry field count does not match the index"));
    }
    if let (Some(trx_pos), Some(roll_pos)) = (index.trx_id_pos(), index.roll_ptr_pos()) {
        if entry.fields[trx_pos].len() != DATA_TRX_ID_LEN || entry.fields[roll_pos].len() != DATA_ROLL_PTR_LEN {
            return Err(CairnError::Invalid("malformed system fields"));
        }
    }
    Ok(())
}

/// Sequential inserts to the right: the previous insert landed at the
/// cursor record.
pub(crate) fn split_point_to_right(frame: &[u8], pos: usize) -> Result<bool> {
    let last = page::last_insert(frame);
    Ok(last != 0 && last == page::heap_no_at(frame, pos)?)
}

/// Sequential inserts to the left: the previous insert landed right after
/// the cursor record.
fn split_point_to_left(frame: &[u8], pos: usize) -> Result<bool> {
    let last = page::last_insert(frame);
    Ok(last != 0 && last == page::heap_no_at(frame, pos + 1)?)
}

impl IndexEngine {
    /// Inserts `entry` right after the cursor record if it fits on the page.
    ///
    /// The cursor page must be X-latched. On success the cursor points at
    /// the new record. `RequiresSplit` means nothing was changed and the
    /// caller should retry with [`IndexEngine::pessimistic_insert`] under
    /// the tree latch. On any error `entry` is restored to its original
    /// fields, apart from system fields already written.
    pub fn optimistic_insert(
        &self,
        flags: OpFlags,
        cursor: &mut BtrCursor,
        entry: &mut Tuple,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> std::result::Result<InsertOutcome, InsertError> {
        let index = std::sync::Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        let pos = cursor.pos();
        let page_size = mtr.page_size();

        let leaf = page::is_leaf(mtr.page(page_id)?);
        if leaf {
            check_entry(&index, entry)?;
            if rec::node_ptr_size(entry, index.n_uniq) > page::max_rec_size(page_size) {
                return Err(InsertError::RecordTooBig);
            }
        }

        let mut big_rec = None;
        if needs_big_rec(entry, page_size) {
            if !leaf || !index.is_clustered() {
                return Err(InsertError::RecordTooBig);
            }
            match self.convert_big_rec(&index, entry) {
                Some(big) => big_rec = Some(big),
                None => return Err(InsertError::RecordTooBig),
            }
        }
        let rec_size = rec::converted_size(entry);

        let decision = {
            let frame = mtr.page(page_id)?;
            let n_recs = page::n_recs(frame);
            let max_size = page::max_insert_size_after_reorganize(frame);
            let reserve = self.options().effective_update_reserve();
            let avoid_split = index.is_clustered()
                && leaf
                && n_recs >= 2
                && reserve + rec_size > max_size
                && (split_point_to_right(frame, pos)? || split_point_to_left(frame, pos)?);
            let no_room = (max_size < self.options().reorganize_threshold() || max_size < rec_size)
                && n_recs > 1
                && page::max_insert_size(frame) < rec_size;
            avoid_split || no_room
        };
        if decision {
            if let Some(big) = big_rec.take() {
                restore_big_rec(entry, big);
            }
            trace!(target: "cairn::btree::insert", page = %page_id, rec_size, "optimistic insert declined");
            return Err(InsertError::RequiresSplit);
        }

        if let Err(err) = self.ins_lock_and_undo(flags, cursor, entry, ctx, leaf, mtr) {
            if let Some(big) = big_rec.take() {
                restore_big_rec(entry, big);
            }
            return Err(err);
        }

        let next_heap = page::heap_no_at(mtr.page(page_id)?, pos + 1)?;
        let frame = mtr.page_mut(page_id)?;
        let placed = match page::insert_after(frame, pos, entry)? {
            Some(placed) => Some(placed),
            None => {
                page::reorganize(frame)?;
                self.stats().page_reorganized();
                page::insert_after(frame, pos, entry)?
            }
        };
        let Some((new_pos, offset)) = placed else {
            if let Some(big) = big_rec.take() {
                restore_big_rec(entry, big);
            }
            return Err(InsertError::Storage(CairnError::Corruption(
                "record does not fit after reorganizing",
            )));
        };
        let new_heap = page::heap_no_at(mtr.page(page_id)?, new_pos)?;

        self.ahi().on_insert(&index, entry, page_id);
        if !flags.contains(OpFlags::NO_LOCKING) {
            self.locks().on_insert((page_id, new_heap), (page_id, next_heap));
        }
        if leaf && index.is_ibuf_eligible() {
            let max_ins = page::max_insert_size_after_reorganize(mtr.page(page_id)?);
            self.ibuf().update_free_bits(page_id, page_size, max_ins);
        }
        self.stats().optimistic_insert();
        cursor.set(page_id, new_pos);
        trace!(
            target: "cairn::btree::insert",
            index = %index.name,
            page = %page_id,
            pos = new_pos,
            rec_size,
            "optimistic insert"
        );
        Ok(InsertOutcome {
            page: page_id,
            pos: new_pos,
            offset,
            big_rec,
        })
    }

    /// Inserts `entry` after the cursor record, splitting pages as needed.
    ///
    /// Requires the tree latch in X and X latches on the cursor page and
    /// its siblings, as taken by a `ModifyTree` descent. Unless
    /// `NO_UNDO_LOG` is set or the mini-transaction already carries a
    /// reservation, `tree_height / 16 + 3` extents are reserved first. On
    /// success the cursor points at the predecessor of the new record.
    pub fn pessimistic_insert(
        &self,
        flags: OpFlags,
        cursor: &mut BtrCursor,
        entry: &mut Tuple,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> std::result::Result<InsertOutcome, InsertError> {
        let index = std::sync::Arc::clone(&cursor.index);
        if !mtr.holds_tree_x(index.id) {
            return Err(InsertError::Storage(CairnError::Invalid(
                "pessimistic insert without the tree latch",
            )));
        }
        match self.optimistic_insert(flags, cursor, entry, ctx, mtr) {
            Err(InsertError::RequiresSplit) => {}
            other => return other,
        }

        let page_size = mtr.page_size();
        let leaf = page::is_leaf(mtr.page(cursor.page_id())?);
        let mut big_rec = None;
        if needs_big_rec(entry, page_size) {
            if !leaf || !index.is_clustered() {
                return Err(InsertError::RecordTooBig);
            }
            match self.convert_big_rec(&index, entry) {
                Some(big) => big_rec = Some(big),
                None => return Err(InsertError::RecordTooBig),
            }
        }

        if let Err(err) = self.ins_lock_and_undo(flags, cursor, entry, ctx, leaf, mtr) {
            if let Some(big) = big_rec.take() {
                restore_big_rec(entry, big);
            }
            return Err(err);
        }

        let reserved_here = !flags.contains(OpFlags::NO_UNDO_LOG) && mtr.reservation().is_none();
        if reserved_here {
            let n_extents = (cursor.tree_height / 16 + 3) as u32;
            let reserved = self
                .store()
                .space(index.space)
                .and_then(|space| space.reserve(n_extents, ReserveClass::Normal));
            match reserved {
                Ok(reservation) => mtr.attach_reservation(reservation),
                Err(err) => {
                    if let Some(big) = big_rec.take() {
                        restore_big_rec(entry, big);
                    }
                    debug!(target: "cairn::btree::insert", index = %index.name, n_extents, "reservation refused");
                    return Err(err.into());
                }
            }
        }

        let placed = if cursor.is_on_root() {
            self.root_raise_and_insert(cursor, entry, mtr)
        } else {
            self.page_split_and_insert(cursor, entry, mtr)
        };
        if reserved_here {
            drop(mtr.take_reservation());
        }
        let (page_id, pos, offset) = match placed {
            Ok(placed) => placed,
            Err(err) => {
                if let Some(big) = big_rec.take() {
                    restore_big_rec(entry, big);
                }
                return Err(err.into());
            }
        };

        let frame = mtr.page(page_id)?;
        let new_heap = page::heap_no_at(frame, pos)?;
        let next_heap = page::heap_no_at(frame, pos + 1)?;
        self.ahi().on_insert(&index, entry, page_id);
        if !flags.contains(OpFlags::NO_LOCKING) {
            self.locks().on_insert((page_id, new_heap), (page_id, next_heap));
        }
        cursor.set(page_id, pos - 1);
        debug!(
            target: "cairn::btree::insert",
            index = %index.name,
            page = %page_id,
            pos,
            "pessimistic insert"
        );
        Ok(InsertOutcome {
            page: page_id,
            pos,
            offset,
            big_rec,
        })
    }

    /// Checks the insert lock and writes the insert undo record, stamping
    /// the system fields of clustered leaf entries.
    fn ins_lock_and_undo(
        &self,
        flags: OpFlags,
        cursor: &BtrCursor,
        entry: &mut Tuple,
        ctx: TxnCtx,
        leaf: bool,
        mtr: &Mtr,
    ) -> std::result::Result<(), InsertError> {
        let index = &cursor.index;
        if !flags.contains(OpFlags::NO_LOCKING) {
            let next_heap = page::heap_no_at(mtr.page(cursor.page_id())?, cursor.pos() + 1)?;
            if self.locks().lock_insert(ctx, index, (cursor.page_id(), next_heap))? == LockStatus::Wait {
                return Err(InsertError::LockWait);
            }
        }
        if !leaf || !index.is_clustered() {
            return Ok(());
        }
        let roll_ptr = if flags.contains(OpFlags::NO_UNDO_LOG) {
            0
        } else {
            self.locks()
                .report_row_operation(ctx, UndoOp::Insert, index, entry, None)?
                .0
        };
        if !flags.contains(OpFlags::KEEP_SYS) {
            write_sys_fields(index, entry, ctx.trx_id.0, roll_ptr)?;
        }
        Ok(())
    }
}
