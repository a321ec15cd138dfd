//! Updates of clustered index records.
//!
//! Three tiers: a same-size rewrite in place, a delete and reinsert on the
//! same page, and a pessimistic path that may split pages and move fields
//! off-page.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::primitives::mtr::Mtr;
use crate::primitives::pager::ReserveClass;
use crate::storage::txn::{LockStatus, TxnCtx, UndoOp};
use crate::types::{page as fil, CairnError, PageId, FIL_NULL};

use super::cursor::BtrCursor;
use super::engine::{IndexEngine, OpFlags};
use super::error::UpdateError;
use super::index::Index;
use super::insert::write_sys_fields;
use super::overflow::{needs_big_rec, BigRec};
use super::page::{self, HEAP_NO_SUPREMUM};
use super::rec::{self, Field, Rec, Tuple, MAX_FIELD_LEN};
use super::redo::{self, SysFields};

type UpdResult<T> = std::result::Result<T, UpdateError>;

/// No ordering field changes, so hash entries stay valid.
pub const UPD_NODE_NO_ORD_CHANGE: u8 = 1;
/// No field changes its stored size.
pub const UPD_NODE_NO_SIZE_CHANGE: u8 = 2;

/// New value of one field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdField {
    /// Field number in the index record.
    pub field_no: usize,
    /// New value, extern flag included.
    pub new: Field,
}

/// Set of field changes applied to one record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateVector {
    /// Info bits the updated record gets.
    pub info_bits: u8,
    /// Changed fields.
    pub fields: Vec<UpdField>,
    /// `UPD_NODE_*` hints from the caller.
    pub cmpl_info: u8,
}

impl UpdateVector {
    /// Empty update producing a record with `info_bits`.
    pub fn new(info_bits: u8) -> Self {
        Self {
            info_bits,
            ..Self::default()
        }
    }

    /// Adds a field change.
    pub fn with_field(mut self, field_no: usize, new: Field) -> Self {
        self.fields.push(UpdField { field_no, new });
        self
    }

    /// Fields of `new` that differ from `old`, system fields excluded.
    pub fn diff(index: &Index, old: &Tuple, new: &Tuple) -> Self {
        let sys = [index.trx_id_pos(), index.roll_ptr_pos()];
        let fields = old
            .fields
            .iter()
            .zip(&new.fields)
            .enumerate()
            .filter(|(i, (a, b))| !sys.contains(&Some(*i)) && a != b)
            .map(|(field_no, (_, b))| UpdField {
                field_no,
                new: b.clone(),
            })
            .collect();
        let mut update = Self {
            info_bits: new.info_bits,
            fields,
            cmpl_info: 0,
        };
        if update.fields.iter().all(|f| f.field_no >= index.n_uniq) {
            update.cmpl_info |= UPD_NODE_NO_ORD_CHANGE;
        }
        update
    }

    /// True when some field's stored size, NULL flag or extern flag changes.
    pub fn changes_size(&self, rec: &Rec<'_>) -> bool {
        self.fields.iter().any(|f| {
            f.field_no >= rec.n_fields()
                || rec.is_ext(f.field_no)
                || f.new.ext
                || rec.is_null(f.field_no) != f.new.data.is_none()
                || rec.field_len(f.field_no) != f.new.len()
        })
    }

    /// Copy of `old` with the changes applied.
    pub fn apply_to(&self, old: &Tuple) -> UpdResult<Tuple> {
        let mut entry = old.clone();
        entry.info_bits = self.info_bits;
        for f in &self.fields {
            let slot = entry
                .fields
                .get_mut(f.field_no)
                .ok_or(UpdateError::Storage(CairnError::Invalid("update field out of range")))?;
            *slot = f.new.clone();
        }
        Ok(entry)
    }
}

/// Result of a pessimistic update.
#[derive(Debug)]
pub struct UpdateOutcome {
    /// Page holding the updated record.
    pub page: PageId,
    /// Byte offset of the updated record.
    pub offset: usize,
    /// Fields to store off-page in the same mini-transaction.
    pub big_rec: Option<BigRec>,
    /// The page was merged with a neighbour afterwards; `page` and
    /// `offset` are stale in that case. Never set together with `big_rec`.
    pub compressed: bool,
}

impl IndexEngine {
    /// Rewrites the record under the cursor without changing any field size.
    pub fn update_in_place(
        &self,
        flags: OpFlags,
        cursor: &BtrCursor,
        update: &UpdateVector,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> UpdResult<()> {
        let index = Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        let (offset, old) = {
            let rec = page::rec_at(mtr.page(page_id)?, cursor.pos())?;
            if update.changes_size(&rec) {
                return Err(CairnError::Invalid("in-place update changes the record size").into());
            }
            (rec.offset, rec.to_tuple())
        };
        let roll_ptr = self.upd_lock_and_undo(flags, cursor, update, ctx, mtr)?;
        let sys = sys_fields(&index, ctx, roll_ptr)?;

        if update.cmpl_info & UPD_NODE_NO_ORD_CHANGE == 0 {
            self.ahi().on_delete(&index, &old, page_id);
        }
        {
            let _hash = self.ahi_latch().x_lock_if(self.ahi().is_page_hashed(page_id));
            let frame = mtr.page_mut_compact(page_id)?;
            rec::set_info_bits(frame, offset, update.info_bits);
            if !flags.contains(OpFlags::KEEP_SYS) {
                redo::apply_sys(frame, offset, sys)?;
            }
            for f in &update.fields {
                rec::write_field_in_place(frame, offset, f.field_no, f.new.data.as_deref())?;
            }
        }
        redo::log_update_in_place(mtr, page_id, offset, flags, sys, update);
        trace!(target: "cairn::btree::update", index = %index.name, page = %page_id, offset, "update in place");
        Ok(())
    }

    /// Updates the record under the cursor without leaving its page.
    ///
    /// Falls back to [`Self::update_in_place`] when no size changes.
    /// `Overflow` and `Underflow` leave everything untouched and ask for
    /// [`Self::pessimistic_update`].
    pub fn optimistic_update(
        &self,
        flags: OpFlags,
        cursor: &mut BtrCursor,
        update: &UpdateVector,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> UpdResult<()> {
        let index = Arc::clone(&cursor.index);
        if !index.is_clustered() {
            return Err(CairnError::Invalid("updates go through the clustered index").into());
        }
        let page_id = cursor.page_id();
        let pos = cursor.pos();
        let page_size = mtr.page_size();
        let (old, old_size, has_ext, changes_size) = {
            let frame = mtr.page(page_id)?;
            if !page::is_leaf(frame) {
                return Err(CairnError::Invalid("update above the leaf level").into());
            }
            let rec = page::rec_at(frame, pos)?;
            (rec.to_tuple(), rec.size(), rec.has_ext(), update.changes_size(&rec))
        };
        if !changes_size {
            return self.update_in_place(flags, cursor, update, ctx, mtr);
        }

        let mut entry = update.apply_to(&old)?;
        if has_ext || entry.has_ext() {
            return Err(UpdateError::Overflow);
        }
        let new_size = rec::converted_size(&entry);
        if new_size > page::max_rec_size(page_size) || entry.fields.iter().any(|f| f.len() > MAX_FIELD_LEN) {
            return Err(UpdateError::Overflow);
        }
        {
            let frame = mtr.page(page_id)?;
            if page::data_size(frame) - old_size + new_size < self.merge_limit() {
                return Err(UpdateError::Underflow);
            }
            let max_size = page::max_insert_size_after_reorganize(frame) + old_size;
            let fits = max_size >= self.options().reorganize_threshold() && max_size >= new_size;
            if !fits && page::n_recs(frame) > 1 {
                return Err(UpdateError::Overflow);
            }
        }

        let roll_ptr = self.upd_lock_and_undo(flags, cursor, update, ctx, mtr)?;
        if !flags.contains(OpFlags::KEEP_SYS) {
            write_sys_fields(&index, &mut entry, ctx.trx_id.0, roll_ptr)?;
        }

        let heap = page::heap_no_at(mtr.page(page_id)?, pos)?;
        self.locks().store_on_infimum((page_id, heap));
        self.ahi().on_delete(&index, &old, page_id);
        let frame = mtr.page_mut(page_id)?;
        page::delete(frame, pos)?;
        let placed = match page::insert_after(frame, pos - 1, &entry)? {
            Some(placed) => placed,
            None => {
                page::reorganize(frame)?;
                self.stats().page_reorganized();
                page::insert_after(frame, pos - 1, &entry)?
                    .ok_or(CairnError::Corruption("updated record does not fit its page"))?
            }
        };
        let new_heap = page::heap_no_at(mtr.page(page_id)?, placed.0)?;
        self.locks().restore_from_infimum(page_id, (page_id, new_heap));
        self.ahi().on_insert(&index, &entry, page_id);
        cursor.set(page_id, placed.0);
        trace!(
            target: "cairn::btree::update",
            index = %index.name,
            page = %page_id,
            old_size,
            new_size,
            "optimistic update"
        );
        Ok(())
    }

    /// Updates the record under the cursor, splitting pages and moving
    /// fields off-page as needed.
    ///
    /// Requires the tree latch in X. When the page would overflow,
    /// `tree_height / 16 + 3` extents are reserved first, from the cleaning
    /// margin if `NO_UNDO_LOG` is set. Externally stored fields the update
    /// replaces are freed. A returned `big_rec` must be stored with
    /// [`Self::store_big_rec_extern_fields`] before commit.
    pub fn pessimistic_update(
        &self,
        flags: OpFlags,
        cursor: &mut BtrCursor,
        update: &UpdateVector,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> UpdResult<UpdateOutcome> {
        let index = Arc::clone(&cursor.index);
        if !mtr.holds_tree_x(index.id) {
            return Err(CairnError::Invalid("pessimistic update without the tree latch").into());
        }
        let optim_err = match self.optimistic_update(flags, cursor, update, ctx, mtr) {
            Ok(()) => {
                let offset = page::rec_offset(mtr.page(cursor.page_id())?, cursor.pos())?;
                return Ok(UpdateOutcome {
                    page: cursor.page_id(),
                    offset,
                    big_rec: None,
                    compressed: false,
                });
            }
            Err(err @ (UpdateError::Overflow | UpdateError::Underflow)) => err,
            Err(err) => return Err(err),
        };

        let reserved_here = matches!(optim_err, UpdateError::Overflow) && mtr.reservation().is_none();
        if reserved_here {
            let class = if flags.contains(OpFlags::NO_UNDO_LOG) {
                ReserveClass::Cleaning
            } else {
                ReserveClass::Normal
            };
            let n_extents = (cursor.tree_height / 16 + 3) as u32;
            let reservation = self
                .store()
                .space(index.space)
                .and_then(|space| space.reserve(n_extents, class))?;
            mtr.attach_reservation(reservation);
        }
        let result = self.pessimistic_update_low(flags, cursor, update, ctx, mtr);
        if reserved_here {
            drop(mtr.take_reservation());
        }
        result
    }

    fn pessimistic_update_low(
        &self,
        flags: OpFlags,
        cursor: &mut BtrCursor,
        update: &UpdateVector,
        ctx: TxnCtx,
        mtr: &mut Mtr,
    ) -> UpdResult<UpdateOutcome> {
        let index = Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        let pos = cursor.pos();
        let page_size = mtr.page_size();
        let (old, offset, heap, replaced_ext) = {
            let rec = page::rec_at(mtr.page(page_id)?, pos)?;
            let replaced: Vec<usize> = update
                .fields
                .iter()
                .map(|f| f.field_no)
                .filter(|&i| i < rec.n_fields() && rec.is_ext(i))
                .collect();
            (rec.to_tuple(), rec.offset, rec.heap_no(), replaced)
        };

        let mut entry = update.apply_to(&old)?;
        let mut big_rec = None;
        if needs_big_rec(&entry, page_size) {
            big_rec = Some(
                self.convert_big_rec(&index, &mut entry)
                    .ok_or(UpdateError::RecordTooBig)?,
            );
        }
        let roll_ptr = self.upd_lock_and_undo(flags, cursor, update, ctx, mtr)?;
        if !flags.contains(OpFlags::KEEP_SYS) {
            write_sys_fields(&index, &mut entry, ctx.trx_id.0, roll_ptr)?;
        }

        for field_no in replaced_ext {
            self.free_externally_stored_field(mtr, page_id, offset, field_no)?;
        }

        self.locks().store_on_infimum((page_id, heap));
        self.ahi().on_delete(&index, &old, page_id);
        let was_first = pos == 1;
        {
            let frame = mtr.page_mut(page_id)?;
            page::delete(frame, pos)?;
        }

        let new_size = rec::converted_size(&entry);
        let in_page = {
            let frame = mtr.page_mut(page_id)?;
            if page::max_insert_size_after_reorganize(frame) >= new_size {
                match page::insert_after(frame, pos - 1, &entry)? {
                    Some(placed) => Some(placed),
                    None => {
                        page::reorganize(frame)?;
                        self.stats().page_reorganized();
                        page::insert_after(frame, pos - 1, &entry)?
                    }
                }
            } else {
                None
            }
        };

        let split = in_page.is_none();
        let (new_page, new_pos, new_offset) = match in_page {
            Some((new_pos, new_offset)) => (page_id, new_pos, new_offset),
            None => {
                cursor.set(page_id, pos - 1);
                let inner = OpFlags::NO_UNDO_LOG | OpFlags::NO_LOCKING | OpFlags::KEEP_SYS;
                let out = self.pessimistic_insert(inner, cursor, &mut entry, ctx, mtr)?;
                if out.big_rec.is_some() {
                    return Err(CairnError::Corruption("converted record converted again").into());
                }
                (out.page, out.pos, out.offset)
            }
        };

        let new_heap = page::heap_no_at(mtr.page(new_page)?, new_pos)?;
        self.locks().restore_from_infimum(page_id, (new_page, new_heap));
        // A split may leave the record first on a page whose left
        // neighbour's supremum carries stale gap locks.
        if split && was_first && new_pos == 1 {
            let prev = fil::prev(mtr.page(new_page)?);
            if prev != FIL_NULL {
                self.locks()
                    .reset_and_inherit_gap_locks((index.page_id(prev), HEAP_NO_SUPREMUM), (new_page, new_heap));
            }
        }
        self.ahi().on_insert(&index, &entry, new_page);

        let mut compressed = false;
        if big_rec.is_none() && new_page == page_id {
            cursor.set(page_id, new_pos);
            compressed = self.compress_if_useful(cursor, mtr)?;
        }
        cursor.set(new_page, new_pos);
        debug!(
            target: "cairn::btree::update",
            index = %index.name,
            page = %new_page,
            moved = new_page != page_id,
            big_rec = big_rec.is_some(),
            compressed,
            "pessimistic update"
        );
        Ok(UpdateOutcome {
            page: new_page,
            offset: new_offset,
            big_rec,
            compressed,
        })
    }

    /// Takes the row lock and writes the modify undo record; returns the
    /// rollback pointer, 0 when undo is off.
    fn upd_lock_and_undo(
        &self,
        flags: OpFlags,
        cursor: &BtrCursor,
        update: &UpdateVector,
        ctx: TxnCtx,
        mtr: &Mtr,
    ) -> UpdResult<u64> {
        let index = &cursor.index;
        if !index.is_clustered() {
            return Err(CairnError::Invalid("updates go through the clustered index").into());
        }
        let page_id = cursor.page_id();
        let rec = page::rec_at(mtr.page(page_id)?, cursor.pos())?;
        if !flags.contains(OpFlags::NO_LOCKING)
            && self.locks().lock_modify_clust(ctx, index, (page_id, rec.heap_no()))? == LockStatus::Wait
        {
            return Err(UpdateError::LockWait);
        }
        if flags.contains(OpFlags::NO_UNDO_LOG) {
            return Ok(0);
        }
        let image = rec.to_tuple();
        Ok(self
            .locks()
            .report_row_operation(ctx, UndoOp::Modify, index, &image, Some(update))?
            .0)
    }
}

fn sys_fields(index: &Index, ctx: TxnCtx, roll_ptr: u64) -> UpdResult<SysFields> {
    let pos = index
        .trx_id_pos()
        .ok_or(CairnError::Corruption("clustered index without system fields"))?;
    Ok(SysFields {
        pos,
        trx_id: ctx.trx_id.0,
        roll_ptr,
    })
}
