//! Tree shape changes: root raise, page split, merge, discard and lift.
//!
//! Everything here runs under the tree latch in X inside the caller's
//! mini-transaction. Pages are latched left to right where possible;
//! under the tree X latch nothing else waits on these pages, so a late
//! latch on a left sibling cannot deadlock.

use std::sync::Arc;

use tracing::debug;

use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::storage::txn::TxnCtx;
use crate::types::{page as fil, CairnError, PageId, Result, TrxId, FIL_NULL};

use super::cursor::{BtrCursor, LatchMode};
use super::engine::{IndexEngine, OpFlags};
use super::error::InsertError;
use super::index::Index;
use super::insert::split_point_to_right;
use super::page::{self, PageSearchMode, HEAP_NO_SUPREMUM, PAGE_DATA, SLOT_SIZE};
use super::rec::{self, Rec, Tuple, REC_INFO_MIN_REC};

/// Context for node pointer changes, which take no locks and write no undo.
const SYSTEM_CTX: TxnCtx = TxnCtx { trx_id: TrxId(0) };

fn node_ptr_flags() -> OpFlags {
    OpFlags::NO_LOCKING | OpFlags::NO_UNDO_LOG | OpFlags::KEEP_SYS
}

fn record_bytes(frame: &[u8]) -> Result<Vec<Vec<u8>>> {
    Ok(page::records(frame)?.iter().map(|r| r.bytes().to_vec()).collect())
}

/// First index of the right half when splitting `sizes` (records in key
/// order, the new one included) over two pages of `capacity` bytes.
fn choose_split(sizes: &[usize], preferred: usize, capacity: usize) -> Result<usize> {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();
    let mut prefix = vec![0usize; n + 1];
    for (k, size) in sizes.iter().enumerate() {
        prefix[k + 1] = prefix[k] + size;
    }
    let fits = |s: usize| {
        prefix[s] + SLOT_SIZE * s <= capacity && total - prefix[s] + SLOT_SIZE * (n - s) <= capacity
    };
    let preferred = preferred.clamp(1, n - 1);
    for d in 0..n {
        let below = preferred.checked_sub(d).filter(|&s| s >= 1);
        let above = Some(preferred + d).filter(|&s| s < n);
        for s in [below, above].into_iter().flatten() {
            if fits(s) {
                return Ok(s);
            }
        }
    }
    Err(CairnError::Corruption("no split point fits both halves"))
}

impl IndexEngine {
    /// Moves the root's records to a fresh child, leaves a single node
    /// pointer in the root one level higher, then splits the child.
    pub(crate) fn root_raise_and_insert(
        &self,
        cursor: &mut BtrCursor,
        entry: &Tuple,
        mtr: &mut Mtr,
    ) -> Result<(PageId, usize, usize)> {
        let index = Arc::clone(&cursor.index);
        let root = cursor.page_id();
        let (level, recs) = {
            let frame = mtr.page(root)?;
            (page::level(frame), record_bytes(frame)?)
        };

        let child = mtr.allocate_page(index.space, None)?;
        {
            let frame = mtr.page_mut(child)?;
            page::create(frame, level, index.id.0);
            page::rebuild(frame, &recs)?;
        }
        for bytes in &recs {
            let heap = Rec::at(bytes, 0)?.heap_no();
            self.locks().move_rec((root, heap), (child, heap));
        }
        self.locks()
            .move_rec((root, HEAP_NO_SUPREMUM), (child, HEAP_NO_SUPREMUM));
        self.ahi().drop_page(root);

        let mut node_ptr = {
            let frame = mtr.page(child)?;
            rec::build_node_ptr(&page::rec_at(frame, 1)?, index.n_uniq, child.page_no)
        };
        node_ptr.info_bits |= REC_INFO_MIN_REC;
        {
            let frame = mtr.page_mut(root)?;
            page::create(frame, level + 1, index.id.0);
            page::insert_after(frame, 0, &node_ptr)?
                .ok_or(CairnError::Corruption("node pointer does not fit an empty root"))?;
        }
        if level == 0 && index.is_ibuf_eligible() {
            self.ibuf().reset_free_bits(root);
        }
        debug!(
            target: "cairn::btree::structure",
            index = %index.name,
            root = %root,
            child = %child,
            height = level + 2,
            "raised root"
        );

        cursor.set(child, cursor.pos());
        self.page_split_and_insert(cursor, entry, mtr)
    }

    /// Splits the cursor page and inserts `entry` into the proper half.
    ///
    /// The upper half moves to a new page allocated right of the old one.
    /// Sequential inserts to the right split at the insert point; anything
    /// else splits near the byte median. Returns where the record landed.
    pub(crate) fn page_split_and_insert(
        &self,
        cursor: &mut BtrCursor,
        entry: &Tuple,
        mtr: &mut Mtr,
    ) -> Result<(PageId, usize, usize)> {
        let index = Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        let ins = cursor.pos();
        let page_size = mtr.page_size();
        let (level, old_next, old_recs, sequential) = {
            let frame = mtr.page(page_id)?;
            (
                page::level(frame),
                fil::next(frame),
                record_bytes(frame)?,
                split_point_to_right(frame, ins)?,
            )
        };
        if old_recs.is_empty() {
            return Err(CairnError::Corruption("splitting an empty page"));
        }

        let new_size = rec::converted_size(entry);
        let sizes: Vec<usize> = (0..=old_recs.len())
            .map(|k| match k.cmp(&ins) {
                std::cmp::Ordering::Less => old_recs[k].len(),
                std::cmp::Ordering::Equal => new_size,
                std::cmp::Ordering::Greater => old_recs[k - 1].len(),
            })
            .collect();
        let preferred = if sequential {
            if ins == old_recs.len() {
                ins
            } else {
                ins + 1
            }
        } else {
            let total: usize = sizes.iter().sum();
            let mut acc = 0;
            sizes
                .iter()
                .position(|s| {
                    acc += s;
                    acc * 2 >= total
                })
                .map(|k| k + 1)
                .unwrap_or(1)
        };
        let split = choose_split(&sizes, preferred, page_size - PAGE_DATA)?;
        let new_on_left = ins < split;
        let split_old = if new_on_left { split - 1 } else { split };
        let (left_recs, right_recs) = old_recs.split_at(split_old);

        let new_id = mtr.allocate_page(index.space, Some(page_id.page_no.saturating_add(1)))?;
        {
            let frame = mtr.page_mut(new_id)?;
            page::create(frame, level, index.id.0);
            fil::set_prev(frame, page_id.page_no);
            fil::set_next(frame, old_next);
            page::rebuild(frame, right_recs)?;
        }
        if old_next != FIL_NULL {
            let right = index.page_id(old_next);
            mtr.latch_page(right, RwLatch::Exclusive)?;
            fil::set_prev(mtr.page_mut(right)?, new_id.page_no);
        }
        {
            let frame = mtr.page_mut(page_id)?;
            fil::set_next(frame, new_id.page_no);
            page::rebuild(frame, left_recs)?;
        }

        for bytes in right_recs {
            let heap = Rec::at(bytes, 0)?.heap_no();
            self.locks().move_rec((page_id, heap), (new_id, heap));
        }
        self.locks()
            .move_rec((page_id, HEAP_NO_SUPREMUM), (new_id, HEAP_NO_SUPREMUM));

        let (target, at) = if new_on_left {
            (page_id, ins)
        } else {
            (new_id, ins - split)
        };
        let (pos, offset) = page::insert_after(mtr.page_mut(target)?, at, entry)?
            .ok_or(CairnError::Corruption("split half cannot take the record"))?;

        let first_right = page::heap_no_at(mtr.page(new_id)?, 1)?;
        self.locks()
            .reset_and_inherit_gap_locks((page_id, HEAP_NO_SUPREMUM), (new_id, first_right));
        self.ahi().drop_page(page_id);
        if level == 0 && index.is_ibuf_eligible() {
            for id in [page_id, new_id] {
                let max_ins = page::max_insert_size_after_reorganize(mtr.page(id)?);
                self.ibuf().update_free_bits(id, page_size, max_ins);
            }
        }

        let node_ptr = {
            let frame = mtr.page(new_id)?;
            rec::build_node_ptr(&page::rec_at(frame, 1)?, index.n_uniq, new_id.page_no)
        };
        self.insert_on_non_leaf_level(&index, level as usize + 1, node_ptr, mtr)?;

        self.stats().page_split(level == 0);
        debug!(
            target: "cairn::btree::structure",
            index = %index.name,
            page = %page_id,
            new_page = %new_id,
            level,
            left = split_old + usize::from(new_on_left),
            right = right_recs.len() + usize::from(!new_on_left),
            "split page"
        );
        Ok((target, pos, offset))
    }

    /// Inserts a node pointer on `level`, splitting upward if needed.
    pub fn insert_on_non_leaf_level(
        &self,
        index: &Arc<Index>,
        level: usize,
        node_ptr: Tuple,
        mtr: &mut Mtr,
    ) -> Result<()> {
        let mut cursor = BtrCursor::new(Arc::clone(index));
        self.search_to_nth_level(
            &mut cursor,
            level,
            &node_ptr,
            PageSearchMode::LE,
            LatchMode::ContModifyTree,
            None,
            mtr,
        )?;
        let mut node_ptr = node_ptr;
        match self.optimistic_insert(node_ptr_flags(), &mut cursor, &mut node_ptr, SYSTEM_CTX, mtr) {
            Ok(_) => Ok(()),
            Err(InsertError::RequiresSplit) => {
                self.pessimistic_insert(node_ptr_flags(), &mut cursor, &mut node_ptr, SYSTEM_CTX, mtr)?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Positions a cursor on the node pointer that points at `page_id`.
    ///
    /// The father page is X-latched.
    pub fn page_get_father(&self, index: &Arc<Index>, page_id: PageId, mtr: &mut Mtr) -> Result<BtrCursor> {
        if page_id == index.root() {
            return Err(CairnError::Corruption("the root has no father"));
        }
        let (level, key) = {
            let frame = mtr.page(page_id)?;
            if page::n_recs(frame) == 0 {
                return Err(CairnError::Corruption("empty non-root page"));
            }
            let first = page::rec_at(frame, 1)?;
            (
                page::level(frame) as usize,
                rec::build_node_ptr(&first, index.n_uniq, page_id.page_no),
            )
        };
        let mut cursor = BtrCursor::new(Arc::clone(index));
        self.search_to_nth_level(
            &mut cursor,
            level + 1,
            &key,
            PageSearchMode::LE,
            LatchMode::ContModifyTree,
            None,
            mtr,
        )?;
        let frame = mtr.page(cursor.page_id())?;
        let pos = cursor.pos();
        if pos == 0 || pos > page::n_recs(frame) || rec::node_ptr_child(&page::rec_at(frame, pos)?)? != page_id.page_no
        {
            return Err(CairnError::Corruption("father node pointer does not point to the child"));
        }
        Ok(cursor)
    }

    /// True when the cursor page should be merged with a neighbour.
    pub fn compress_recommendation(&self, cursor: &BtrCursor, mtr: &Mtr) -> Result<bool> {
        if cursor.is_on_root() {
            return Ok(false);
        }
        let frame = mtr.page(cursor.page_id())?;
        Ok(page::data_size(frame) < self.merge_limit()
            || (fil::prev(frame) == FIL_NULL && fil::next(frame) == FIL_NULL))
    }

    /// True when removing a record of `rec_size` bytes leaves the cursor
    /// page full enough to stay as it is.
    pub fn can_delete_without_compress(&self, cursor: &BtrCursor, rec_size: usize, mtr: &Mtr) -> Result<bool> {
        if cursor.is_on_root() {
            return Ok(true);
        }
        let frame = mtr.page(cursor.page_id())?;
        let underfull = page::data_size(frame).saturating_sub(rec_size) < self.merge_limit();
        let alone = fil::prev(frame) == FIL_NULL && fil::next(frame) == FIL_NULL;
        Ok(!(underfull || alone || page::n_recs(frame) < 2))
    }

    /// Compresses the cursor page when [`Self::compress_recommendation`] says so.
    pub fn compress_if_useful(&self, cursor: &BtrCursor, mtr: &mut Mtr) -> Result<bool> {
        if self.compress_recommendation(cursor, mtr)? {
            self.compress(cursor, mtr)
        } else {
            Ok(false)
        }
    }

    /// Merges the cursor page into its left sibling, or into its right
    /// sibling when it is leftmost. A page alone on its level is lifted
    /// into its father instead.
    ///
    /// Returns false, with nothing changed, when the records do not fit.
    /// The cursor is invalid afterwards.
    pub fn compress(&self, cursor: &BtrCursor, mtr: &mut Mtr) -> Result<bool> {
        let index = Arc::clone(&cursor.index);
        let page_id = cursor.page_id();
        if page_id == index.root() {
            return Ok(false);
        }
        let page_size = mtr.page_size();
        let (prev, next, level, n_recs, data) = {
            let frame = mtr.page(page_id)?;
            (
                fil::prev(frame),
                fil::next(frame),
                page::level(frame),
                page::n_recs(frame),
                page::data_size(frame),
            )
        };
        if prev == FIL_NULL && next == FIL_NULL {
            self.lift_page_up(&index, page_id, mtr)?;
            return Ok(true);
        }

        let is_left = prev != FIL_NULL;
        let merge_id = index.page_id(if is_left { prev } else { next });
        mtr.latch_page(merge_id, RwLatch::Exclusive)?;
        {
            let merge = mtr.page(merge_id)?;
            let merged = page::data_size(merge) + data + SLOT_SIZE * (page::n_recs(merge) + n_recs);
            if merged > page_size - PAGE_DATA || usize::from(page::n_heap(merge)) + n_recs >= usize::from(u16::MAX) {
                return Ok(false);
            }
        }

        let mut father = self.page_get_father(&index, page_id, mtr)?;
        if is_left {
            let mapping = self.move_records_into(mtr, page_id, merge_id, true)?;
            self.pessimistic_delete(&mut father, mtr)?;
            fil::set_next(mtr.page_mut(merge_id)?, next);
            if next != FIL_NULL {
                let right = index.page_id(next);
                mtr.latch_page(right, RwLatch::Exclusive)?;
                fil::set_prev(mtr.page_mut(right)?, prev);
            }
            for (old, new) in &mapping {
                self.locks().move_rec((page_id, *old), (merge_id, *new));
            }
            if let Some((_, first)) = mapping.first() {
                self.locks()
                    .inherit_to_gap((merge_id, *first), (merge_id, HEAP_NO_SUPREMUM));
            }
            self.locks()
                .on_page_discard(page_id, (merge_id, HEAP_NO_SUPREMUM));
        } else {
            let mut right_father = self.page_get_father(&index, merge_id, mtr)?;
            let orig_first = page::heap_no_at(mtr.page(merge_id)?, 1)?;
            let mapping = self.move_records_into(mtr, page_id, merge_id, false)?;
            let ptr_offset = page::rec_offset(mtr.page(father.page_id())?, father.pos())?;
            rec::set_node_ptr_child(mtr.page_mut(father.page_id())?, ptr_offset, merge_id.page_no)?;
            self.pessimistic_delete(&mut right_father, mtr)?;
            fil::set_prev(mtr.page_mut(merge_id)?, FIL_NULL);
            for (old, new) in &mapping {
                self.locks().move_rec((page_id, *old), (merge_id, *new));
            }
            self.locks().on_page_discard(page_id, (merge_id, orig_first));
        }

        self.ahi().drop_page(page_id);
        self.ahi().drop_page(merge_id);
        if level == 0 && index.is_ibuf_eligible() {
            self.ibuf().reset_free_bits(page_id);
            let max_ins = page::max_insert_size_after_reorganize(mtr.page(merge_id)?);
            self.ibuf().update_free_bits(merge_id, page_size, max_ins);
        }
        mtr.free_page(page_id)?;
        self.stats().page_merge(level == 0);
        debug!(
            target: "cairn::btree::structure",
            index = %index.name,
            page = %page_id,
            into = %merge_id,
            level,
            "merged page"
        );
        Ok(true)
    }

    /// Copies every record of `from` into `to`, after its records when
    /// `append`, before them otherwise. Moved records get fresh heap
    /// numbers; returns the `(old, new)` heap number pairs.
    fn move_records_into(&self, mtr: &mut Mtr, from: PageId, to: PageId, append: bool) -> Result<Vec<(u16, u16)>> {
        let from_recs = record_bytes(mtr.page(from)?)?;
        let (to_recs, mut next_heap) = {
            let frame = mtr.page(to)?;
            (record_bytes(frame)?, page::n_heap(frame))
        };
        let mut mapping = Vec::with_capacity(from_recs.len());
        let mut moved = Vec::with_capacity(from_recs.len());
        for mut bytes in from_recs {
            if next_heap == u16::MAX {
                return Err(CairnError::Corruption("heap numbers exhausted"));
            }
            let old = Rec::at(&bytes, 0)?.heap_no();
            rec::set_heap_no(&mut bytes, 0, next_heap);
            mapping.push((old, next_heap));
            moved.push(bytes);
            next_heap += 1;
        }
        let combined: Vec<Vec<u8>> = if append {
            to_recs.into_iter().chain(moved).collect()
        } else {
            moved.into_iter().chain(to_recs).collect()
        };
        page::rebuild(mtr.page_mut(to)?, &combined)?;
        Ok(mapping)
    }

    /// Moves the records of a page that is alone on its level into its
    /// father and shortens the tree by one level.
    pub fn lift_page_up(&self, index: &Arc<Index>, page_id: PageId, mtr: &mut Mtr) -> Result<()> {
        let level = page::level(mtr.page(page_id)?);
        let father = self.page_get_father(index, page_id, mtr)?.page_id();
        let mut ancestors = Vec::new();
        let mut cur = father;
        while cur != index.root() {
            cur = self.page_get_father(index, cur, mtr)?.page_id();
            ancestors.push(cur);
        }

        let recs = record_bytes(mtr.page(page_id)?)?;
        {
            let frame = mtr.page_mut(father)?;
            page::create(frame, level, index.id.0);
            page::rebuild(frame, &recs)?;
        }
        for bytes in &recs {
            let heap = Rec::at(bytes, 0)?.heap_no();
            self.locks().move_rec((page_id, heap), (father, heap));
        }
        self.locks()
            .move_rec((page_id, HEAP_NO_SUPREMUM), (father, HEAP_NO_SUPREMUM));
        for (i, ancestor) in ancestors.iter().enumerate() {
            page::set_level(mtr.page_mut(*ancestor)?, level + 1 + i as u16);
        }

        self.ahi().drop_page(page_id);
        self.ahi().drop_page(father);
        if level == 0 && index.is_ibuf_eligible() {
            self.ibuf().reset_free_bits(page_id);
            let max_ins = page::max_insert_size_after_reorganize(mtr.page(father)?);
            self.ibuf().update_free_bits(father, mtr.page_size(), max_ins);
        }
        mtr.free_page(page_id)?;
        self.stats().page_merge(level == 0);
        debug!(
            target: "cairn::btree::structure",
            index = %index.name,
            page = %page_id,
            into = %father,
            level,
            "lifted page"
        );
        Ok(())
    }

    /// Removes a page that is about to lose its last record.
    ///
    /// The page's records are not moved; its locks pass to the left
    /// sibling's supremum or the right sibling's first record.
    pub fn discard_page(&self, index: &Arc<Index>, page_id: PageId, mtr: &mut Mtr) -> Result<()> {
        if page_id == index.root() {
            return Err(CairnError::Corruption("the root cannot be discarded"));
        }
        let (prev, next, level) = {
            let frame = mtr.page(page_id)?;
            (fil::prev(frame), fil::next(frame), page::level(frame))
        };
        if prev == FIL_NULL && next == FIL_NULL {
            return self.discard_only_page_on_level(index, page_id, mtr);
        }

        let heir = if prev != FIL_NULL {
            let left = index.page_id(prev);
            mtr.latch_page(left, RwLatch::Exclusive)?;
            (left, HEAP_NO_SUPREMUM)
        } else {
            let right = index.page_id(next);
            mtr.latch_page(right, RwLatch::Exclusive)?;
            let first = page::heap_no_at(mtr.page(right)?, 1)?;
            if level > 0 {
                let offset = page::rec_offset(mtr.page(right)?, 1)?;
                rec::set_min_rec(mtr.page_mut(right)?, offset);
            }
            (right, first)
        };

        let mut father = self.page_get_father(index, page_id, mtr)?;
        self.pessimistic_delete(&mut father, mtr)?;

        if prev != FIL_NULL {
            fil::set_next(mtr.page_mut(index.page_id(prev))?, next);
        }
        if next != FIL_NULL {
            let right = index.page_id(next);
            mtr.latch_page(right, RwLatch::Exclusive)?;
            fil::set_prev(mtr.page_mut(right)?, prev);
        }
        self.locks().on_page_discard(page_id, heir);
        self.ahi().drop_page(page_id);
        if level == 0 && index.is_ibuf_eligible() {
            self.ibuf().reset_free_bits(page_id);
        }
        mtr.free_page(page_id)?;
        self.stats().page_merge(level == 0);
        debug!(
            target: "cairn::btree::structure",
            index = %index.name,
            page = %page_id,
            level,
            "discarded page"
        );
        Ok(())
    }

    /// Frees a page alone on its level together with its ancestors and
    /// turns the root into an empty leaf.
    fn discard_only_page_on_level(&self, index: &Arc<Index>, page_id: PageId, mtr: &mut Mtr) -> Result<()> {
        let root = index.root();
        let mut cur = page_id;
        while cur != root {
            let father = self.page_get_father(index, cur, mtr)?.page_id();
            self.locks().on_page_discard(cur, (root, HEAP_NO_SUPREMUM));
            self.ahi().drop_page(cur);
            self.ibuf().reset_free_bits(cur);
            mtr.free_page(cur)?;
            cur = father;
        }
        self.ahi().drop_page(root);
        page::create(mtr.page_mut(root)?, 0, index.id.0);
        if index.is_ibuf_eligible() {
            self.ibuf().reset_free_bits(root);
        }
        debug!(target: "cairn::btree::structure", index = %index.name, "tree emptied");
        Ok(())
    }
}
