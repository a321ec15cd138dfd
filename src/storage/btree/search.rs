//! Tree descent: positioned search, open-at-side and random positioning.

use rand::Rng;
use tracing::trace;

use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::FetchMode;
use crate::types::{page as fil, CairnError, PageId, Result, FIL_NULL};

use super::cursor::{BtrCursor, CursorFlag, LatchMode, LatchRequest, PathTrace, SearchMode};
use super::engine::IndexEngine;
use super::index::Index;
use super::latch::{peek, LeafLatchPlan};
use super::page::{self, PageMatch, PageSearchMode};
use super::rec::{self, Tuple};

#[derive(Copy, Clone)]
enum Target<'a> {
    Key(&'a Tuple, SearchMode),
    Side { from_left: bool },
    Random,
}

impl IndexEngine {
    /// Positions `cursor` on `level` for `tuple` and latches per `latch`.
    ///
    /// Non-leaf levels only support `LE`. Upper levels are searched with
    /// `L`/`LE` and released as the descent moves down; the target level
    /// uses `mode`. When `path` is given, one slot per visited level is
    /// recorded, root first.
    #[allow(clippy::too_many_arguments)]
    pub fn search_to_nth_level(
        &self,
        cursor: &mut BtrCursor,
        level: usize,
        tuple: &Tuple,
        mode: SearchMode,
        latch: impl Into<LatchRequest>,
        path: Option<&mut PathTrace>,
        mtr: &mut Mtr,
    ) -> Result<()> {
        let req = latch.into();
        if level > 0 && mode != PageSearchMode::LE {
            return Err(CairnError::Invalid("only LE searches are allowed above the leaf level"));
        }
        if level == 0
            && path.is_none()
            && self.options().adaptive_hash
            && matches!(req.mode, LatchMode::SearchLeaf | LatchMode::ModifyLeaf)
            && self.guess_on_hash(cursor, tuple, mode, req.mode, mtr)?
        {
            return Ok(());
        }
        self.descend(cursor, level, Target::Key(tuple, mode), req, path, mtr)
    }

    /// Positions `cursor` before the first or after the last leaf record.
    pub fn open_at_index_side(
        &self,
        from_left: bool,
        cursor: &mut BtrCursor,
        latch: impl Into<LatchRequest>,
        path: Option<&mut PathTrace>,
        mtr: &mut Mtr,
    ) -> Result<()> {
        self.descend(cursor, 0, Target::Side { from_left }, latch.into(), path, mtr)
    }

    /// Positions `cursor` on a random leaf record, choosing a random node
    /// pointer at every level.
    pub fn open_at_rnd_pos(&self, cursor: &mut BtrCursor, latch: impl Into<LatchRequest>, mtr: &mut Mtr) -> Result<()> {
        self.descend(cursor, 0, Target::Random, latch.into(), None, mtr)
    }

    fn descend(
        &self,
        cursor: &mut BtrCursor,
        level: usize,
        target: Target<'_>,
        req: LatchRequest,
        mut path: Option<&mut PathTrace>,
        mtr: &mut Mtr,
    ) -> Result<()> {
        let index = std::sync::Arc::clone(&cursor.index);
        cursor.flag = CursorFlag::BinarySearch;
        cursor.left_page = None;
        if let Some(p) = path.as_deref_mut() {
            p.clear();
        }

        let tree_sp = mtr.savepoint();
        let took_tree = self.take_tree_latch(&index, req, mtr)?;

        let root = index.root();
        let root_level = peek(mtr, root, |frame| page::level(frame) as usize)?;
        if level > root_level {
            return Err(CairnError::Invalid("search level above the root"));
        }
        cursor.tree_height = root_level + 1;

        let upper_mode = match target {
            Target::Key(_, PageSearchMode::GE) | Target::Key(_, PageSearchMode::L) => PageSearchMode::L,
            _ => PageSearchMode::LE,
        };
        let mut page_id = root;
        let mut height = root_level;
        let mut parent_slot: Option<usize> = None;
        loop {
            let sp = mtr.savepoint();
            if height == level && level == 0 {
                let ibuf_shortcut = req.insert_planned
                    && req.mode == LatchMode::ModifyLeaf
                    && self.options().insert_buffer
                    && index.is_ibuf_eligible()
                    && height < root_level;
                let fetch = if ibuf_shortcut { FetchMode::IfResident } else { FetchMode::Normal };
                let plan = LeafLatchPlan::for_mode(req.mode);
                if fetch == FetchMode::Normal {
                    self.merge_for_plan(&index, plan, page_id, mtr)?;
                }
                let latches = match plan.acquire(mtr, &index, page_id, fetch)? {
                    Some(latches) => latches,
                    None => {
                        if let Target::Key(tuple, _) = target {
                            if self.ibuf().buffer_insert(&index, page_id, self.page_size(), tuple) {
                                release_slot(mtr, parent_slot.take());
                                if took_tree {
                                    mtr.release_at_savepoint(tree_sp);
                                }
                                cursor.set(page_id, 0);
                                cursor.flag = CursorFlag::InsertBuffered;
                                self.stats().insert_buffered();
                                trace!(target: "cairn::btree::search", page = %page_id, "insert buffered");
                                return Ok(());
                            }
                        }
                        self.merge_for_plan(&index, plan, page_id, mtr)?;
                        plan.acquire(mtr, &index, page_id, FetchMode::Normal)?
                            .ok_or(CairnError::Corruption("normal fetch returned no page"))?
                    }
                };
                cursor.left_page = latches.left;
            } else if height == level {
                mtr.latch_page(page_id, RwLatch::Exclusive)?;
            } else {
                mtr.latch_page(page_id, RwLatch::Shared)?;
            }
            let pushed = (mtr.savepoint() > sp).then_some(sp);
            release_slot(mtr, parent_slot.take());

            let frame = mtr.page(page_id)?;
            page::check_index_page(frame)?;
            if page::index_id(frame) != index.id.0 {
                return Err(CairnError::Corruption("page belongs to another index"));
            }
            if page::level(frame) as usize != height {
                return Err(CairnError::Corruption("page level does not match its depth"));
            }
            let n_recs = page::n_recs(frame);
            let at_target = height == level;
            let m = match target {
                Target::Key(tuple, mode) => {
                    let mode = if at_target { mode } else { upper_mode };
                    page::search_with_match(frame, tuple, index.n_uniq, mode)?
                }
                Target::Side { from_left } => PageMatch {
                    pos: match (at_target, from_left) {
                        (true, true) => 0,
                        (true, false) => n_recs + 1,
                        (false, true) => 1,
                        (false, false) => n_recs,
                    },
                    ..PageMatch::default()
                },
                Target::Random => PageMatch {
                    pos: if n_recs == 0 {
                        0
                    } else {
                        self.rng().lock().gen_range(1..=n_recs)
                    },
                    ..PageMatch::default()
                },
            };
            if let Some(p) = path.as_deref_mut() {
                p.push(m.pos, n_recs);
            }
            if at_target {
                cursor.set(page_id, m.pos);
                cursor.up_match = m.up_match;
                cursor.up_bytes = m.up_bytes;
                cursor.low_match = m.low_match;
                cursor.low_bytes = m.low_bytes;
                break;
            }
            if m.pos == 0 || m.pos > n_recs {
                return Err(CairnError::Corruption("node pointer search left the user records"));
            }
            let child = rec::node_ptr_child(&page::rec_at(frame, m.pos)?)?;
            parent_slot = pushed;
            page_id = index.page_id(child);
            height -= 1;
        }

        if level == 0 && !req.mode.modifies_tree() && took_tree {
            mtr.release_at_savepoint(tree_sp);
        }
        self.stats().search_completed(root_level - level + 1);

        if let Target::Key(tuple, mode) = target {
            if level == 0 && self.options().adaptive_hash {
                let n_cmp = tuple.n_fields_cmp.min(index.n_uniq);
                let exact = match mode {
                    PageSearchMode::GE => cursor.up_match >= n_cmp,
                    PageSearchMode::LE => cursor.low_match >= n_cmp,
                    _ => false,
                };
                if exact && n_cmp == index.n_uniq {
                    self.ahi().update_on_search(&index, tuple, cursor.page_id());
                }
            }
        }
        trace!(
            target: "cairn::btree::search",
            index = %index.name,
            page = %cursor.page_id(),
            pos = cursor.pos(),
            level,
            "descent finished"
        );
        Ok(())
    }

    fn take_tree_latch(&self, index: &Index, req: LatchRequest, mtr: &mut Mtr) -> Result<bool> {
        match req.mode {
            LatchMode::ModifyTree => {
                if mtr.holds_tree_x(index.id) {
                    Ok(false)
                } else if mtr.holds_tree_latch(index.id) {
                    Err(CairnError::Invalid("tree latch upgrade inside one mini-transaction"))
                } else {
                    mtr.x_lock_tree(index.id, index.tree_latch());
                    Ok(true)
                }
            }
            LatchMode::ContModifyTree => {
                if mtr.holds_tree_x(index.id) {
                    Ok(false)
                } else {
                    Err(CairnError::Invalid("continued tree modification without the tree latch"))
                }
            }
            _ => {
                if req.already_s_latched || mtr.holds_tree_latch(index.id) {
                    Ok(false)
                } else {
                    mtr.s_lock_tree(index.id, index.tree_latch());
                    Ok(true)
                }
            }
        }
    }

    fn guess_on_hash(
        &self,
        cursor: &mut BtrCursor,
        tuple: &Tuple,
        mode: SearchMode,
        latch_mode: LatchMode,
        mtr: &mut Mtr,
    ) -> Result<bool> {
        let index = std::sync::Arc::clone(&cursor.index);
        let Some(guess) = self.ahi().guess(&index, tuple) else {
            return Ok(false);
        };
        let latch = if latch_mode == LatchMode::SearchLeaf {
            RwLatch::Shared
        } else {
            RwLatch::Exclusive
        };
        let sp = mtr.savepoint();
        let latched = match mtr.latch(guess, latch, FetchMode::IfResident) {
            Ok(latched) => latched,
            Err(err) => {
                trace!(target: "cairn::btree::search", page = %guess, %err, "hash guess unreadable");
                false
            }
        };
        // A leaf with parked inserts is merged by the full descent.
        if latched && !(index.is_ibuf_eligible() && self.ibuf().has_buffered(guess)) {
            if let Some(m) = self.check_guess(&index, guess, tuple, mode, mtr)? {
                cursor.set(guess, m.pos);
                cursor.up_match = m.up_match;
                cursor.up_bytes = m.up_bytes;
                cursor.low_match = m.low_match;
                cursor.low_bytes = m.low_bytes;
                cursor.left_page = None;
                cursor.tree_height = 0;
                cursor.flag = CursorFlag::HashHit;
                self.stats().hash_hit();
                return Ok(true);
            }
        }
        mtr.rollback_to_savepoint(sp);
        self.stats().hash_miss();
        Ok(false)
    }

    fn check_guess(
        &self,
        index: &Index,
        guess: PageId,
        tuple: &Tuple,
        mode: SearchMode,
        mtr: &Mtr,
    ) -> Result<Option<PageMatch>> {
        let frame = mtr.page(guess)?;
        if page::check_index_page(frame).is_err()
            || page::index_id(frame) != index.id.0
            || !page::is_leaf(frame)
        {
            return Ok(None);
        }
        let n = page::n_recs(frame);
        let n_cmp = tuple.n_fields_cmp.min(index.n_uniq);
        let m = page::search_with_match(frame, tuple, index.n_uniq, mode)?;
        let ok = match mode {
            PageSearchMode::GE => {
                m.up_match >= n_cmp && m.pos <= n && (m.pos > 1 || fil::prev(frame) == FIL_NULL)
            }
            PageSearchMode::LE => {
                m.low_match >= n_cmp && m.pos >= 1 && (m.pos < n || fil::next(frame) == FIL_NULL)
            }
            _ => false,
        };
        Ok(ok.then_some(m))
    }
}

fn release_slot(mtr: &mut Mtr, slot: Option<usize>) {
    if let Some(slot) = slot {
        mtr.release_at_savepoint(slot);
    }
}
