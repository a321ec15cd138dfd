//! Leaf latching in the fixed left sibling, target, right sibling order.

use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::FetchMode;
use crate::types::{page as fil, CairnError, PageId, Result, FIL_NULL};

use super::cursor::LatchMode;
use super::index::Index;

/// Latches taken on a target leaf for one latch mode.
///
/// Guards live in the mini-transaction memo and are released in reverse
/// order at commit, so a plan can only acquire.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LeafLatchPlan {
    /// S on the target.
    SearchLeaf,
    /// X on the target.
    ModifyLeaf,
    /// X on left sibling, target and right sibling.
    ModifyTree,
    /// S on left sibling and target.
    SearchPrev,
    /// X on left sibling and target.
    ModifyPrev,
}

/// Siblings latched together with the target.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LeafLatches {
    /// Left sibling, when latched.
    pub left: Option<PageId>,
    /// Right sibling, when latched.
    pub right: Option<PageId>,
}

impl LeafLatchPlan {
    /// Plan for a descent in `mode`.
    pub fn for_mode(mode: LatchMode) -> Self {
        match mode {
            LatchMode::SearchLeaf => LeafLatchPlan::SearchLeaf,
            LatchMode::ModifyLeaf => LeafLatchPlan::ModifyLeaf,
            LatchMode::ModifyTree | LatchMode::ContModifyTree => LeafLatchPlan::ModifyTree,
            LatchMode::SearchPrev => LeafLatchPlan::SearchPrev,
            LatchMode::ModifyPrev => LeafLatchPlan::ModifyPrev,
        }
    }

    fn latch(self) -> RwLatch {
        match self {
            LeafLatchPlan::SearchLeaf | LeafLatchPlan::SearchPrev => RwLatch::Shared,
            _ => RwLatch::Exclusive,
        }
    }

    pub(crate) fn wants_left(self) -> bool {
        matches!(
            self,
            LeafLatchPlan::ModifyTree | LeafLatchPlan::SearchPrev | LeafLatchPlan::ModifyPrev
        )
    }

    pub(crate) fn wants_right(self) -> bool {
        self == LeafLatchPlan::ModifyTree
    }

    /// Latches the target and the siblings this plan covers.
    ///
    /// Returns `None` when `fetch` is `IfResident` and the target is not in
    /// memory; nothing stays latched in that case.
    pub fn acquire(self, mtr: &mut Mtr, index: &Index, target: PageId, fetch: FetchMode) -> Result<Option<LeafLatches>> {
        let latch = self.latch();
        let start = mtr.savepoint();
        let mut out = LeafLatches::default();
        if self.wants_left() {
            let prev = peek(mtr, target, |page| fil::prev(page))?;
            if prev != FIL_NULL {
                let left = index.page_id(prev);
                mtr.latch_page(left, latch)?;
                if fil::next(mtr.page(left)?) != target.page_no {
                    return Err(CairnError::Corruption("left sibling does not link back"));
                }
                out.left = Some(left);
            }
        }
        if !mtr.latch(target, latch, fetch)? {
            mtr.rollback_to_savepoint(start);
            return Ok(None);
        }
        if self.wants_right() {
            let next = fil::next(mtr.page(target)?);
            if next != FIL_NULL {
                let right = index.page_id(next);
                mtr.latch_page(right, latch)?;
                if fil::prev(mtr.page(right)?) != target.page_no {
                    return Err(CairnError::Corruption("right sibling does not link back"));
                }
                out.right = Some(right);
            }
        }
        Ok(Some(out))
    }
}

/// Reads a header value of `id` under a short S latch, or from the latch
/// already held by `mtr`.
pub(crate) fn peek<T>(mtr: &mut Mtr, id: PageId, read: impl FnOnce(&[u8]) -> T) -> Result<T> {
    if mtr.held_latch(id).is_some() {
        return Ok(read(mtr.page(id)?));
    }
    let sp = mtr.savepoint();
    mtr.latch_page(id, RwLatch::Shared)?;
    let value = read(mtr.page(id)?);
    mtr.release_at_savepoint(sp);
    Ok(value)
}
