use std::sync::Arc;

use smallvec::SmallVec;

use crate::types::PageId;

use super::index::Index;
use super::page::PageSearchMode;

/// Search mode requested by the caller.
pub type SearchMode = PageSearchMode;

/// How the leaf (or target page) is latched once the descent finishes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// S-latch the target leaf.
    SearchLeaf,
    /// X-latch the target leaf.
    ModifyLeaf,
    /// Take the tree latch X, then X-latch left sibling, target, right sibling.
    ModifyTree,
    /// Like `ModifyTree` for a caller that already holds the tree latch X.
    ContModifyTree,
    /// S-latch left sibling and target.
    SearchPrev,
    /// X-latch left sibling and target.
    ModifyPrev,
}

impl LatchMode {
    /// True for modes that may change the tree structure.
    pub fn modifies_tree(self) -> bool {
        matches!(self, LatchMode::ModifyTree | LatchMode::ContModifyTree)
    }
}

/// Latch mode plus the modifiers a descent understands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LatchRequest {
    /// Leaf latching obligation.
    pub mode: LatchMode,
    /// The caller is about to insert; the insert buffer may take the entry.
    pub insert_planned: bool,
    /// The caller already holds the tree latch S.
    pub already_s_latched: bool,
}

impl LatchRequest {
    /// Plain request for `mode`.
    pub fn new(mode: LatchMode) -> Self {
        Self {
            mode,
            insert_planned: false,
            already_s_latched: false,
        }
    }

    /// Marks the descent as preceding an insert.
    pub fn insert_planned(mut self) -> Self {
        self.insert_planned = true;
        self
    }

    /// Marks the tree latch as already held shared.
    pub fn already_s_latched(mut self) -> Self {
        self.already_s_latched = true;
        self
    }
}

impl From<LatchMode> for LatchRequest {
    fn from(mode: LatchMode) -> Self {
        Self::new(mode)
    }
}

/// How the cursor was positioned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CursorFlag {
    /// Full descent with binary search.
    BinarySearch,
    /// Adaptive hash guess, verified on the page.
    HashHit,
    /// The insert went to the insert buffer; the leaf was never read.
    InsertBuffered,
}

/// Position inside one page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageCursor {
    /// Page the cursor points into.
    pub page: PageId,
    /// 0 = infimum, `n_recs + 1` = supremum.
    pub pos: usize,
}

/// Cursor over one index tree.
#[derive(Clone, Debug)]
pub struct BtrCursor {
    /// Tree being searched.
    pub index: Arc<Index>,
    /// Current position.
    pub page_cur: PageCursor,
    /// Matched fields against the upper bound of the last search.
    pub up_match: usize,
    /// Matched bytes against the upper bound.
    pub up_bytes: usize,
    /// Matched fields against the lower bound.
    pub low_match: usize,
    /// Matched bytes against the lower bound.
    pub low_bytes: usize,
    /// Levels in the tree; a lone root leaf has height 1.
    pub tree_height: usize,
    /// Left sibling latched by the `*Prev` and tree-modifying modes.
    pub left_page: Option<PageId>,
    /// How the position was obtained.
    pub flag: CursorFlag,
}

impl BtrCursor {
    /// Unpositioned cursor on `index`.
    pub fn new(index: Arc<Index>) -> Self {
        let root = index.root();
        Self {
            index,
            page_cur: PageCursor { page: root, pos: 0 },
            up_match: 0,
            up_bytes: 0,
            low_match: 0,
            low_bytes: 0,
            tree_height: 0,
            left_page: None,
            flag: CursorFlag::BinarySearch,
        }
    }

    /// Page the cursor points into.
    pub fn page_id(&self) -> PageId {
        self.page_cur.page
    }

    /// Position inside the page.
    pub fn pos(&self) -> usize {
        self.page_cur.pos
    }

    /// True when the cursor sits on the root page.
    pub fn is_on_root(&self) -> bool {
        self.page_cur.page == self.index.root()
    }

    pub(crate) fn set(&mut self, page: PageId, pos: usize) {
        self.page_cur = PageCursor { page, pos };
    }
}

/// One level of a recorded descent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PathSlot {
    /// Ordinal of the visited record (infimum = 0).
    pub nth_rec: usize,
    /// User records on the visited page.
    pub n_recs: usize,
}

/// Per-level record of a descent, root first. Only filled on request.
#[derive(Clone, Debug, Default)]
pub struct PathTrace {
    slots: SmallVec<[PathSlot; 8]>,
}

impl PathTrace {
    /// Empty trace.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, nth_rec: usize, n_recs: usize) {
        self.slots.push(PathSlot { nth_rec, n_recs });
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Slot recorded at depth `i`, `None` past the leaf.
    pub fn get(&self, i: usize) -> Option<PathSlot> {
        self.slots.get(i).copied()
    }

    /// Recorded levels.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
