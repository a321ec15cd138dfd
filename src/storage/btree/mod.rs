#![forbid(unsafe_code)]

//! Index cursor engine over slotted B-tree pages.
//!
//! Searches position a [`BtrCursor`] on a leaf or node-pointer level;
//! inserts, updates and deletes come in an optimistic flavour that touches
//! one page and a pessimistic one that may split, merge or discard pages
//! under the tree latch. Row-level drivers live in `row`.

/// Record format and tuple comparison.
pub mod rec;

/// Index page format and in-page operations.
pub mod page;

/// Externally stored column values.
pub mod overflow;

/// Redo records for in-place record changes.
pub mod redo;

mod cursor;
mod delete;
mod engine;
mod error;
mod estimate;
mod hash;
mod ibuf;
mod index;
mod insert;
mod latch;
mod row;
mod search;
mod stats;
mod structure;
mod update;

pub use cursor::{
    BtrCursor, CursorFlag, LatchMode, LatchRequest, PageCursor, PathSlot, PathTrace, SearchMode,
};
pub use engine::{EngineServices, IndexEngine, OpFlags};
pub use error::{DeleteError, InsertError, UpdateError};
pub use estimate::RANGE_ESTIMATE_FALLBACK;
pub use hash::{AdaptiveHashIndex, DisabledHashIndex, KeyHashIndex};
pub use ibuf::{calc_free_bits, free_from_bits, InsertBuffer, MemInsertBuffer, NoInsertBuffer};
pub use index::{Index, IndexDef, DATA_ROLL_PTR_LEN, DATA_TRX_ID_LEN, DICT_CLUSTERED, DICT_IBUF, DICT_UNIQUE};
pub use insert::InsertOutcome;
pub use latch::{LeafLatchPlan, LeafLatches};
pub use overflow::{BigRec, BigRecField, ExternRef};
pub use rec::{Field, Tuple};
pub use stats::{CursorStats, CursorStatsSnapshot, NoopStats, SearchStatsCollector};
pub use update::{UpdField, UpdateOutcome, UpdateVector, UPD_NODE_NO_ORD_CHANGE, UPD_NODE_NO_SIZE_CHANGE};

#[cfg(test)]
mod tests;
