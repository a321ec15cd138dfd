//! Index storage: the B-tree cursor engine and its collaborators.
//!
//! The engine sits on top of the page accessor in [`crate::primitives`]
//! and talks to row locks, undo records, the adaptive hash index and the
//! insert buffer through traits so each can be swapped or disabled.

/// B-tree index cursor engine.
pub mod btree;

/// Engine configuration.
pub mod options;

/// Row locks and undo records.
pub mod txn;

pub use btree::{
    BtrCursor, DeleteError, EngineServices, Field, Index, IndexDef, IndexEngine, InsertError,
    LatchMode, OpFlags, SearchMode, Tuple, UpdateError, UpdateVector,
};
pub use options::EngineOptions;
pub use txn::{LockStatus, LockUndo, MemLockUndo, TxnCtx, UndoOp};
