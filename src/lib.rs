//! B-tree index cursor engine with mini-transactions, page splits and
//! merges, externally stored columns, and redo logging.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod primitives;
pub mod storage;
pub mod types;

pub use storage::{EngineOptions, EngineServices, Index, IndexDef, IndexEngine, TxnCtx, Tuple};
pub use types::{CairnError, PageId, Result, SpaceId};
