use thiserror::Error;

use crate::types::CairnError;

/// Why an insert did not complete.
#[derive(Debug, Error)]
pub enum InsertError {
    /// A conflicting row lock is held; nothing was changed.
    #[error("lock wait")]
    LockWait,
    /// The record cannot be stored even with overflow pages.
    #[error("record too big")]
    RecordTooBig,
    /// The optimistic path declined; run the pessimistic insert.
    #[error("page split required")]
    RequiresSplit,
    /// Extent reservation failed.
    #[error("out of file space")]
    OutOfFileSpace,
    /// Page store or structural failure.
    #[error(transparent)]
    Storage(CairnError),
}

impl From<CairnError> for InsertError {
    fn from(err: CairnError) -> Self {
        match err {
            CairnError::OutOfFileSpace => InsertError::OutOfFileSpace,
            other => InsertError::Storage(other),
        }
    }
}

/// Why an update did not complete.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// A conflicting row lock is held; nothing was changed.
    #[error("lock wait")]
    LockWait,
    /// The new record cannot be stored even with overflow pages.
    #[error("record too big")]
    RecordTooBig,
    /// The record does not fit on its page; use the pessimistic update.
    #[error("page would overflow")]
    Overflow,
    /// The page would fall below the merge threshold.
    #[error("page would underflow")]
    Underflow,
    /// Extent reservation failed.
    #[error("out of file space")]
    OutOfFileSpace,
    /// Page store or structural failure.
    #[error(transparent)]
    Storage(CairnError),
}

impl From<CairnError> for UpdateError {
    fn from(err: CairnError) -> Self {
        match err {
            CairnError::OutOfFileSpace => UpdateError::OutOfFileSpace,
            other => UpdateError::Storage(other),
        }
    }
}

impl From<InsertError> for UpdateError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::LockWait => UpdateError::LockWait,
            InsertError::RecordTooBig => UpdateError::RecordTooBig,
            InsertError::RequiresSplit => UpdateError::Overflow,
            InsertError::OutOfFileSpace => UpdateError::OutOfFileSpace,
            InsertError::Storage(e) => UpdateError::Storage(e),
        }
    }
}

/// Why a delete-mark or physical delete did not complete.
#[derive(Debug, Error)]
pub enum DeleteError {
    /// A conflicting row lock is held; nothing was changed.
    #[error("lock wait")]
    LockWait,
    /// Extent reservation failed.
    #[error("out of file space")]
    OutOfFileSpace,
    /// Page store or structural failure.
    #[error(transparent)]
    Storage(CairnError),
}

impl From<CairnError> for DeleteError {
    fn from(err: CairnError) -> Self {
        match err {
            CairnError::OutOfFileSpace => DeleteError::OutOfFileSpace,
            other => DeleteError::Storage(other),
        }
    }
}

impl From<InsertError> for DeleteError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::LockWait => DeleteError::LockWait,
            InsertError::OutOfFileSpace => DeleteError::OutOfFileSpace,
            InsertError::Storage(e) => DeleteError::Storage(e),
            InsertError::RecordTooBig => {
                DeleteError::Storage(CairnError::Corruption("node pointer too big"))
            }
            InsertError::RequiresSplit => {
                DeleteError::Storage(CairnError::Corruption("node pointer insert declined"))
            }
        }
    }
}

impl From<InsertError> for CairnError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::Storage(e) => e,
            InsertError::OutOfFileSpace => CairnError::OutOfFileSpace,
            InsertError::LockWait => CairnError::Corruption("node pointer insert waited for a lock"),
            InsertError::RecordTooBig => CairnError::Corruption("node pointer too big"),
            InsertError::RequiresSplit => CairnError::Corruption("node pointer insert declined"),
        }
    }
}

impl From<DeleteError> for CairnError {
    fn from(err: DeleteError) -> Self {
        match err {
            DeleteError::Storage(e) => e,
            DeleteError::OutOfFileSpace => CairnError::OutOfFileSpace,
            DeleteError::LockWait => CairnError::Corruption("node pointer delete waited for a lock"),
        }
    }
}

impl From<UpdateError> for CairnError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::Storage(e) => e,
            UpdateError::OutOfFileSpace => CairnError::OutOfFileSpace,
            UpdateError::LockWait => CairnError::Invalid("update waited for a lock"),
            UpdateError::RecordTooBig => CairnError::Invalid("updated record too big"),
            UpdateError::Overflow | UpdateError::Underflow => CairnError::Invalid("update needs the tree path"),
        }
    }
}
