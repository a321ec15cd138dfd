//! Row locking and undo logging as seen from the cursor engine.
//!
//! The engine asks for a lock and an undo record before touching a page and
//! reports record movements afterwards so locks follow their records.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::storage::btree::{Index, Tuple, UpdateVector};
use crate::types::{IndexId, PageId, Result, RollPtr, TrxId};

/// Transaction context passed through every modifying call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TxnCtx {
    /// Id written into `DB_TRX_ID`.
    pub trx_id: TrxId,
}

impl TxnCtx {
    /// Context for transaction `trx_id`.
    pub fn new(trx_id: u64) -> Self {
        Self {
            trx_id: TrxId(trx_id),
        }
    }
}

/// Outcome of a lock request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockStatus {
    /// The lock is held; proceed.
    Granted,
    /// Another transaction holds a conflicting lock.
    Wait,
}

/// Kind of undo record to write.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UndoOp {
    /// Fresh insert; undone by removing the record.
    Insert,
    /// Update or delete-mark; undone by restoring the old image.
    Modify,
}

/// A record inside a page, addressed by heap number.
pub type RecAddr = (PageId, u16);

/// Lock manager and undo writer.
pub trait LockUndo: Send + Sync {
    /// Checks the gap before `next` for an insert by `ctx`.
    fn lock_insert(&self, ctx: TxnCtx, index: &Index, next: RecAddr) -> Result<LockStatus>;

    /// Takes an exclusive lock on a clustered record about to be modified.
    fn lock_modify_clust(&self, ctx: TxnCtx, index: &Index, rec: RecAddr) -> Result<LockStatus>;

    /// Takes an exclusive lock on a secondary record about to be delete-marked.
    fn lock_modify_sec(&self, ctx: TxnCtx, index: &Index, rec: RecAddr) -> Result<LockStatus>;

    /// Writes an undo record and returns its rollback pointer.
    fn report_row_operation(
        &self,
        ctx: TxnCtx,
        op: UndoOp,
        index: &Index,
        image: &Tuple,
        update: Option<&UpdateVector>,
    ) -> Result<RollPtr>;

    /// A record was inserted before `next`; it inherits gap locks of `next`.
    fn on_insert(&self, rec: RecAddr, next: RecAddr);

    /// A record is being removed; `next` inherits its locks as gap locks.
    fn on_delete(&self, rec: RecAddr, next: RecAddr);

    /// A record moved to another page or heap number.
    fn move_rec(&self, from: RecAddr, to: RecAddr);

    /// Parks the locks of `rec` on its page infimum.
    fn store_on_infimum(&self, rec: RecAddr);

    /// Moves the locks parked on `page`'s infimum to `to`.
    fn restore_from_infimum(&self, page: PageId, to: RecAddr);

    /// Replaces the locks on `heir` with gap copies of those on `donor`.
    fn reset_and_inherit_gap_locks(&self, heir: RecAddr, donor: RecAddr);

    /// Adds gap copies of the locks on `donor` to `heir`.
    fn inherit_to_gap(&self, heir: RecAddr, donor: RecAddr);

    /// Every lock on `page` becomes a gap lock on `heir`.
    fn on_page_discard(&self, page: PageId, heir: RecAddr);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct LockEntry {
    trx: TrxId,
    gap_only: bool,
}

/// Undo record kept by [`MemLockUndo`].
#[derive(Clone, Debug)]
pub struct UndoRecord {
    /// Writer.
    pub trx_id: TrxId,
    /// Operation.
    pub op: UndoOp,
    /// Index the record belongs to.
    pub index: IndexId,
    /// Entry for inserts, old image for modifications.
    pub image: Tuple,
    /// Update vector for modifications.
    pub update: Option<UpdateVector>,
}

const ROLL_PTR_INSERT_FLAG: u64 = 1 << 55;

#[derive(Default)]
struct LockTable {
    locks: FxHashMap<RecAddr, Vec<LockEntry>>,
    undo: Vec<UndoRecord>,
}

impl LockTable {
    fn conflicts(&self, at: RecAddr, trx: TrxId, include_gap: bool) -> bool {
        self.locks
            .get(&at)
            .map(|entries| {
                entries
                    .iter()
                    .any(|e| e.trx != trx && (include_gap || !e.gap_only))
            })
            .unwrap_or(false)
    }

    fn grant(&mut self, at: RecAddr, trx: TrxId) {
        let entries = self.locks.entry(at).or_default();
        if let Some(e) = entries.iter_mut().find(|e| e.trx == trx) {
            e.gap_only = false;
        } else {
            entries.push(LockEntry { trx, gap_only: false });
        }
    }

    fn add_gap_copies(&mut self, to: RecAddr, from: &[LockEntry]) {
        if from.is_empty() {
            return;
        }
        let entries = self.locks.entry(to).or_default();
        for e in from {
            if !entries.iter().any(|x| x.trx == e.trx) {
                entries.push(LockEntry {
                    trx: e.trx,
                    gap_only: true,
                });
            }
        }
    }

    fn transfer(&mut self, from: RecAddr, to: RecAddr) {
        if from == to {
            return;
        }
        if let Some(moved) = self.locks.remove(&from) {
            let entries = self.locks.entry(to).or_default();
            for e in moved {
                if !entries.iter().any(|x| x.trx == e.trx) {
                    entries.push(e);
                }
            }
        }
    }
}

/// In-memory lock table and undo log.
#[derive(Default)]
pub struct MemLockUndo {
    inner: Mutex<LockTable>,
}

impl MemLockUndo {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `trx` an exclusive lock on `rec`, as a reader or another
    /// writer would have.
    pub fn lock_record(&self, trx: TrxId, rec: RecAddr) {
        self.inner.lock().grant(rec, trx);
    }

    /// Transactions holding any lock on `rec`.
    pub fn holders(&self, rec: RecAddr) -> Vec<TrxId> {
        self.inner
            .lock()
            .locks
            .get(&rec)
            .map(|entries| entries.iter().map(|e| e.trx).collect())
            .unwrap_or_default()
    }

    /// Drops every lock held by `trx`.
    pub fn release_all(&self, trx: TrxId) {
        let mut table = self.inner.lock();
        table.locks.retain(|_, entries| {
            entries.retain(|e| e.trx != trx);
            !entries.is_empty()
        });
    }

    /// Copies of the undo records written so far.
    pub fn undo_records(&self) -> Vec<UndoRecord> {
        self.inner.lock().undo.clone()
    }

    fn request(&self, ctx: TxnCtx, at: RecAddr, include_gap: bool, grant: bool) -> LockStatus {
        let mut table = self.inner.lock();
        if table.conflicts(at, ctx.trx_id, include_gap) {
            trace!(target: "cairn::txn", trx = ctx.trx_id.0, page = %at.0, heap_no = at.1, "lock wait");
            return LockStatus::Wait;
        }
        if grant {
            table.grant(at, ctx.trx_id);
        }
        LockStatus::Granted
    }
}

impl LockUndo for MemLockUndo {
    fn lock_insert(&self, ctx: TxnCtx, _index: &Index, next: RecAddr) -> Result<LockStatus> {
        Ok(self.request(ctx, next, true, false))
    }

    fn lock_modify_clust(&self, ctx: TxnCtx, _index: &Index, rec: RecAddr) -> Result<LockStatus> {
        Ok(self.request(ctx, rec, false, true))
    }

    fn lock_modify_sec(&self, ctx: TxnCtx, _index: &Index, rec: RecAddr) -> Result<LockStatus> {
        Ok(self.request(ctx, rec, false, true))
    }

    fn report_row_operation(
        &self,
        ctx: TxnCtx,
        op: UndoOp,
        index: &Index,
        image: &Tuple,
        update: Option<&UpdateVector>,
    ) -> Result<RollPtr> {
        let mut table = self.inner.lock();
        table.undo.push(UndoRecord {
            trx_id: ctx.trx_id,
            op,
            index: index.id,
            image: image.clone(),
            update: update.cloned(),
        });
        let seq = table.undo.len() as u64;
        let flag = if op == UndoOp::Insert { ROLL_PTR_INSERT_FLAG } else { 0 };
        Ok(RollPtr(flag | seq))
    }

    fn on_insert(&self, rec: RecAddr, next: RecAddr) {
        let mut table = self.inner.lock();
        let donors = table.locks.get(&next).cloned().unwrap_or_default();
        table.add_gap_copies(rec, &donors);
    }

    fn on_delete(&self, rec: RecAddr, next: RecAddr) {
        let mut table = self.inner.lock();
        if let Some(removed) = table.locks.remove(&rec) {
            table.add_gap_copies(next, &removed);
        }
    }

    fn move_rec(&self, from: RecAddr, to: RecAddr) {
        self.inner.lock().transfer(from, to);
    }

    fn store_on_infimum(&self, rec: RecAddr) {
        self.inner.lock().transfer(rec, (rec.0, 0));
    }

    fn restore_from_infimum(&self, page: PageId, to: RecAddr) {
        self.inner.lock().transfer((page, 0), to);
    }

    fn reset_and_inherit_gap_locks(&self, heir: RecAddr, donor: RecAddr) {
        let mut table = self.inner.lock();
        table.locks.remove(&heir);
        let donors = table.locks.get(&donor).cloned().unwrap_or_default();
        table.add_gap_copies(heir, &donors);
    }

    fn inherit_to_gap(&self, heir: RecAddr, donor: RecAddr) {
        let mut table = self.inner.lock();
        let donors = table.locks.get(&donor).cloned().unwrap_or_default();
        table.add_gap_copies(heir, &donors);
    }

    fn on_page_discard(&self, page: PageId, heir: RecAddr) {
        let mut table = self.inner.lock();
        let keys: Vec<RecAddr> = table.locks.keys().filter(|k| k.0 == page).copied().collect();
        for key in keys {
            if let Some(removed) = table.locks.remove(&key) {
                table.add_gap_copies(heir, &removed);
            }
        }
    }
}
