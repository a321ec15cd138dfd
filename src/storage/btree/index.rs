use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tracing::debug;

use crate::primitives::concurrency::TreeLatch;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::PageStore;
use crate::types::{CairnError, IndexId, PageId, Result, SpaceId};

use super::page;

/// Index type bit: leaf records hold the whole row.
pub const DICT_CLUSTERED: u8 = 1;
/// Index type bit: no two records share the ordering prefix.
pub const DICT_UNIQUE: u8 = 2;
/// Index type bit: the tree is the insert buffer itself.
pub const DICT_IBUF: u8 = 8;

/// Length of the transaction id system field.
pub const DATA_TRX_ID_LEN: usize = 6;
/// Length of the rollback pointer system field.
pub const DATA_ROLL_PTR_LEN: usize = 7;

/// Shape of an index to create.
#[derive(Clone, Debug)]
pub struct IndexDef {
    /// Human-readable name, used in logs.
    pub name: String,
    /// Tablespace holding every page of the tree.
    pub space: SpaceId,
    /// `DICT_*` bits.
    pub kind: u8,
    /// Fields per leaf record, system fields included.
    pub n_fields: usize,
    /// Fields that order the tree and appear in node pointers.
    pub n_uniq: usize,
    /// Ordering fields defined by the user (excludes appended primary key columns).
    pub n_user_defined: usize,
}

impl IndexDef {
    /// Clustered index ordered by `n_key` fields, followed by the two system
    /// fields and `n_cols` non-key columns.
    pub fn clustered(name: impl Into<String>, space: SpaceId, n_key: usize, n_cols: usize) -> Self {
        Self {
            name: name.into(),
            space,
            kind: DICT_CLUSTERED | DICT_UNIQUE,
            n_fields: n_key + 2 + n_cols,
            n_uniq: n_key,
            n_user_defined: n_key,
        }
    }

    /// Secondary index on `n_user` columns with `n_pk` primary key columns
    /// appended; every field orders the tree.
    pub fn secondary(name: impl Into<String>, space: SpaceId, n_user: usize, n_pk: usize) -> Self {
        Self {
            name: name.into(),
            space,
            kind: 0,
            n_fields: n_user + n_pk,
            n_uniq: n_user + n_pk,
            n_user_defined: n_user,
        }
    }

    /// Adds `DICT_UNIQUE`.
    pub fn unique(mut self) -> Self {
        self.kind |= DICT_UNIQUE;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.n_uniq == 0 || self.n_uniq > self.n_fields {
            return Err(CairnError::Invalid("n_uniq must be in 1..=n_fields"));
        }
        if self.n_user_defined == 0 || self.n_user_defined > self.n_uniq {
            return Err(CairnError::Invalid("n_user_defined must be in 1..=n_uniq"));
        }
        if self.kind & DICT_CLUSTERED != 0 && self.n_fields < self.n_uniq + 2 {
            return Err(CairnError::Invalid("clustered index needs room for system fields"));
        }
        Ok(())
    }
}

/// One B-tree. The root page number is fixed for the life of the tree.
pub struct Index {
    /// Identifier stamped on every page.
    pub id: IndexId,
    /// Name used in logs.
    pub name: String,
    /// Tablespace of the tree.
    pub space: SpaceId,
    /// Root page number.
    pub root_page_no: u32,
    /// `DICT_*` bits.
    pub kind: u8,
    /// Fields per leaf record.
    pub n_fields: usize,
    /// Ordering fields.
    pub n_uniq: usize,
    /// User-defined ordering fields.
    pub n_user_defined: usize,
    tree: TreeLatch,
    stat_n_rows: AtomicU64,
}

impl Index {
    /// True for the clustered index.
    pub fn is_clustered(&self) -> bool {
        self.kind & DICT_CLUSTERED != 0
    }

    /// True for unique indexes.
    pub fn is_unique(&self) -> bool {
        self.kind & DICT_UNIQUE != 0
    }

    /// True for the insert buffer tree.
    pub fn is_ibuf(&self) -> bool {
        self.kind & DICT_IBUF != 0
    }

    /// Secondary, non-unique indexes may have inserts buffered.
    pub fn is_ibuf_eligible(&self) -> bool {
        self.kind & (DICT_CLUSTERED | DICT_UNIQUE | DICT_IBUF) == 0
    }

    /// Root page address.
    pub fn root(&self) -> PageId {
        PageId::new(self.space, self.root_page_no)
    }

    /// Address of page `page_no` in this tree's space.
    pub fn page_id(&self, page_no: u32) -> PageId {
        PageId::new(self.space, page_no)
    }

    /// Tree latch.
    pub fn tree_latch(&self) -> &TreeLatch {
        &self.tree
    }

    /// Position of `DB_TRX_ID`, present only in clustered records.
    pub fn trx_id_pos(&self) -> Option<usize> {
        self.is_clustered().then_some(self.n_uniq)
    }

    /// Position of `DB_ROLL_PTR`, present only in clustered records.
    pub fn roll_ptr_pos(&self) -> Option<usize> {
        self.is_clustered().then_some(self.n_uniq + 1)
    }

    /// Table row-count statistic.
    pub fn stat_n_rows(&self) -> u64 {
        self.stat_n_rows.load(AtomicOrdering::Relaxed)
    }

    /// Overwrites the row-count statistic.
    pub fn set_stat_n_rows(&self, rows: u64) {
        self.stat_n_rows.store(rows, AtomicOrdering::Relaxed);
    }

    pub(crate) fn adjust_stat_n_rows(&self, delta: i64) {
        let _ = self
            .stat_n_rows
            .fetch_update(AtomicOrdering::Relaxed, AtomicOrdering::Relaxed, |n| {
                Some(n.saturating_add_signed(delta))
            });
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("root", &self.root())
            .field("kind", &self.kind)
            .finish()
    }
}

/// Allocates an empty root leaf and returns the new tree.
pub fn create_index(store: &Arc<dyn PageStore>, id: IndexId, def: IndexDef) -> Result<Arc<Index>> {
    def.validate()?;
    let mut mtr = Mtr::start(Arc::clone(store));
    let root = mtr.allocate_page(def.space, None)?;
    page::create(mtr.page_mut(root)?, 0, id.0);
    mtr.commit()?;
    debug!(target: "cairn::btree::structure", index = %def.name, root = %root, "created index");
    Ok(Arc::new(Index {
        id,
        name: def.name,
        space: def.space,
        root_page_no: root.page_no,
        kind: def.kind,
        n_fields: def.n_fields,
        n_uniq: def.n_uniq,
        n_user_defined: def.n_user_defined,
        tree: TreeLatch::new(),
        stat_n_rows: AtomicU64::new(0),
    }))
}
