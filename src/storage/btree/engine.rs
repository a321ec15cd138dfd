use std::sync::Arc;

use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::primitives::concurrency::HashIndexLatch;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::PageStore;
use crate::storage::options::EngineOptions;
use crate::storage::txn::{LockUndo, MemLockUndo};
use crate::types::{CairnError, IndexId, Result};

use super::hash::{AdaptiveHashIndex, DisabledHashIndex};
use super::ibuf::{InsertBuffer, NoInsertBuffer};
use super::index::{create_index, Index, IndexDef};
use super::stats::{NoopStats, SearchStatsCollector};

/// Flags that switch off parts of the lock/undo/system-field protocol.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpFlags(pub u8);

impl OpFlags {
    /// Full protocol.
    pub const NONE: OpFlags = OpFlags(0);
    /// Do not write undo records.
    pub const NO_UNDO_LOG: OpFlags = OpFlags(1);
    /// Do not request row locks.
    pub const NO_LOCKING: OpFlags = OpFlags(2);
    /// Leave `DB_TRX_ID` and `DB_ROLL_PTR` untouched.
    pub const KEEP_SYS: OpFlags = OpFlags(4);

    /// True when every bit of `other` is set.
    pub fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: OpFlags) -> OpFlags {
        OpFlags(self.0 | rhs.0)
    }
}

/// Collaborators the engine talks to.
#[derive(Clone)]
pub struct EngineServices {
    /// Row locks and undo records.
    pub locks: Arc<dyn LockUndo>,
    /// Adaptive hash index.
    pub hash_index: Arc<dyn AdaptiveHashIndex>,
    /// Latch serialising hash lookups with in-place record patches.
    pub hash_latch: Arc<HashIndexLatch>,
    /// Deferred secondary inserts.
    pub insert_buffer: Arc<dyn InsertBuffer>,
    /// Event sink.
    pub stats: Arc<dyn SearchStatsCollector>,
}

impl EngineServices {
    /// Services with the given lock manager and everything else disabled.
    pub fn new(locks: Arc<dyn LockUndo>) -> Self {
        Self {
            locks,
            hash_index: Arc::new(DisabledHashIndex),
            hash_latch: Arc::new(HashIndexLatch::new()),
            insert_buffer: Arc::new(NoInsertBuffer),
            stats: Arc::new(NoopStats),
        }
    }

    /// Installs a hash index.
    pub fn with_hash_index(mut self, hash_index: Arc<dyn AdaptiveHashIndex>) -> Self {
        self.hash_index = hash_index;
        self
    }

    /// Installs a shared hash-index latch.
    pub fn with_hash_latch(mut self, latch: Arc<HashIndexLatch>) -> Self {
        self.hash_latch = latch;
        self
    }

    /// Installs an insert buffer.
    pub fn with_insert_buffer(mut self, insert_buffer: Arc<dyn InsertBuffer>) -> Self {
        self.insert_buffer = insert_buffer;
        self
    }

    /// Installs a statistics collector.
    pub fn with_stats(mut self, stats: Arc<dyn SearchStatsCollector>) -> Self {
        self.stats = stats;
        self
    }
}

impl Default for EngineServices {
    fn default() -> Self {
        Self::new(Arc::new(MemLockUndo::new()))
    }
}

/// B-tree cursor engine over one page store.
pub struct IndexEngine {
    store: Arc<dyn PageStore>,
    services: EngineServices,
    options: EngineOptions,
    rng: Mutex<ChaCha8Rng>,
}

impl IndexEngine {
    /// Builds an engine; `options.page_size` must match the store.
    pub fn new(store: Arc<dyn PageStore>, services: EngineServices, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        if options.page_size as usize != store.page_size() {
            return Err(CairnError::Invalid("page_size does not match the page store"));
        }
        store.set_checksum_verification(options.verify_checksums);
        let rng = Mutex::new(ChaCha8Rng::seed_from_u64(options.random_seed));
        Ok(Self {
            store,
            services,
            options,
            rng,
        })
    }

    /// Page store.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Engine options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Starts a mini-transaction on the engine's store.
    pub fn start_mtr(&self) -> Mtr {
        Mtr::start(Arc::clone(&self.store))
    }

    /// Creates a new, empty index tree.
    pub fn create_index(&self, id: IndexId, def: IndexDef) -> Result<Arc<Index>> {
        create_index(&self.store, id, def)
    }

    /// Data size below which a page is a merge candidate.
    pub fn merge_limit(&self) -> usize {
        self.page_size() * self.options.merge_threshold_pct as usize / 100
    }

    pub(crate) fn locks(&self) -> &dyn LockUndo {
        self.services.locks.as_ref()
    }

    pub(crate) fn ahi(&self) -> &dyn AdaptiveHashIndex {
        self.services.hash_index.as_ref()
    }

    pub(crate) fn ahi_latch(&self) -> &HashIndexLatch {
        &self.services.hash_latch
    }

    pub(crate) fn ibuf(&self) -> &dyn InsertBuffer {
        self.services.insert_buffer.as_ref()
    }

    pub(crate) fn stats(&self) -> &dyn SearchStatsCollector {
        self.services.stats.as_ref()
    }

    pub(crate) fn rng(&self) -> &Mutex<ChaCha8Rng> {
        &self.rng
    }
}
