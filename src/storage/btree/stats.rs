use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Receives cursor-engine events. Injected into the engine so several
/// engines in one process keep separate counters.
pub trait SearchStatsCollector: Send + Sync {
    /// A descent finished with a binary search on the target page.
    fn search_completed(&self, levels: usize);
    /// The adaptive hash guess was verified on the page.
    fn hash_hit(&self);
    /// The adaptive hash guess was wrong or the page was unavailable.
    fn hash_miss(&self);
    /// An insert went to the insert buffer.
    fn insert_buffered(&self);
    /// An optimistic insert landed on the page.
    fn optimistic_insert(&self);
    /// A page was split or the root raised.
    fn page_split(&self, leaf: bool);
    /// A page was merged into a sibling or discarded.
    fn page_merge(&self, leaf: bool);
    /// A page was reorganized to make room.
    fn page_reorganized(&self);
    /// Overflow pages were written.
    fn overflow_pages_written(&self, pages: u64);
    /// Overflow pages were freed.
    fn overflow_pages_freed(&self, pages: u64);
}

/// Collector that drops every event.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoopStats;

impl SearchStatsCollector for NoopStats {
    fn search_completed(&self, _levels: usize) {}
    fn hash_hit(&self) {}
    fn hash_miss(&self) {}
    fn insert_buffered(&self) {}
    fn optimistic_insert(&self) {}
    fn page_split(&self, _leaf: bool) {}
    fn page_merge(&self, _leaf: bool) {}
    fn page_reorganized(&self) {}
    fn overflow_pages_written(&self, _pages: u64) {}
    fn overflow_pages_freed(&self, _pages: u64) {}
}

/// Snapshot of cursor statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorStatsSnapshot {
    /// Completed descents.
    pub searches: u64,
    /// Pages visited by descents.
    pub levels_visited: u64,
    /// Verified adaptive hash guesses.
    pub hash_hits: u64,
    /// Failed adaptive hash guesses.
    pub hash_misses: u64,
    /// Inserts handed to the insert buffer.
    pub inserts_buffered: u64,
    /// Inserts that needed no structural change.
    pub optimistic_inserts: u64,
    /// Leaf splits.
    pub leaf_splits: u64,
    /// Non-leaf splits and root raises.
    pub internal_splits: u64,
    /// Leaf merges and discards.
    pub leaf_merges: u64,
    /// Non-leaf merges and discards.
    pub internal_merges: u64,
    /// Page reorganizations.
    pub reorganizations: u64,
    /// Overflow pages written.
    pub overflow_pages_written: u64,
    /// Overflow pages freed.
    pub overflow_pages_freed: u64,
}

/// Atomic counters implementing [`SearchStatsCollector`].
#[derive(Default)]
pub struct CursorStats {
    searches: AtomicU64,
    levels_visited: AtomicU64,
    hash_hits: AtomicU64,
    hash_misses: AtomicU64,
    inserts_buffered: AtomicU64,
    optimistic_inserts: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    reorganizations: AtomicU64,
    overflow_pages_written: AtomicU64,
    overflow_pages_freed: AtomicU64,
}

impl CursorStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every counter.
    pub fn snapshot(&self) -> CursorStatsSnapshot {
        CursorStatsSnapshot {
            searches: self.searches.load(AtomicOrdering::Relaxed),
            levels_visited: self.levels_visited.load(AtomicOrdering::Relaxed),
            hash_hits: self.hash_hits.load(AtomicOrdering::Relaxed),
            hash_misses: self.hash_misses.load(AtomicOrdering::Relaxed),
            inserts_buffered: self.inserts_buffered.load(AtomicOrdering::Relaxed),
            optimistic_inserts: self.optimistic_inserts.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            internal_splits: self.internal_splits.load(AtomicOrdering::Relaxed),
            leaf_merges: self.leaf_merges.load(AtomicOrdering::Relaxed),
            internal_merges: self.internal_merges.load(AtomicOrdering::Relaxed),
            reorganizations: self.reorganizations.load(AtomicOrdering::Relaxed),
            overflow_pages_written: self.overflow_pages_written.load(AtomicOrdering::Relaxed),
            overflow_pages_freed: self.overflow_pages_freed.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits the current counters to the tracing sink.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "cairn::btree::stats",
            searches = snapshot.searches,
            levels_visited = snapshot.levels_visited,
            hash_hits = snapshot.hash_hits,
            hash_misses = snapshot.hash_misses,
            inserts_buffered = snapshot.inserts_buffered,
            optimistic_inserts = snapshot.optimistic_inserts,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            reorganizations = snapshot.reorganizations,
            overflow_pages_written = snapshot.overflow_pages_written,
            overflow_pages_freed = snapshot.overflow_pages_freed,
            "cursor stats snapshot"
        );
    }
}

impl SearchStatsCollector for CursorStats {
    fn search_completed(&self, levels: usize) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
        self.levels_visited
            .fetch_add(levels as u64, AtomicOrdering::Relaxed);
    }

    fn hash_hit(&self) {
        self.hash_hits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn hash_miss(&self) {
        self.hash_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn insert_buffered(&self) {
        self.inserts_buffered.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn optimistic_insert(&self) {
        self.optimistic_inserts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn page_split(&self, leaf: bool) {
        let counter = if leaf { &self.leaf_splits } else { &self.internal_splits };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn page_merge(&self, leaf: bool) {
        let counter = if leaf { &self.leaf_merges } else { &self.internal_merges };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn page_reorganized(&self) {
        self.reorganizations.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn overflow_pages_written(&self, pages: u64) {
        self.overflow_pages_written
            .fetch_add(pages, AtomicOrdering::Relaxed);
    }

    fn overflow_pages_freed(&self, pages: u64) {
        self.overflow_pages_freed
            .fetch_add(pages, AtomicOrdering::Relaxed);
    }
}
