//! Row-count and distinct-key estimates from sampled descents.

use tracing::debug;

use crate::types::Result;

use super::cursor::{BtrCursor, LatchMode, PathTrace, SearchMode};
use super::engine::IndexEngine;
use super::index::Index;
use super::page;
use super::rec::{self, Tuple};

/// Estimate returned when the right search path ends left of the left one,
/// which happens when the tree changed between the two descents.
pub const RANGE_ESTIMATE_FALLBACK: u64 = 10;

/// Distinct-key estimate when no sampled neighbours differed.
const MIN_DISTINCT_ESTIMATE: u64 = 2;

impl IndexEngine {
    /// Estimates the number of rows between two search positions.
    ///
    /// An empty bound tuple stands for the matching end of the index.
    pub fn estimate_n_rows_in_range(
        &self,
        index: &std::sync::Arc<Index>,
        tuple1: &Tuple,
        mode1: SearchMode,
        tuple2: &Tuple,
        mode2: SearchMode,
    ) -> Result<u64> {
        let path1 = self.trace_path(index, tuple1, mode1, true)?;
        let path2 = self.trace_path(index, tuple2, mode2, false)?;

        let mut n_rows: u64 = 1;
        let mut diverged = false;
        let mut diverged_lot = false;
        let mut divergence_level = usize::MAX;
        let mut i = 0;
        loop {
            let (Some(slot1), Some(slot2)) = (path1.get(i), path2.get(i)) else {
                if divergence_level != usize::MAX && i > divergence_level + 1 {
                    // Estimates from trees of height > 1 run low.
                    n_rows *= 2;
                }
                let table_rows = index.stat_n_rows();
                if table_rows > 0 && n_rows > table_rows / 2 {
                    n_rows = table_rows / 2;
                    if n_rows == 0 {
                        n_rows = table_rows;
                    }
                }
                debug!(target: "cairn::btree::stats", index = %index.name, n_rows, "range estimate");
                return Ok(n_rows);
            };
            if !diverged && slot1.nth_rec != slot2.nth_rec {
                diverged = true;
                if slot1.nth_rec > slot2.nth_rec {
                    return Ok(RANGE_ESTIMATE_FALLBACK);
                }
                n_rows = (slot2.nth_rec - slot1.nth_rec) as u64;
                if n_rows > 1 {
                    diverged_lot = true;
                    divergence_level = i;
                }
            } else if diverged && !diverged_lot {
                if slot1.nth_rec < slot1.n_recs || slot2.nth_rec > 1 {
                    diverged_lot = true;
                    divergence_level = i;
                    n_rows = 0;
                    if slot1.nth_rec < slot1.n_recs {
                        n_rows += (slot1.n_recs - slot1.nth_rec) as u64;
                    }
                    if slot2.nth_rec > 1 {
                        n_rows += (slot2.nth_rec - 1) as u64;
                    }
                }
            } else if diverged_lot {
                n_rows = n_rows * (slot1.n_recs + slot2.n_recs) as u64 / 2;
            }
            i += 1;
        }
    }

    fn trace_path(&self, index: &std::sync::Arc<Index>, tuple: &Tuple, mode: SearchMode, left: bool) -> Result<PathTrace> {
        let mut path = PathTrace::new();
        let mut cursor = BtrCursor::new(std::sync::Arc::clone(index));
        let mut mtr = self.start_mtr();
        if tuple.n_fields() == 0 {
            self.open_at_index_side(left, &mut cursor, LatchMode::SearchLeaf, Some(&mut path), &mut mtr)?;
        } else {
            self.search_to_nth_level(&mut cursor, 0, tuple, mode, LatchMode::SearchLeaf, Some(&mut path), &mut mtr)?;
        }
        mtr.commit()?;
        Ok(path)
    }

    /// Estimates the number of distinct user-defined key values.
    ///
    /// Unique indexes answer with the table row count without reading a
    /// page; others sample `distinct_sample_pages` random leaves.
    pub fn estimate_n_distinct(&self, index: &std::sync::Arc<Index>) -> Result<u64> {
        let table_rows = index.stat_n_rows();
        if index.is_unique() {
            return Ok(table_rows);
        }
        let n_key = index.n_user_defined;
        let mut sampled: u64 = 0;
        let mut differing: u64 = 0;
        for _ in 0..self.options().distinct_sample_pages {
            let mut cursor = BtrCursor::new(std::sync::Arc::clone(index));
            let mut mtr = self.start_mtr();
            self.open_at_rnd_pos(&mut cursor, LatchMode::SearchLeaf, &mut mtr)?;
            let frame = mtr.page(cursor.page_id())?;
            let recs = page::records(frame)?;
            sampled += recs.len() as u64;
            differing += recs
                .windows(2)
                .filter(|pair| rec::common_prefix_fields(&pair[0], &pair[1], n_key) < n_key)
                .count() as u64;
            mtr.commit()?;
        }
        let estimate = if differing == 0 {
            MIN_DISTINCT_ESTIMATE
        } else {
            table_rows / (sampled / differing).max(1)
        };
        debug!(
            target: "cairn::btree::stats",
            index = %index.name,
            sampled,
            differing,
            estimate,
            "distinct estimate"
        );
        Ok(estimate)
    }
}
