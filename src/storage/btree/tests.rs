use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Once};

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::EnvFilter;

use super::overflow::blob_part_capacity;
use super::rec::{self, REC_INFO_DELETED};
use super::{
    page, redo, BtrCursor, EngineServices, Field, Index, IndexDef, IndexEngine, InsertError, LatchMode, OpFlags,
    SearchMode, Tuple, UpdateVector, RANGE_ESTIMATE_FALLBACK,
};
use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::primitives::pager::{FileSpace, MemPager, PageStore};
use crate::primitives::wal::RedoLog;
use crate::storage::options::EngineOptions;
use crate::storage::txn::{MemLockUndo, TxnCtx};
use crate::types::page::{self as fil, FIL_HDR_LEN};
use crate::types::{CairnError, IndexId, Result, SpaceId, TrxId, FIL_NULL};

const SPACE: SpaceId = SpaceId(1);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cairn=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Harness {
    pager: Arc<MemPager>,
    space: Arc<FileSpace>,
    engine: IndexEngine,
}

fn harness(page_size: u32) -> Result<Harness> {
    harness_with(page_size, 8192, EngineServices::default())
}

fn harness_with(page_size: u32, limit_pages: u32, services: EngineServices) -> Result<Harness> {
    init_tracing();
    let pager = Arc::new(MemPager::new(page_size)?);
    let space = pager.add_space(SPACE, limit_pages, 16)?;
    let options = EngineOptions::default().page_size(page_size).extent_pages(16);
    let store: Arc<dyn PageStore> = pager.clone();
    let engine = IndexEngine::new(store, services, options)?;
    Ok(Harness { pager, space, engine })
}

fn ctx() -> TxnCtx {
    TxnCtx::new(1)
}

fn key(k: u32) -> Tuple {
    Tuple::key([k.to_be_bytes()])
}

fn clust_row(k: u32, val: &[u8]) -> Tuple {
    Tuple::new(vec![
        Field::new(k.to_be_bytes()),
        Field::new(vec![0; 6]),
        Field::new(vec![0; 7]),
        Field::new(val.to_vec()),
    ])
}

/// Secondary entry of exactly `size` encoded bytes: a 4-byte column and a
/// padded primary key.
fn sec_entry(k: u32, size: usize) -> Tuple {
    let pk_len = size - rec::REC_HDR_LEN - 2 * rec::FIELD_HDR_LEN - 4;
    Tuple::new(vec![Field::new(k.to_be_bytes()), Field::new(vec![b'p'; pk_len])])
}

fn clustered(h: &Harness) -> Result<Arc<Index>> {
    h.engine.create_index(IndexId(1), IndexDef::clustered("t", SPACE, 1, 1))
}

fn secondary(h: &Harness) -> Result<Arc<Index>> {
    h.engine.create_index(IndexId(2), IndexDef::secondary("t_sec", SPACE, 1, 1))
}

/// Positions a fresh cursor for `tuple` on the leaf level.
fn open(h: &Harness, index: &Arc<Index>, tuple: &Tuple, mode: LatchMode, mtr: &mut Mtr) -> Result<BtrCursor> {
    let mut cursor = BtrCursor::new(Arc::clone(index));
    h.engine
        .search_to_nth_level(&mut cursor, 0, tuple, SearchMode::LE, mode, None, mtr)?;
    Ok(cursor)
}

fn insert_leaf(h: &Harness, index: &Arc<Index>, entry: Tuple) -> Result<()> {
    let mut mtr = h.engine.start_mtr();
    let mut cursor = open(h, index, &entry, LatchMode::ModifyLeaf, &mut mtr)?;
    let mut entry = entry;
    let res = h
        .engine
        .optimistic_insert(OpFlags::NONE, &mut cursor, &mut entry, ctx(), &mut mtr);
    mtr.commit()?;
    res.map(|_| ()).map_err(|_| CairnError::Invalid("setup insert failed"))
}

#[test]
fn optimistic_insert_consumes_the_record_footprint() -> Result<()> {
    let h = harness(4096)?;
    let index = secondary(&h)?;
    insert_leaf(&h, &index, sec_entry(10, 1989))?;
    insert_leaf(&h, &index, sec_entry(30, 1989))?;

    let root = index.root();
    let mut mtr = h.engine.start_mtr();
    let entry = sec_entry(20, 30);
    let mut cursor = open(&h, &index, &entry, LatchMode::ModifyLeaf, &mut mtr)?;
    let before = page::free_space(mtr.page(root)?);
    assert_eq!(before, 50);

    let mut e = entry.clone();
    let out = h
        .engine
        .optimistic_insert(OpFlags::NONE, &mut cursor, &mut e, ctx(), &mut mtr)
        .map_err(|_| CairnError::Invalid("insert declined"))?;
    assert_eq!(out.page, root);
    assert_eq!(out.pos, 2);
    assert!(out.big_rec.is_none());
    let after = page::free_space(mtr.page(root)?);
    assert_eq!(before - after, rec::converted_size(&entry) + page::SLOT_SIZE);
    assert_eq!(after, 18);
    mtr.commit()?;
    Ok(())
}

#[test]
fn full_page_insert_takes_the_pessimistic_path() -> Result<()> {
    let h = harness(4096)?;
    let index = secondary(&h)?;
    insert_leaf(&h, &index, sec_entry(10, 2008))?;
    insert_leaf(&h, &index, sec_entry(30, 2004))?;
    insert_leaf(&h, &index, sec_entry(40, 13))?;

    let entry = sec_entry(20, 40);
    let mut mtr = h.engine.start_mtr();
    let mut cursor = open(&h, &index, &entry, LatchMode::ModifyLeaf, &mut mtr)?;
    assert_eq!(page::free_space(mtr.page(index.root())?), 1);
    let mut e = entry.clone();
    let declined = h
        .engine
        .optimistic_insert(OpFlags::NONE, &mut cursor, &mut e, ctx(), &mut mtr);
    assert!(matches!(declined, Err(InsertError::RequiresSplit)));
    assert_eq!(e, entry);
    mtr.commit()?;

    let mut mtr = h.engine.start_mtr();
    let mut cursor = open(&h, &index, &entry, LatchMode::ModifyTree, &mut mtr)?;
    let out = h
        .engine
        .pessimistic_insert(OpFlags::NONE, &mut cursor, &mut e, ctx(), &mut mtr)
        .map_err(|_| CairnError::Invalid("pessimistic insert failed"))?;
    assert_ne!(out.page, index.root());
    mtr.commit()?;

    let found = h.engine.lookup(&index, &entry)?;
    assert_eq!(found.map(|t| t.fields), Some(entry.fields.clone()));
    let keys: Vec<u32> = h
        .engine
        .collect_entries(&index)?
        .iter()
        .map(|t| u32_key(t))
        .collect();
    assert_eq!(keys, vec![10, 20, 30, 40]);
    assert_eq!(h.space.reserved_pages(), 0);
    Ok(())
}

#[test]
fn entry_whose_node_pointer_cannot_fit_is_rejected_untouched() -> Result<()> {
    let h = harness(4096)?;
    let index = secondary(&h)?;
    let limit = page::max_rec_size(4096);
    // A secondary node pointer keeps every field and adds a child number.
    let fits = sec_entry(10, limit - rec::FIELD_HDR_LEN - 4);
    let too_big = sec_entry(20, limit - rec::FIELD_HDR_LEN - 3);
    assert_eq!(rec::node_ptr_size(&fits, index.n_uniq), limit);
    assert!(rec::converted_size(&too_big) < limit);

    insert_leaf(&h, &index, fits.clone())?;
    let before = h.pager.snapshot_page(index.root())?;

    let mut mtr = h.engine.start_mtr();
    let mut cursor = open(&h, &index, &too_big, LatchMode::ModifyTree, &mut mtr)?;
    let mut e = too_big.clone();
    let res = h
        .engine
        .pessimistic_insert(OpFlags::NONE, &mut cursor, &mut e, ctx(), &mut mtr);
    assert!(matches!(res, Err(InsertError::RecordTooBig)));
    mtr.commit()?;

    let res = h.engine.insert_entry(&index, too_big.clone(), ctx());
    assert!(matches!(res, Err(InsertError::RecordTooBig)));

    let after = h.pager.snapshot_page(index.root())?;
    assert_eq!(page::n_recs(&after), 1);
    assert_eq!(page::level(&after), 0);
    assert_eq!(page::free_space(&after), page::free_space(&before));
    assert!(h.engine.lookup(&index, &too_big)?.is_none());
    assert_eq!(h.space.reserved_pages(), 0);
    Ok(())
}

fn u32_key(t: &Tuple) -> u32 {
    let mut b = [0u8; 4];
    if let Some(data) = t.fields[0].data.as_deref() {
        b.copy_from_slice(&data[..4]);
    }
    u32::from_be_bytes(b)
}

#[test]
fn unique_index_distinct_estimate_reads_no_pages() -> Result<()> {
    let h = harness(8192)?;
    let index = clustered(&h)?;
    index.set_stat_n_rows(1234);
    assert!(h.pager.evict(index.root()));
    let reads = h.pager.stats().page_reads;
    assert_eq!(h.engine.estimate_n_distinct(&index)?, 1234);
    assert_eq!(h.pager.stats().page_reads, reads);
    Ok(())
}

#[test]
fn range_estimate_on_an_empty_range_is_one() -> Result<()> {
    let h = harness(4096)?;
    let index = clustered(&h)?;
    for k in (0..200u32).step_by(2) {
        h.engine
            .insert_entry(&index, clust_row(k, &[7; 100]), ctx())
            .map_err(CairnError::from)?;
    }
    let n = h
        .engine
        .estimate_n_rows_in_range(&index, &key(51), SearchMode::GE, &key(51), SearchMode::GE)?;
    assert_eq!(n, 1);

    let all = h
        .engine
        .estimate_n_rows_in_range(&index, &Tuple::default(), SearchMode::GE, &Tuple::default(), SearchMode::LE)?;
    assert!(all > 1);
    assert!(all <= index.stat_n_rows().max(RANGE_ESTIMATE_FALLBACK));
    Ok(())
}

#[test]
fn in_place_update_without_changes_keeps_the_record() -> Result<()> {
    let h = harness(8192)?;
    let index = clustered(&h)?;
    h.engine
        .insert_entry(&index, clust_row(5, b"value"), ctx())
        .map_err(CairnError::from)?;

    let mut mtr = h.engine.start_mtr();
    let cursor = open(&h, &index, &key(5), LatchMode::ModifyLeaf, &mut mtr)?;
    let before = page::rec_at(mtr.page(cursor.page_id())?, cursor.pos())?.bytes().to_vec();
    let flags = OpFlags::NO_LOCKING | OpFlags::NO_UNDO_LOG | OpFlags::KEEP_SYS;
    h.engine
        .update_in_place(flags, &cursor, &UpdateVector::new(0), ctx(), &mut mtr)
        .map_err(|_| CairnError::Invalid("update failed"))?;
    let after = page::rec_at(mtr.page(cursor.page_id())?, cursor.pos())?.bytes().to_vec();
    assert_eq!(before, after);
    mtr.commit()?;
    Ok(())
}

#[test]
fn delete_mark_redo_replays_onto_the_old_image() -> Result<()> {
    let h = harness(8192)?;
    let index = clustered(&h)?;
    for k in 0..5u32 {
        h.engine
            .insert_entry(&index, clust_row(k, b"abc"), ctx())
            .map_err(CairnError::from)?;
    }
    let root = index.root();
    let old_image = h.pager.snapshot_page(root)?;
    let lsn = h.pager.redo().current_lsn();

    let mut mtr = h.engine.start_mtr();
    let cursor = open(&h, &index, &key(3), LatchMode::ModifyLeaf, &mut mtr)?;
    h.engine
        .del_mark_set_clust_rec(OpFlags::NONE, &cursor, true, TxnCtx::new(9), &mut mtr)
        .map_err(CairnError::from)?;
    mtr.commit()?;

    let groups = RedoLog::groups(&h.pager.redo().read_from(lsn))?;
    assert_eq!(groups.len(), 1);
    let mut replayed = old_image;
    assert_eq!(redo::apply_group(&groups[0], root, &mut replayed)?, 1);
    let current = h.pager.snapshot_page(root)?;
    assert_eq!(&replayed[FIL_HDR_LEN..], &current[FIL_HDR_LEN..]);

    let marked = h.engine.lookup(&index, &key(3))?.ok_or(CairnError::NotFound)?;
    assert_ne!(marked.info_bits & REC_INFO_DELETED, 0);
    Ok(())
}

#[test]
fn delete_then_lookup_finds_nothing() -> Result<()> {
    let h = harness(8192)?;
    let index = clustered(&h)?;
    h.engine
        .insert_entry(&index, clust_row(1, b"one"), ctx())
        .map_err(CairnError::from)?;
    h.engine
        .insert_entry(&index, clust_row(2, b"two"), ctx())
        .map_err(CairnError::from)?;
    assert!(h.engine.purge_entry(&index, &key(1)).map_err(CairnError::from)?);
    assert!(h.engine.lookup(&index, &key(1))?.is_none());
    assert!(h.engine.lookup(&index, &key(2))?.is_some());
    assert!(!h.engine.purge_entry(&index, &key(1)).map_err(CairnError::from)?);
    assert_eq!(index.stat_n_rows(), 1);
    Ok(())
}

#[test]
fn duplicate_insert_is_rejected_and_delete_marked_row_revives() -> Result<()> {
    let h = harness(8192)?;
    let index = clustered(&h)?;
    h.engine
        .insert_entry(&index, clust_row(4, b"first"), ctx())
        .map_err(CairnError::from)?;
    let dup = h.engine.insert_entry(&index, clust_row(4, b"again"), ctx());
    assert!(matches!(dup, Err(InsertError::Storage(CairnError::Invalid(_)))));

    assert!(h.engine.delete_mark_entry(&index, &key(4), ctx()).map_err(CairnError::from)?);
    h.engine
        .insert_entry(&index, clust_row(4, b"revived value"), ctx())
        .map_err(CairnError::from)?;
    let row = h.engine.lookup(&index, &key(4))?.ok_or(CairnError::NotFound)?;
    assert_eq!(row.info_bits & REC_INFO_DELETED, 0);
    assert_eq!(row.fields[3].data.as_deref(), Some(&b"revived value"[..]));
    assert_eq!(index.stat_n_rows(), 1);
    Ok(())
}

#[test]
fn emptying_a_grown_tree_leaves_an_empty_root_leaf() -> Result<()> {
    let h = harness(4096)?;
    let index = clustered(&h)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let mut keys: Vec<u32> = (0..400).collect();
    for &k in &keys {
        let len = rng.gen_range(50..400);
        h.engine
            .insert_entry(&index, clust_row(k, &vec![(k % 251) as u8; len]), ctx())
            .map_err(CairnError::from)?;
    }
    let root_level = page::level(&h.pager.snapshot_page(index.root())?);
    assert!(root_level >= 1);

    // Purge in a shuffled order so merges hit both siblings.
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    for &k in &keys {
        assert!(h.engine.purge_entry(&index, &key(k)).map_err(CairnError::from)?);
    }
    assert!(h.engine.collect_entries(&index)?.is_empty());
    let root = h.pager.snapshot_page(index.root())?;
    assert!(page::is_leaf(&root));
    assert_eq!(page::n_recs(&root), 0);
    assert_eq!(index.stat_n_rows(), 0);
    assert_eq!(h.space.reserved_pages(), 0);
    Ok(())
}

/// Walks every non-leaf level and checks each node pointer against the
/// first record of its child.
fn assert_node_ptrs_match(h: &Harness, index: &Index) -> Result<()> {
    let mut level_pages = vec![index.root()];
    while !level_pages.is_empty() {
        let mut children = Vec::new();
        for id in &level_pages {
            let frame = h.pager.snapshot_page(*id)?;
            if page::is_leaf(&frame) {
                return Ok(());
            }
            for node_ptr in page::records(&frame)? {
                let child = index.page_id(rec::node_ptr_child(&node_ptr)?);
                let child_frame = h.pager.snapshot_page(child)?;
                let first = page::rec_at(&child_frame, 1)?;
                assert_eq!(node_ptr.is_min_rec(), fil::prev(&child_frame) == FIL_NULL);
                if !node_ptr.is_min_rec() {
                    assert_eq!(
                        rec::common_prefix_fields(&node_ptr, &first, index.n_uniq),
                        index.n_uniq,
                        "node pointer to page {} is stale",
                        child.page_no
                    );
                }
                children.push(child);
            }
        }
        level_pages = children;
    }
    Ok(())
}

#[test]
fn deleting_first_node_pointers_keeps_parents_in_step() -> Result<()> {
    let h = harness(4096)?;
    let index = secondary(&h)?;
    let mut rng = ChaCha8Rng::seed_from_u64(0xfa7e);
    let mut keys: Vec<u32> = (0..360).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    for &k in &keys {
        h.engine
            .insert_entry(&index, sec_entry(k, 600), ctx())
            .map_err(CairnError::from)?;
    }
    assert!(page::level(&h.pager.snapshot_page(index.root())?) >= 2);
    assert_node_ptrs_match(&h, &index)?;

    // Ascending purges empty the leftmost pages; the shuffled tail removes
    // first records of pages that have a left neighbour.
    let (front, rest) = keys.split_at_mut(120);
    front.sort_unstable();
    for &k in front.iter().chain(rest.iter()) {
        assert!(h.engine.purge_entry(&index, &sec_entry(k, 600)).map_err(CairnError::from)?);
        assert_node_ptrs_match(&h, &index)?;
    }
    assert!(h.engine.collect_entries(&index)?.is_empty());
    assert_eq!(h.space.reserved_pages(), 0);
    Ok(())
}

#[test]
fn search_modes_position_and_match_on_a_multi_level_tree() -> Result<()> {
    let h = harness(4096)?;
    let index = clustered(&h)?;
    for k in (0..800u32).step_by(2) {
        h.engine
            .insert_entry(&index, clust_row(k, &[3; 100]), ctx())
            .map_err(CairnError::from)?;
    }
    assert!(page::level(&h.pager.snapshot_page(index.root())?) >= 1);

    // A key whose neighbours sit on the same leaf and share its leading bytes.
    let mut chosen = None;
    for k in (100..700u32).step_by(2).filter(|k| k & 0xff < 0xf0) {
        let mut mtr = h.engine.start_mtr();
        let cursor = open(&h, &index, &key(k), LatchMode::SearchLeaf, &mut mtr)?;
        let n = page::n_recs(mtr.page(cursor.page_id())?);
        mtr.commit()?;
        if cursor.pos() >= 2 && cursor.pos() < n {
            chosen = Some(k);
            break;
        }
    }
    let k = chosen.ok_or(CairnError::NotFound)?;

    let land = |tuple: &Tuple, mode: SearchMode| -> Result<(u32, BtrCursor)> {
        let mut mtr = h.engine.start_mtr();
        let mut cursor = BtrCursor::new(Arc::clone(&index));
        h.engine
            .search_to_nth_level(&mut cursor, 0, tuple, mode, LatchMode::SearchLeaf, None, &mut mtr)?;
        let at = u32_key(&page::rec_at(mtr.page(cursor.page_id())?, cursor.pos())?.to_tuple());
        mtr.commit()?;
        assert!(cursor.tree_height >= 2);
        Ok((at, cursor))
    };

    let (at, c) = land(&key(k), SearchMode::GE)?;
    assert_eq!((at, c.up_match, c.low_match), (k, 1, 0));
    let (at, c) = land(&key(k), SearchMode::G)?;
    assert_eq!((at, c.up_match, c.low_match), (k + 2, 0, 1));
    let (at, c) = land(&key(k), SearchMode::LE)?;
    assert_eq!((at, c.up_match, c.low_match), (k, 0, 1));
    let (at, c) = land(&key(k), SearchMode::L)?;
    assert_eq!((at, c.up_match, c.low_match), (k - 2, 1, 0));

    let (at, c) = land(&key(k + 1), SearchMode::GE)?;
    assert_eq!((at, c.up_match, c.up_bytes, c.low_match), (k + 2, 0, 3, 0));
    let (at, c) = land(&key(k + 1), SearchMode::LE)?;
    assert_eq!((at, c.low_match, c.low_bytes, c.up_match), (k, 0, 3, 0));
    Ok(())
}

#[test]
fn prev_latch_modes_hold_the_left_sibling() -> Result<()> {
    let h = harness(4096)?;
    let index = clustered(&h)?;
    for k in 0..300u32 {
        h.engine
            .insert_entry(&index, clust_row(k, &[1; 100]), ctx())
            .map_err(CairnError::from)?;
    }

    for (mode, latch) in [
        (LatchMode::SearchPrev, RwLatch::Shared),
        (LatchMode::ModifyPrev, RwLatch::Exclusive),
    ] {
        let mut mtr = h.engine.start_mtr();
        let cursor = open(&h, &index, &key(299), mode, &mut mtr)?;
        let page_id = cursor.page_id();
        let prev = fil::prev(mtr.page(page_id)?);
        assert_ne!(prev, FIL_NULL);
        let left = cursor.left_page.ok_or(CairnError::NotFound)?;
        assert_eq!(left, index.page_id(prev));
        assert_eq!(fil::next(mtr.page(left)?), page_id.page_no);
        assert_eq!(mtr.held_latch(left), Some(latch));
        assert_eq!(mtr.held_latch(page_id), Some(latch));
        assert!(!mtr.holds_tree_latch(index.id));
        mtr.commit()?;

        let mut mtr = h.engine.start_mtr();
        let cursor = open(&h, &index, &key(0), mode, &mut mtr)?;
        assert_eq!(cursor.left_page, None);
        assert_eq!(mtr.held_latch(cursor.page_id()), Some(latch));
        mtr.commit()?;
    }
    Ok(())
}

#[test]
fn random_positioning_lands_on_user_records_across_leaves() -> Result<()> {
    let h = harness(4096)?;
    let index = clustered(&h)?;

    let mut mtr = h.engine.start_mtr();
    let mut cursor = BtrCursor::new(Arc::clone(&index));
    h.engine.open_at_rnd_pos(&mut cursor, LatchMode::SearchLeaf, &mut mtr)?;
    assert_eq!((cursor.page_id(), cursor.pos()), (index.root(), 0));
    mtr.commit()?;

    for k in 0..600u32 {
        h.engine
            .insert_entry(&index, clust_row(k, &[2; 100]), ctx())
            .map_err(CairnError::from)?;
    }
    let mut leaves = BTreeSet::new();
    for _ in 0..64 {
        let mut mtr = h.engine.start_mtr();
        let mut cursor = BtrCursor::new(Arc::clone(&index));
        h.engine.open_at_rnd_pos(&mut cursor, LatchMode::SearchLeaf, &mut mtr)?;
        let frame = mtr.page(cursor.page_id())?;
        assert!(page::is_leaf(frame));
        assert!((1..=page::n_recs(frame)).contains(&cursor.pos()));
        assert_eq!(mtr.held_latch(cursor.page_id()), Some(RwLatch::Shared));
        leaves.insert(cursor.page_id().page_no);
        mtr.commit()?;
    }
    assert!(leaves.len() > 1);
    Ok(())
}

#[test]
fn distinct_estimate_samples_a_non_unique_index() -> Result<()> {
    let h = harness(4096)?;
    let index = secondary(&h)?;
    assert!(!index.is_unique());
    // Four primary keys per column value.
    for pk in 0..800u32 {
        let mut pk_bytes = pk.to_be_bytes().to_vec();
        pk_bytes.resize(60, b'p');
        let entry = Tuple::new(vec![Field::new((pk / 4).to_be_bytes()), Field::new(pk_bytes)]);
        h.engine.insert_entry(&index, entry, ctx()).map_err(CairnError::from)?;
    }
    assert!(page::level(&h.pager.snapshot_page(index.root())?) >= 1);
    index.set_stat_n_rows(800);

    let estimate = h.engine.estimate_n_distinct(&index)?;
    assert!((100..=400).contains(&estimate), "estimate {estimate}");
    Ok(())
}

#[test]
fn in_page_reinsert_of_a_first_record_keeps_left_supremum_locks() -> Result<()> {
    let locks = Arc::new(MemLockUndo::new());
    let h = harness_with(4096, 8192, EngineServices::new(locks.clone()))?;
    let index = clustered(&h)?;

    // Sequential inserts start a fresh rightmost leaf; stop once it holds
    // three records.
    let mut target = None;
    for k in 0..500u32 {
        h.engine
            .insert_entry(&index, clust_row(k, &[5; 150]), ctx())
            .map_err(CairnError::from)?;
        if page::level(&h.pager.snapshot_page(index.root())?) == 0 {
            continue;
        }
        let mut mtr = h.engine.start_mtr();
        let mut cursor = BtrCursor::new(Arc::clone(&index));
        h.engine
            .open_at_index_side(false, &mut cursor, LatchMode::SearchLeaf, None, &mut mtr)?;
        let frame = mtr.page(cursor.page_id())?;
        if page::n_recs(frame) == 3 {
            let first = u32_key(&page::rec_at(frame, 1)?.to_tuple());
            target = Some((cursor.page_id(), fil::prev(frame), first));
        }
        mtr.commit()?;
        if target.is_some() {
            break;
        }
    }
    let (leaf, prev, first) = target.ok_or(CairnError::NotFound)?;
    assert_ne!(prev, FIL_NULL);
    let left_supremum = (index.page_id(prev), page::HEAP_NO_SUPREMUM);
    locks.lock_record(TrxId(9), left_supremum);

    // Too long for an ordinary record, so the update converts the value
    // on the pessimistic path; the converted record still fits the leaf.
    let grown = clust_row(first, &vec![6; 5000]);
    assert!(h
        .engine
        .update_entry(&index, &key(first), grown.clone(), ctx())
        .map_err(CairnError::from)?);

    let frame = h.pager.snapshot_page(leaf)?;
    let rec = page::rec_at(&frame, 1)?;
    assert_eq!(u32_key(&rec.to_tuple()), first);
    assert!(rec.has_ext());
    assert_eq!(locks.holders(left_supremum), vec![TrxId(9)]);
    let found = h.engine.lookup(&index, &key(first))?.ok_or(CairnError::NotFound)?;
    assert_eq!(found.fields[3], grown.fields[3]);
    Ok(())
}

#[test]
fn update_reserves_only_for_newly_external_fields() -> Result<()> {
    let h = harness_with(4096, 128, EngineServices::default())?;
    let index = h
        .engine
        .create_index(IndexId(3), IndexDef::clustered("t_two", SPACE, 1, 2))?;
    let local = h.engine.options().extern_local_prefix as usize;
    let big: Vec<u8> = (0..local + 40 * blob_part_capacity(4096)).map(|i| (i % 251) as u8).collect();
    let row = |small: &[u8]| {
        Tuple::new(vec![
            Field::new(1u32.to_be_bytes()),
            Field::new(vec![0; 6]),
            Field::new(vec![0; 7]),
            Field::new(big.clone()),
            Field::new(small.to_vec()),
        ])
    };
    h.engine
        .insert_entry(&index, row(b"short"), ctx())
        .map_err(CairnError::from)?;
    let used = h.space.used_pages();

    // Room for the split headroom of an update (3 extents plus the 2-page
    // margin), not for another 40-page chain.
    let free = 128 - used;
    assert!((50..98).contains(&free), "free {free}");

    let small = vec![b's'; 300];
    assert!(h
        .engine
        .update_entry(&index, &key(1), row(&small), ctx())
        .map_err(CairnError::from)?);
    let found = h.engine.lookup(&index, &key(1))?.ok_or(CairnError::NotFound)?;
    assert_eq!(found.fields[3].data.as_deref(), Some(&big[..]));
    assert_eq!(found.fields[4].data.as_deref(), Some(&small[..]));
    assert_eq!(h.space.used_pages(), used);
    assert_eq!(h.space.reserved_pages(), 0);
    Ok(())
}

/// Records `(target, message)` for every event it sees.
#[derive(Clone, Default)]
struct EventLog(Arc<parking_lot::Mutex<Vec<(String, String)>>>);

struct MessageField(String);

impl tracing::field::Visit for MessageField {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for EventLog {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = MessageField(String::new());
        event.record(&mut message);
        self.0
            .lock()
            .push((event.metadata().target().to_string(), message.0));
    }
}

#[test]
fn update_and_delete_events_carry_their_own_targets() -> Result<()> {
    let h = harness(8192)?;
    let index = clustered(&h)?;
    let log = EventLog::default();
    let subscriber = tracing_subscriber::registry().with(log.clone());
    tracing::subscriber::with_default(subscriber, || -> Result<()> {
        h.engine
            .insert_entry(&index, clust_row(1, b"one"), ctx())
            .map_err(CairnError::from)?;
        h.engine
            .update_entry(&index, &key(1), clust_row(1, b"uno"), ctx())
            .map_err(CairnError::from)?;
        h.engine
            .delete_mark_entry(&index, &key(1), ctx())
            .map_err(CairnError::from)?;
        h.engine.purge_entry(&index, &key(1)).map_err(CairnError::from)?;
        Ok(())
    })?;

    let events = log.0.lock();
    for (message, target) in [
        ("update in place", "cairn::btree::update"),
        ("clustered delete mark", "cairn::btree::delete"),
        ("optimistic delete", "cairn::btree::delete"),
    ] {
        let targets: Vec<&str> = events
            .iter()
            .filter(|(_, m)| m == message)
            .map(|(t, _)| t.as_str())
            .collect();
        assert!(!targets.is_empty(), "no {message:?} event");
        assert!(targets.iter().all(|t| *t == target), "{message:?} logged under {targets:?}");
    }
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Insert(u32, usize),
    Update(u32, usize),
    DeleteMark(u32),
    Purge(u32),
}

fn op_strategy(keys: u32, max_len: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..keys, 0..max_len).prop_map(|(k, n)| Op::Insert(k, n)),
        2 => (0..keys, 0..max_len).prop_map(|(k, n)| Op::Update(k, n)),
        1 => (0..keys).prop_map(Op::DeleteMark),
        2 => (0..keys).prop_map(Op::Purge),
    ]
}

fn value(k: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((k as usize * 31 + i * 7 + i / 251) % 251) as u8).collect()
}

/// Keys `0..keys` not divisible by three, with short values.
fn preload(h: &Harness, index: &Arc<Index>, keys: u32, model: &mut BTreeMap<u32, (Vec<u8>, bool)>) -> Result<()> {
    for k in (0..keys).filter(|k| k % 3 != 0) {
        let val = value(k, (k % 40) as usize);
        h.engine
            .insert_entry(index, clust_row(k, &val), ctx())
            .map_err(CairnError::from)?;
        model.insert(k, (val, false));
    }
    Ok(())
}

fn run_ops(ops: &[Op], preload_keys: u32) -> Result<()> {
    let h = harness(4096)?;
    let index = clustered(&h)?;
    let mut model: BTreeMap<u32, (Vec<u8>, bool)> = BTreeMap::new();
    preload(&h, &index, preload_keys, &mut model)?;

    for op in ops {
        match *op {
            Op::Insert(k, n) => {
                let res = h.engine.insert_entry(&index, clust_row(k, &value(k, n)), ctx());
                match model.get(&k) {
                    Some((_, false)) => {
                        assert!(matches!(res, Err(InsertError::Storage(CairnError::Invalid(_)))));
                    }
                    _ => {
                        res.map_err(CairnError::from)?;
                        model.insert(k, (value(k, n), false));
                    }
                }
            }
            Op::Update(k, n) => {
                let found = h
                    .engine
                    .update_entry(&index, &key(k), clust_row(k, &value(k, n)), ctx())
                    .map_err(CairnError::from)?;
                assert_eq!(found, model.contains_key(&k));
                if let Some(slot) = model.get_mut(&k) {
                    slot.0 = value(k, n);
                }
            }
            Op::DeleteMark(k) => {
                let found = h
                    .engine
                    .delete_mark_entry(&index, &key(k), ctx())
                    .map_err(CairnError::from)?;
                assert_eq!(found, model.contains_key(&k));
                if let Some(slot) = model.get_mut(&k) {
                    slot.1 = true;
                }
            }
            Op::Purge(k) => {
                let found = h.engine.purge_entry(&index, &key(k)).map_err(CairnError::from)?;
                assert_eq!(found, model.remove(&k).is_some());
            }
        }
    }

    let rows = h.engine.collect_entries(&index)?;
    let seen: Vec<(u32, bool)> = rows
        .iter()
        .map(|t| (u32_key(t), t.info_bits & REC_INFO_DELETED != 0))
        .collect();
    let expected: Vec<(u32, bool)> = model.iter().map(|(k, (_, deleted))| (*k, *deleted)).collect();
    assert_eq!(seen, expected);
    for (k, (v, _)) in &model {
        let row = h.engine.lookup(&index, &key(*k))?;
        let stored = row.map(|t| t.fields[3].data.clone().unwrap_or_default());
        assert_eq!(stored.as_ref(), Some(v), "value of key {k}");
    }
    assert_eq!(index.stat_n_rows(), model.len() as u64);
    assert_eq!(h.space.reserved_pages(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn row_ops_match_reference_map(ops in prop::collection::vec(op_strategy(48, 700), 1..120)) {
        run_ops(&ops, 0).map_err(|e| TestCaseError::fail(e.to_string()))?;
    }

    #[test]
    fn row_ops_with_external_values_match_reference_map(
        ops in prop::collection::vec(op_strategy(3000, 20_000), 1..80),
    ) {
        run_ops(&ops, 3000).map_err(|e| TestCaseError::fail(e.to_string()))?;
    }
}
