#![allow(missing_docs)]

use std::sync::{Arc, Once};

use cairn::primitives::pager::{MemPager, PageStore};
use cairn::storage::btree::rec::REC_INFO_DELETED;
use cairn::storage::btree::{
    CursorStats, EngineServices, Field, Index, IndexDef, IndexEngine, InsertError, KeyHashIndex, MemInsertBuffer,
    SearchMode, Tuple,
};
use cairn::storage::{EngineOptions, TxnCtx};
use cairn::types::{CairnError, IndexId, PageId, Result, SpaceId};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing_subscriber::EnvFilter;

const SPACE: SpaceId = SpaceId(7);

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

fn setup(options: EngineOptions, services: EngineServices) -> Result<(Arc<MemPager>, IndexEngine)> {
    init_tracing();
    let pager = Arc::new(MemPager::new(options.page_size)?);
    pager.add_space(SPACE, 16_384, options.extent_pages)?;
    let store: Arc<dyn PageStore> = pager.clone();
    let engine = IndexEngine::new(store, services, options)?;
    Ok((pager, engine))
}

fn key(k: u32) -> Tuple {
    Tuple::key([k.to_be_bytes()])
}

fn row(k: u32, val: &[u8]) -> Tuple {
    Tuple::new(vec![
        Field::new(k.to_be_bytes()),
        Field::new(vec![0; 6]),
        Field::new(vec![0; 7]),
        Field::new(val.to_vec()),
    ])
}

fn sec(col: u32, pk: u32) -> Tuple {
    Tuple::new(vec![Field::new(col.to_be_bytes()), Field::new(pk.to_be_bytes())])
}

fn key_of(t: &Tuple) -> u32 {
    let mut b = [0u8; 4];
    if let Some(data) = t.fields[0].data.as_deref() {
        b.copy_from_slice(&data[..4]);
    }
    u32::from_be_bytes(b)
}

fn payload(k: u32) -> Vec<u8> {
    format!("row-{k:06}-").repeat(6).into_bytes()
}

fn insert(engine: &IndexEngine, index: &Arc<Index>, k: u32, val: &[u8]) -> Result<()> {
    engine
        .insert_entry(index, row(k, val), TxnCtx::new(1))
        .map_err(CairnError::from)
}

#[test]
fn shuffled_inserts_scan_in_key_order() -> Result<()> {
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let (_pager, engine) = setup(options, EngineServices::default())?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("orders", SPACE, 1, 1))?;

    let mut keys: Vec<u32> = (0..3000).collect();
    keys.shuffle(&mut ChaCha8Rng::seed_from_u64(11));
    for &k in &keys {
        insert(&engine, &index, k, &payload(k))?;
    }
    assert_eq!(index.stat_n_rows(), 3000);

    let rows = engine.collect_entries(&index)?;
    let scanned: Vec<u32> = rows.iter().map(key_of).collect();
    assert_eq!(scanned, (0..3000).collect::<Vec<_>>());
    for k in [0, 1, 1499, 2999] {
        let found = engine.lookup(&index, &key(k))?.ok_or(CairnError::NotFound)?;
        assert_eq!(found.fields[3].data.as_deref(), Some(payload(k).as_slice()));
    }
    assert!(engine.lookup(&index, &key(3000))?.is_none());
    Ok(())
}

#[test]
fn updates_grow_and_shrink_rows_in_place_or_by_split() -> Result<()> {
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let (_pager, engine) = setup(options, EngineServices::default())?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("accounts", SPACE, 1, 1))?;
    for k in 0..400 {
        insert(&engine, &index, k, b"short")?;
    }
    for k in (0..400).step_by(3) {
        let grown = vec![b'g'; 900];
        assert!(engine
            .update_entry(&index, &key(k), row(k, &grown), TxnCtx::new(2))
            .map_err(CairnError::from)?);
    }
    for k in (0..400).step_by(6) {
        assert!(engine
            .update_entry(&index, &key(k), row(k, b"tiny"), TxnCtx::new(2))
            .map_err(CairnError::from)?);
    }
    assert!(!engine
        .update_entry(&index, &key(10_000), row(10_000, b"x"), TxnCtx::new(2))
        .map_err(CairnError::from)?);

    let rows = engine.collect_entries(&index)?;
    assert_eq!(rows.len(), 400);
    for t in &rows {
        let k = key_of(t);
        let expected: &[u8] = if k % 6 == 0 {
            b"tiny"
        } else if k % 3 == 0 {
            &[b'g'; 900]
        } else {
            b"short"
        };
        assert_eq!(t.fields[3].data.as_deref(), Some(expected), "row {k}");
    }

    let moved = engine.update_entry(&index, &key(5), row(6, b"other"), TxnCtx::new(2));
    assert!(moved.is_err());
    Ok(())
}

#[test]
fn delete_mark_then_purge_shrinks_the_tree() -> Result<()> {
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let (pager, engine) = setup(options, EngineServices::default())?;
    let index = engine.create_index(IndexId(3), IndexDef::clustered("events", SPACE, 1, 1))?;
    for k in 0..1500 {
        insert(&engine, &index, k, &payload(k))?;
    }
    let grown_pages = pager.space(SPACE)?.used_pages();

    for k in 0..1500 {
        assert!(engine
            .delete_mark_entry(&index, &key(k), TxnCtx::new(4))
            .map_err(CairnError::from)?);
    }
    let marked = engine.lookup(&index, &key(700))?.ok_or(CairnError::NotFound)?;
    assert_ne!(marked.info_bits & REC_INFO_DELETED, 0);

    for k in (0..1500).filter(|k| k % 10 != 0) {
        assert!(engine.purge_entry(&index, &key(k)).map_err(CairnError::from)?);
    }
    let left: Vec<u32> = engine.collect_entries(&index)?.iter().map(key_of).collect();
    assert_eq!(left, (0..1500).step_by(10).collect::<Vec<_>>());
    assert_eq!(index.stat_n_rows(), 150);
    assert!(pager.space(SPACE)?.used_pages() < grown_pages);
    Ok(())
}

#[test]
fn duplicate_keys_are_rejected() -> Result<()> {
    let options = EngineOptions::default().page_size(8192);
    let (_pager, engine) = setup(options, EngineServices::default())?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("users", SPACE, 1, 1))?;
    insert(&engine, &index, 42, b"alice")?;
    let dup = engine.insert_entry(&index, row(42, b"bob"), TxnCtx::new(1));
    assert!(matches!(dup, Err(InsertError::Storage(CairnError::Invalid(_)))));
    assert_eq!(index.stat_n_rows(), 1);
    Ok(())
}

#[test]
fn hash_index_shortcuts_repeated_lookups() -> Result<()> {
    let stats = Arc::new(CursorStats::new());
    let services = EngineServices::default()
        .with_hash_index(Arc::new(KeyHashIndex::new()))
        .with_stats(stats.clone());
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let (_pager, engine) = setup(options, services)?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("hot", SPACE, 1, 1))?;
    for k in 0..500 {
        insert(&engine, &index, k, &payload(k))?;
    }
    for _ in 0..2 {
        for k in (0..500).step_by(7) {
            assert!(engine.lookup(&index, &key(k))?.is_some());
        }
    }
    let snap = stats.snapshot();
    assert!(snap.hash_hits > 0);
    assert!(snap.leaf_splits > 0);
    assert!(snap.optimistic_inserts > 0);
    stats.emit_tracing();
    Ok(())
}

struct Buffered {
    ibuf: Arc<MemInsertBuffer>,
    engine: IndexEngine,
    index: Arc<Index>,
    loaded: Vec<u32>,
    fresh: Vec<u32>,
}

/// Grows a secondary index, evicts its leaves and inserts a few fresh
/// entries, which land in the insert buffer.
fn buffered_secondary() -> Result<Buffered> {
    let ibuf = Arc::new(MemInsertBuffer::new());
    let stats = Arc::new(CursorStats::new());
    let services = EngineServices::default()
        .with_insert_buffer(ibuf.clone())
        .with_stats(stats.clone());
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let (pager, engine) = setup(options, services)?;
    let index = engine.create_index(IndexId(9), IndexDef::secondary("by_col", SPACE, 1, 1))?;

    let mut loaded: Vec<u32> = (0..1200).map(|c| c * 2).collect();
    loaded.shuffle(&mut ChaCha8Rng::seed_from_u64(3));
    for &c in &loaded {
        engine
            .insert_entry(&index, sec(c, c + 100_000), TxnCtx::new(1))
            .map_err(CairnError::from)?;
    }

    let used = pager.space(SPACE)?.used_pages();
    for page_no in 0..used {
        if page_no != index.root_page_no {
            pager.evict(PageId::new(SPACE, page_no));
        }
    }
    let fresh: Vec<u32> = (0..1200).step_by(37).map(|c| c * 2 + 1).collect();
    for &c in &fresh {
        engine
            .insert_entry(&index, sec(c, c + 100_000), TxnCtx::new(1))
            .map_err(CairnError::from)?;
    }
    assert!(stats.snapshot().inserts_buffered > 0);
    assert!(!ibuf.is_empty());
    Ok(Buffered { ibuf, engine, index, loaded, fresh })
}

#[test]
fn buffered_secondary_inserts_are_merged_on_lookup() -> Result<()> {
    let b = buffered_secondary()?;
    for &c in &b.fresh {
        let found = b.engine.lookup(&b.index, &sec(c, c + 100_000))?;
        assert_eq!(found, Some(sec(c, c + 100_000)));
    }
    assert!(b.ibuf.is_empty());
    assert_eq!(b.engine.collect_entries(&b.index)?.len(), b.loaded.len() + b.fresh.len());
    Ok(())
}

#[test]
fn purge_finds_buffered_secondary_entries() -> Result<()> {
    let b = buffered_secondary()?;
    for &c in &b.fresh {
        let removed = b
            .engine
            .purge_entry(&b.index, &sec(c, c + 100_000))
            .map_err(CairnError::from)?;
        assert!(removed, "col {c}");
        assert_eq!(b.engine.lookup(&b.index, &sec(c, c + 100_000))?, None);
    }
    assert!(b.ibuf.is_empty());
    assert_eq!(b.engine.collect_entries(&b.index)?.len(), b.loaded.len());
    Ok(())
}

#[test]
fn delete_mark_finds_buffered_secondary_entries() -> Result<()> {
    let b = buffered_secondary()?;
    for &c in &b.fresh {
        let marked = b
            .engine
            .delete_mark_entry(&b.index, &sec(c, c + 100_000), TxnCtx::new(2))
            .map_err(CairnError::from)?;
        assert!(marked, "col {c}");
        let row = b
            .engine
            .lookup(&b.index, &sec(c, c + 100_000))?
            .ok_or(CairnError::Invalid("marked entry vanished"))?;
        assert_ne!(row.info_bits & REC_INFO_DELETED, 0);
    }
    assert!(b.ibuf.is_empty());
    Ok(())
}

#[test]
fn scan_returns_buffered_secondary_entries() -> Result<()> {
    let b = buffered_secondary()?;
    let entries = b.engine.collect_entries(&b.index)?;
    assert!(b.ibuf.is_empty());
    let mut expected: Vec<u32> = b.loaded.iter().chain(&b.fresh).copied().collect();
    expected.sort_unstable();
    let cols: Vec<u32> = entries.iter().map(key_of).collect();
    assert_eq!(cols, expected);
    Ok(())
}

#[test]
fn range_estimates_track_the_key_span() -> Result<()> {
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let (_pager, engine) = setup(options, EngineServices::default())?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("metrics", SPACE, 1, 1))?;
    for k in 0..4000 {
        insert(&engine, &index, k, &payload(k))?;
    }
    let narrow = engine.estimate_n_rows_in_range(&index, &key(100), SearchMode::GE, &key(140), SearchMode::LE)?;
    let wide = engine.estimate_n_rows_in_range(&index, &key(100), SearchMode::GE, &key(3000), SearchMode::LE)?;
    assert!(narrow >= 1);
    assert!(wide > narrow);
    assert!(wide <= index.stat_n_rows() / 2);

    let distinct = engine.estimate_n_distinct(&index)?;
    assert_eq!(distinct, 4000);
    Ok(())
}

#[test]
fn options_load_from_toml() -> Result<()> {
    let options = EngineOptions::from_toml_str(
        "page_size = 4096\nextent_pages = 16\nmerge_threshold_pct = 40\nadaptive_hash = false\n",
    )?;
    let (_pager, engine) = setup(options, EngineServices::default())?;
    assert_eq!(engine.merge_limit(), 4096 * 40 / 100);
    let index = engine.create_index(IndexId(1), IndexDef::clustered("cfg", SPACE, 1, 1))?;
    insert(&engine, &index, 1, b"one")?;
    assert!(engine.lookup(&index, &key(1))?.is_some());
    Ok(())
}
