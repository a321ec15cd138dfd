#![allow(missing_docs)]

use std::sync::Arc;

use cairn::primitives::pager::{MemPager, PageStore};
use cairn::storage::btree::overflow::{blob_part_capacity, ExternRef, BTR_EXTERN_FIELD_REF_SIZE};
use cairn::storage::btree::{
    page, BtrCursor, EngineServices, Field, Index, IndexDef, IndexEngine, InsertError, LatchMode, SearchMode, Tuple,
};
use cairn::storage::{EngineOptions, TxnCtx};
use cairn::types::{CairnError, IndexId, Result, SpaceId, FIL_NULL};

const SPACE: SpaceId = SpaceId(2);
const PAGE_SIZE: u32 = 8192;
const PREFIX: usize = 100;

fn setup(limit_pages: u32) -> Result<(Arc<MemPager>, IndexEngine, Arc<Index>)> {
    let pager = Arc::new(MemPager::new(PAGE_SIZE)?);
    pager.add_space(SPACE, limit_pages, 16)?;
    let options = EngineOptions::default()
        .page_size(PAGE_SIZE)
        .extent_pages(16)
        .extern_local_prefix(PREFIX as u32);
    let store: Arc<dyn PageStore> = pager.clone();
    let engine = IndexEngine::new(store, EngineServices::default(), options)?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("docs", SPACE, 1, 1))?;
    Ok((pager, engine, index))
}

fn key(k: u32) -> Tuple {
    Tuple::key([k.to_be_bytes()])
}

fn row(k: u32, val: Vec<u8>) -> Tuple {
    Tuple::new(vec![
        Field::new(k.to_be_bytes()),
        Field::new(vec![0; 6]),
        Field::new(vec![0; 7]),
        Field::new(val),
    ])
}

fn blob(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn expected_pages(len: usize) -> u64 {
    (len - PREFIX).div_ceil(blob_part_capacity(PAGE_SIZE as usize)) as u64
}

#[test]
fn megabyte_value_round_trips_and_frees_its_chain() -> Result<()> {
    let (pager, engine, index) = setup(4096)?;
    let value = blob(1_000_000, 5);
    assert_eq!(expected_pages(value.len()), 123);

    let before = pager.stats();
    engine
        .insert_entry(&index, row(1, value.clone()), TxnCtx::new(1))
        .map_err(CairnError::from)?;
    let after_insert = pager.stats();
    assert_eq!(after_insert.allocations - before.allocations, 123);

    let found = engine.lookup(&index, &key(1))?.ok_or(CairnError::NotFound)?;
    assert_eq!(found.fields[3].data.as_deref(), Some(value.as_slice()));

    let mut mtr = engine.start_mtr();
    let mut cursor = BtrCursor::new(Arc::clone(&index));
    engine.search_to_nth_level(&mut cursor, 0, &key(1), SearchMode::LE, LatchMode::ModifyLeaf, None, &mut mtr)?;
    let page_id = cursor.page_id();
    let (offset, local_len) = {
        let rec = page::rec_at(mtr.page(page_id)?, cursor.pos())?;
        assert!(rec.is_ext(3));
        (rec.offset, rec.field_len(3))
    };
    assert_eq!(local_len, PREFIX + BTR_EXTERN_FIELD_REF_SIZE);

    let freed = engine.free_externally_stored_field(&mut mtr, page_id, offset, 3)?;
    assert_eq!(freed, 123);
    let reference = {
        let rec = page::rec_at(mtr.page(page_id)?, cursor.pos())?;
        let field = rec.field(3).ok_or(CairnError::Corruption("NULL field"))?;
        ExternRef::read(field)?
    };
    assert_eq!(reference.page_no, FIL_NULL);
    assert_eq!(reference.ext_len, 0);
    assert_eq!(engine.free_externally_stored_field(&mut mtr, page_id, offset, 3)?, 0);
    mtr.commit()?;

    assert_eq!(pager.stats().frees - after_insert.frees, 123);
    Ok(())
}

#[test]
fn replacing_an_external_value_frees_the_old_chain() -> Result<()> {
    let (pager, engine, index) = setup(4096)?;
    let big = blob(200_000, 9);
    engine
        .insert_entry(&index, row(3, big), TxnCtx::new(1))
        .map_err(CairnError::from)?;
    let frees = pager.stats().frees;

    assert!(engine
        .update_entry(&index, &key(3), row(3, b"small again".to_vec()), TxnCtx::new(2))
        .map_err(CairnError::from)?);
    assert_eq!(pager.stats().frees - frees, expected_pages(200_000));

    let found = engine.lookup(&index, &key(3))?.ok_or(CairnError::NotFound)?;
    assert_eq!(found.fields[3].data.as_deref(), Some(&b"small again"[..]));
    assert!(!found.fields[3].ext);
    Ok(())
}

#[test]
fn growing_a_row_past_the_page_moves_it_off_page() -> Result<()> {
    let (pager, engine, index) = setup(4096)?;
    for k in 0..20 {
        engine
            .insert_entry(&index, row(k, vec![b'v'; 64]), TxnCtx::new(1))
            .map_err(CairnError::from)?;
    }
    let allocations = pager.stats().allocations;
    let grown = blob(50_000, 1);
    assert!(engine
        .update_entry(&index, &key(7), row(7, grown.clone()), TxnCtx::new(2))
        .map_err(CairnError::from)?);
    assert!(pager.stats().allocations - allocations >= expected_pages(50_000));

    let found = engine.lookup(&index, &key(7))?.ok_or(CairnError::NotFound)?;
    assert_eq!(found.fields[3].data.as_deref(), Some(grown.as_slice()));
    assert_eq!(engine.collect_entries(&index)?.len(), 20);
    Ok(())
}

#[test]
fn purging_a_row_frees_its_overflow_pages() -> Result<()> {
    let (pager, engine, index) = setup(4096)?;
    engine
        .insert_entry(&index, row(1, blob(300_000, 2)), TxnCtx::new(1))
        .map_err(CairnError::from)?;
    engine
        .insert_entry(&index, row(2, b"keep".to_vec()), TxnCtx::new(1))
        .map_err(CairnError::from)?;
    let frees = pager.stats().frees;
    assert!(engine.purge_entry(&index, &key(1)).map_err(CairnError::from)?);
    assert_eq!(pager.stats().frees - frees, expected_pages(300_000));
    assert!(engine.lookup(&index, &key(2))?.is_some());
    assert_eq!(pager.space(SPACE)?.reserved_pages(), 0);
    Ok(())
}

#[test]
fn value_larger_than_the_space_is_refused_up_front() -> Result<()> {
    let (pager, engine, index) = setup(96)?;
    let allocations = pager.stats().allocations;
    let res = engine.insert_entry(&index, row(1, blob(1_000_000, 3)), TxnCtx::new(1));
    assert!(matches!(res, Err(InsertError::OutOfFileSpace)));
    assert_eq!(pager.stats().allocations, allocations);
    assert!(engine.lookup(&index, &key(1))?.is_none());
    assert_eq!(pager.space(SPACE)?.reserved_pages(), 0);
    Ok(())
}
