#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use cairn::primitives::pager::{MemPager, PageStore};
use cairn::storage::btree::{EngineServices, Field, Index, IndexDef, IndexEngine, KeyHashIndex, Tuple};
use cairn::storage::{EngineOptions, TxnCtx};
use cairn::types::{CairnError, IndexId, Result, SpaceId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const SPACE: SpaceId = SpaceId(3);
const THREADS: u32 = 4;
const PER_THREAD: u32 = 600;

fn setup() -> Result<(Arc<MemPager>, IndexEngine, Arc<Index>)> {
    let pager = Arc::new(MemPager::new(4096)?);
    pager.add_space(SPACE, 32_768, 16)?;
    let options = EngineOptions::default().page_size(4096).extent_pages(16);
    let services = EngineServices::default().with_hash_index(Arc::new(KeyHashIndex::new()));
    let store: Arc<dyn PageStore> = pager.clone();
    let engine = IndexEngine::new(store, services, options)?;
    let index = engine.create_index(IndexId(1), IndexDef::clustered("shared", SPACE, 1, 1))?;
    Ok((pager, engine, index))
}

fn key(k: u32) -> Tuple {
    Tuple::key([k.to_be_bytes()])
}

fn row(k: u32, len: usize) -> Tuple {
    Tuple::new(vec![
        Field::new(k.to_be_bytes()),
        Field::new(vec![0; 6]),
        Field::new(vec![0; 7]),
        Field::new(vec![(k % 251) as u8; len]),
    ])
}

fn key_of(t: &Tuple) -> u32 {
    let mut b = [0u8; 4];
    if let Some(data) = t.fields[0].data.as_deref() {
        b.copy_from_slice(&data[..4]);
    }
    u32::from_be_bytes(b)
}

/// Interleaved keys so every thread touches every leaf.
fn thread_keys(t: u32) -> impl Iterator<Item = u32> {
    (0..PER_THREAD).map(move |i| i * THREADS + t)
}

#[test]
fn writers_and_a_scanner_share_the_tree() -> Result<()> {
    let (_pager, engine, index) = setup()?;
    let done = AtomicBool::new(false);

    thread::scope(|s| -> Result<()> {
        let scanner = s.spawn(|| -> Result<usize> {
            let mut scans = 0;
            while !done.load(Ordering::Acquire) {
                let keys: Vec<u32> = engine.collect_entries(&index)?.iter().map(key_of).collect();
                assert!(keys.windows(2).all(|w| w[0] < w[1]), "scan out of order");
                scans += 1;
            }
            Ok(scans)
        });
        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = &engine;
                let index = &index;
                s.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(u64::from(t));
                    let ctx = TxnCtx::new(u64::from(t) + 1);
                    for k in thread_keys(t) {
                        engine
                            .insert_entry(index, row(k, rng.gen_range(20..300)), ctx)
                            .map_err(CairnError::from)?;
                    }
                    Ok(())
                })
            })
            .collect();
        for w in writers {
            w.join().map_err(|_| CairnError::Invalid("writer panicked"))??;
        }
        done.store(true, Ordering::Release);
        let scans = scanner.join().map_err(|_| CairnError::Invalid("scanner panicked"))??;
        assert!(scans > 0);
        Ok(())
    })?;

    let total = THREADS * PER_THREAD;
    let keys: Vec<u32> = engine.collect_entries(&index)?.iter().map(key_of).collect();
    assert_eq!(keys, (0..total).collect::<Vec<_>>());
    assert_eq!(index.stat_n_rows(), u64::from(total));
    Ok(())
}

#[test]
fn concurrent_purges_and_lookups_keep_the_tree_consistent() -> Result<()> {
    let (pager, engine, index) = setup()?;
    let total = THREADS * PER_THREAD;
    for k in 0..total {
        engine
            .insert_entry(&index, row(k, 120), TxnCtx::new(1))
            .map_err(CairnError::from)?;
    }

    thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = &engine;
                let index = &index;
                s.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(100 + u64::from(t));
                    for k in thread_keys(t) {
                        if k % 3 != 0 {
                            assert!(engine.purge_entry(index, &key(k)).map_err(CairnError::from)?);
                        }
                        let pick = rng.gen_range(0..total);
                        if pick % 3 == 0 {
                            assert!(engine.lookup(index, &key(pick))?.is_some(), "key {pick} vanished");
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for h in handles {
            h.join().map_err(|_| CairnError::Invalid("worker panicked"))??;
        }
        Ok(())
    })?;

    let keys: Vec<u32> = engine.collect_entries(&index)?.iter().map(key_of).collect();
    assert_eq!(keys, (0..total).filter(|k| k % 3 == 0).collect::<Vec<_>>());
    assert_eq!(index.stat_n_rows(), u64::from(total / 3));
    assert_eq!(pager.space(SPACE)?.reserved_pages(), 0);
    Ok(())
}

/// Eight-byte `(key, version)` header followed by a pattern both select.
fn versioned(k: u32, ver: u32, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len.max(8));
    out.extend_from_slice(&k.to_be_bytes());
    out.extend_from_slice(&ver.to_be_bytes());
    out.extend((8..len).map(|i| pattern_byte(k, ver, i)));
    out
}

fn pattern_byte(k: u32, ver: u32, i: usize) -> u8 {
    ((k as usize * 7 + ver as usize * 13 + i) % 251) as u8
}

fn versioned_row(k: u32, ver: u32, len: usize) -> Tuple {
    Tuple::new(vec![
        Field::new(k.to_be_bytes()),
        Field::new(vec![0; 6]),
        Field::new(vec![0; 7]),
        Field::new(versioned(k, ver, len)),
    ])
}

#[test]
fn readers_see_whole_external_values_while_writers_replace_them() -> Result<()> {
    const KEYS: u32 = 64;
    const ROUNDS: u32 = 12;
    let (pager, engine, index) = setup()?;
    for k in 0..KEYS {
        engine
            .insert_entry(&index, versioned_row(k, 0, 5000), TxnCtx::new(1))
            .map_err(CairnError::from)?;
    }
    let done = AtomicBool::new(false);

    thread::scope(|s| -> Result<()> {
        let readers: Vec<_> = (0..2u64)
            .map(|r| {
                let engine = &engine;
                let index = &index;
                let done = &done;
                s.spawn(move || -> Result<usize> {
                    let mut rng = ChaCha8Rng::seed_from_u64(500 + r);
                    let mut reads = 0;
                    loop {
                        let k = rng.gen_range(0..KEYS);
                        let t = engine
                            .lookup(index, &key(k))?
                            .ok_or(CairnError::Invalid("row vanished"))?;
                        let val = t.fields[3].data.clone().unwrap_or_default();
                        assert!(val.len() >= 8, "key {k}: short value");
                        assert_eq!(val[..4], k.to_be_bytes());
                        let ver = u32::from_be_bytes([val[4], val[5], val[6], val[7]]);
                        assert!(
                            val.iter().enumerate().skip(8).all(|(i, b)| *b == pattern_byte(k, ver, i)),
                            "key {k} version {ver}: torn value"
                        );
                        reads += 1;
                        if done.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Ok(reads)
                })
            })
            .collect();
        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = &engine;
                let index = &index;
                s.spawn(move || -> Result<()> {
                    let mut rng = ChaCha8Rng::seed_from_u64(200 + u64::from(t));
                    let ctx = TxnCtx::new(u64::from(t) + 1);
                    for ver in 1..=ROUNDS {
                        for k in (t..KEYS).step_by(THREADS as usize) {
                            let len = rng.gen_range(8..6000);
                            let found = engine
                                .update_entry(index, &key(k), versioned_row(k, ver, len), ctx)
                                .map_err(CairnError::from)?;
                            assert!(found);
                        }
                    }
                    Ok(())
                })
            })
            .collect();
        for w in writers {
            w.join().map_err(|_| CairnError::Invalid("writer panicked"))??;
        }
        done.store(true, Ordering::Release);
        for r in readers {
            let reads = r.join().map_err(|_| CairnError::Invalid("reader panicked"))??;
            assert!(reads > 0);
        }
        Ok(())
    })?;

    for k in 0..KEYS {
        let t = engine.lookup(&index, &key(k))?.ok_or(CairnError::Invalid("row vanished"))?;
        let val = t.fields[3].data.clone().unwrap_or_default();
        assert_eq!(val[4..8], ROUNDS.to_be_bytes());
    }
    assert_eq!(pager.space(SPACE)?.reserved_pages(), 0);
    Ok(())
}
