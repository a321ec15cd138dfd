//! Index page layout and in-page operations.
//!
//! Layout after the file header:
//!
//! ```text
//! +32  n_recs u16 | n_heap u16 | heap_top u16 | garbage u16 | level u16
//! +42  index_id u64 | last_insert u16 | direction u8 | n_direction u16
//! +64  records, growing upward
//!      ...free...
//!      slot directory (u16 record offsets in key order), growing downward
//! ```
//!
//! Infimum and supremum are virtual: position 0 and `n_recs + 1`, heap
//! numbers 0 and 1.

use std::cmp::Ordering;

use crate::primitives::bytes::be;
use crate::types::page::{self as fil, PageKind, FIL_HDR_LEN};
use crate::types::{CairnError, Result};

use super::rec::{self, Rec, Tuple};

/// Offset of the index header.
pub const PAGE_HDR: usize = FIL_HDR_LEN;
/// First byte available to records.
pub const PAGE_DATA: usize = 64;
/// Size of one slot directory entry.
pub const SLOT_SIZE: usize = 2;
/// Heap number of the infimum.
pub const HEAP_NO_INFIMUM: u16 = 0;
/// Heap number of the supremum.
pub const HEAP_NO_SUPREMUM: u16 = 1;
/// First heap number handed to a user record.
pub const HEAP_NO_USER_LOW: u16 = 2;

const N_RECS: usize = PAGE_HDR;
const N_HEAP: usize = PAGE_HDR + 2;
const HEAP_TOP: usize = PAGE_HDR + 4;
const GARBAGE: usize = PAGE_HDR + 6;
const LEVEL: usize = PAGE_HDR + 8;
const INDEX_ID: usize = PAGE_HDR + 10;
const LAST_INSERT: usize = PAGE_HDR + 18;
const DIRECTION: usize = PAGE_HDR + 20;
const N_DIRECTION: usize = PAGE_HDR + 21;

/// Direction of consecutive inserts, used to pick split points.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InsertDirection {
    /// No pattern.
    None,
    /// Each insert landed right after the previous one.
    Right,
    /// Each insert landed right before the previous one.
    Left,
}

impl InsertDirection {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => InsertDirection::Right,
            2 => InsertDirection::Left,
            _ => InsertDirection::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            InsertDirection::None => 0,
            InsertDirection::Right => 1,
            InsertDirection::Left => 2,
        }
    }
}

/// Intra-page search mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageSearchMode {
    /// Last record strictly less than the tuple.
    L,
    /// Last record less than or equal to the tuple.
    LE,
    /// First record greater than or equal to the tuple.
    GE,
    /// First record strictly greater than the tuple.
    G,
}

/// Result of a binary search inside one page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageMatch {
    /// Position the search settled on (0 = infimum, `n_recs + 1` = supremum).
    pub pos: usize,
    /// Fully matched fields against the upper bound.
    pub up_match: usize,
    /// Matched bytes of the first differing field against the upper bound.
    pub up_bytes: usize,
    /// Fully matched fields against the lower bound.
    pub low_match: usize,
    /// Matched bytes of the first differing field against the lower bound.
    pub low_bytes: usize,
}

/// Formats `page` as an empty index page at `level`.
pub fn create(page: &mut [u8], level: u16, index_id: u64) {
    fil::set_kind(page, PageKind::Index);
    page[PAGE_HDR..PAGE_DATA].fill(0);
    be::write_u16(page, N_HEAP, HEAP_NO_USER_LOW);
    be::write_u16(page, HEAP_TOP, PAGE_DATA as u16);
    be::write_u16(page, LEVEL, level);
    be::write_u64(page, INDEX_ID, index_id);
    let len = page.len();
    page[PAGE_DATA..len].fill(0);
}

/// Checks that `page` is an index page.
pub fn check_index_page(page: &[u8]) -> Result<()> {
    match fil::kind(page)? {
        PageKind::Index => Ok(()),
        _ => Err(CairnError::Corruption("expected an index page")),
    }
}

/// Number of user records.
pub fn n_recs(page: &[u8]) -> usize {
    be::read_u16(page, N_RECS) as usize
}

/// Next heap number to hand out.
pub fn n_heap(page: &[u8]) -> u16 {
    be::read_u16(page, N_HEAP)
}

/// First free byte above the records.
pub fn heap_top(page: &[u8]) -> usize {
    be::read_u16(page, HEAP_TOP) as usize
}

/// Bytes held by deleted records.
pub fn garbage(page: &[u8]) -> usize {
    be::read_u16(page, GARBAGE) as usize
}

/// Level of the page; leaves are 0.
pub fn level(page: &[u8]) -> u16 {
    be::read_u16(page, LEVEL)
}

/// Rewrites the level of a page whose records stay in place.
pub fn set_level(page: &mut [u8], level: u16) {
    be::write_u16(page, LEVEL, level);
}

/// True for level-0 pages.
pub fn is_leaf(page: &[u8]) -> bool {
    level(page) == 0
}

/// Owning index id.
pub fn index_id(page: &[u8]) -> u64 {
    be::read_u64(page, INDEX_ID)
}

/// Heap number of the last inserted record, 0 when unknown.
pub fn last_insert(page: &[u8]) -> u16 {
    be::read_u16(page, LAST_INSERT)
}

/// Direction of the recent inserts.
pub fn direction(page: &[u8]) -> InsertDirection {
    InsertDirection::from_u8(page[DIRECTION])
}

/// Number of consecutive inserts in `direction`.
pub fn n_direction(page: &[u8]) -> usize {
    be::read_u16(page, N_DIRECTION) as usize
}

fn set_n_recs(page: &mut [u8], n: usize) {
    be::write_u16(page, N_RECS, n as u16);
}

fn set_last_insert(page: &mut [u8], heap_no: u16, dir: InsertDirection, n_dir: usize) {
    be::write_u16(page, LAST_INSERT, heap_no);
    page[DIRECTION] = dir.as_u8();
    be::write_u16(page, N_DIRECTION, n_dir.min(u16::MAX as usize) as u16);
}

fn slot_addr(page: &[u8], k: usize) -> usize {
    page.len() - SLOT_SIZE * (k + 1)
}

fn slot_dir_start(page: &[u8]) -> usize {
    page.len() - SLOT_SIZE * n_recs(page)
}

/// Offset of the user record at `pos` (1-based).
pub fn rec_offset(page: &[u8], pos: usize) -> Result<usize> {
    let n = n_recs(page);
    if pos == 0 || pos > n {
        return Err(CairnError::Corruption("record position out of range"));
    }
    let off = be::read_u16(page, slot_addr(page, pos - 1)) as usize;
    if off < PAGE_DATA || off >= heap_top(page) {
        return Err(CairnError::Corruption("slot points outside the record heap"));
    }
    Ok(off)
}

/// User record at `pos`.
pub fn rec_at(page: &[u8], pos: usize) -> Result<Rec<'_>> {
    Rec::at(page, rec_offset(page, pos)?)
}

/// Heap number of whatever sits at `pos`, including infimum and supremum.
pub fn heap_no_at(page: &[u8], pos: usize) -> Result<u16> {
    let n = n_recs(page);
    if pos == 0 {
        Ok(HEAP_NO_INFIMUM)
    } else if pos == n + 1 {
        Ok(HEAP_NO_SUPREMUM)
    } else {
        Ok(rec_at(page, pos)?.heap_no())
    }
}

/// Position of the record with `heap_no`, if present.
pub fn pos_of_heap_no(page: &[u8], heap_no: u16) -> Result<Option<usize>> {
    match heap_no {
        HEAP_NO_INFIMUM => Ok(Some(0)),
        HEAP_NO_SUPREMUM => Ok(Some(n_recs(page) + 1)),
        _ => {
            for pos in 1..=n_recs(page) {
                if rec_at(page, pos)?.heap_no() == heap_no {
                    return Ok(Some(pos));
                }
            }
            Ok(None)
        }
    }
}

/// All user records in key order.
pub fn records(page: &[u8]) -> Result<Vec<Rec<'_>>> {
    (1..=n_recs(page)).map(|pos| rec_at(page, pos)).collect()
}

/// Contiguous free bytes between the record heap and the slot directory.
pub fn free_space(page: &[u8]) -> usize {
    slot_dir_start(page).saturating_sub(heap_top(page))
}

/// Bytes occupied by live records.
pub fn data_size(page: &[u8]) -> usize {
    heap_top(page)
        .saturating_sub(PAGE_DATA)
        .saturating_sub(garbage(page))
}

/// Largest record that can be inserted without reorganizing.
pub fn max_insert_size(page: &[u8]) -> usize {
    free_space(page).saturating_sub(SLOT_SIZE)
}

/// Largest record that fits once the page has been reorganized.
pub fn max_insert_size_after_reorganize(page: &[u8]) -> usize {
    let capacity = page.len() - PAGE_DATA;
    let used = data_size(page) + SLOT_SIZE * (n_recs(page) + 1);
    capacity.saturating_sub(used)
}

/// Largest record stored inline; bigger ones move fields off-page.
pub fn max_rec_size(page_size: usize) -> usize {
    (page_size - PAGE_DATA) / 2 - SLOT_SIZE
}

fn next_heap_no(page: &[u8]) -> Result<Option<u16>> {
    let n_heap = n_heap(page);
    if n_heap < u16::MAX {
        return Ok(Some(n_heap));
    }
    let mut used: Vec<u16> = records(page)?.iter().map(Rec::heap_no).collect();
    used.sort_unstable();
    let mut candidate = HEAP_NO_USER_LOW;
    for h in used {
        if h == candidate {
            candidate += 1;
        } else if h > candidate {
            break;
        }
    }
    Ok((candidate < u16::MAX).then_some(candidate))
}

/// Inserts `tuple` right after position `pos`.
///
/// Returns the new record's position and offset, or `None` when the record
/// does not fit in the contiguous free space.
pub fn insert_after(page: &mut [u8], pos: usize, tuple: &Tuple) -> Result<Option<(usize, usize)>> {
    let n = n_recs(page);
    if pos > n {
        return Err(CairnError::Corruption("insert position after supremum"));
    }
    let size = rec::converted_size(tuple);
    if size + SLOT_SIZE > free_space(page) {
        return Ok(None);
    }
    let Some(heap_no) = next_heap_no(page)? else {
        return Ok(None);
    };
    let bytes = rec::encode(tuple, heap_no)?;
    let off = heap_top(page);
    page[off..off + bytes.len()].copy_from_slice(&bytes);
    be::write_u16(page, HEAP_TOP, (off + bytes.len()) as u16);
    if heap_no >= n_heap(page) {
        be::write_u16(page, N_HEAP, heap_no + 1);
    }

    // Shift slots pos..n one entry toward the heap and write the new slot.
    let dir_start = slot_dir_start(page);
    let shift_end = page.len() - SLOT_SIZE * pos;
    page.copy_within(dir_start..shift_end, dir_start - SLOT_SIZE);
    let slot = slot_addr(page, pos);
    be::write_u16(page, slot, off as u16);
    set_n_recs(page, n + 1);

    let new_pos = pos + 1;
    let last = last_insert(page);
    let prev_heap = heap_no_at(page, pos)?;
    let next_heap = heap_no_at(page, new_pos + 1)?;
    let n_dir = n_direction(page);
    if last != 0 && last == prev_heap {
        let n_dir = if direction(page) == InsertDirection::Right { n_dir + 1 } else { 1 };
        set_last_insert(page, heap_no, InsertDirection::Right, n_dir);
    } else if last != 0 && last == next_heap {
        let n_dir = if direction(page) == InsertDirection::Left { n_dir + 1 } else { 1 };
        set_last_insert(page, heap_no, InsertDirection::Left, n_dir);
    } else {
        set_last_insert(page, heap_no, InsertDirection::None, 0);
    }
    Ok(Some((new_pos, off)))
}

/// Removes the user record at `pos`.
pub fn delete(page: &mut [u8], pos: usize) -> Result<()> {
    let n = n_recs(page);
    let size = rec_at(page, pos)?.size();
    let dir_start = slot_dir_start(page);
    let hole = slot_addr(page, pos - 1);
    page.copy_within(dir_start..hole, dir_start + SLOT_SIZE);
    be::write_u16(page, dir_start, 0);
    set_n_recs(page, n - 1);
    let garbage = garbage(page) + size;
    be::write_u16(page, GARBAGE, garbage as u16);
    set_last_insert(page, 0, InsertDirection::None, 0);
    Ok(())
}

/// Rewrites the records contiguously, keeping their order and heap numbers.
pub fn reorganize(page: &mut [u8]) -> Result<()> {
    let recs: Vec<Vec<u8>> = records(page)?.iter().map(|r| r.bytes().to_vec()).collect();
    rebuild(page, &recs)
}

/// Replaces all user records with `recs`, already in key order.
pub fn rebuild(page: &mut [u8], recs: &[Vec<u8>]) -> Result<()> {
    let total: usize = recs.iter().map(Vec::len).sum::<usize>() + SLOT_SIZE * recs.len();
    if PAGE_DATA + total > page.len() {
        return Err(CairnError::Corruption("records do not fit in a rebuilt page"));
    }
    let len = page.len();
    page[PAGE_DATA..len].fill(0);
    let mut off = PAGE_DATA;
    let mut max_heap = HEAP_NO_USER_LOW - 1;
    for (k, bytes) in recs.iter().enumerate() {
        page[off..off + bytes.len()].copy_from_slice(bytes);
        max_heap = max_heap.max(Rec::at(page, off)?.heap_no());
        let slot = slot_addr(page, k);
        be::write_u16(page, slot, off as u16);
        off += bytes.len();
    }
    be::write_u16(page, HEAP_TOP, off as u16);
    be::write_u16(page, GARBAGE, 0);
    be::write_u16(page, N_HEAP, max_heap.saturating_add(1).max(HEAP_NO_USER_LOW));
    set_n_recs(page, recs.len());
    set_last_insert(page, 0, InsertDirection::None, 0);
    Ok(())
}

/// Binary search for `tuple`, comparing at most `n_uniq` fields.
pub fn search_with_match(page: &[u8], tuple: &Tuple, n_uniq: usize, mode: PageSearchMode) -> Result<PageMatch> {
    let n = n_recs(page);
    let mut low = 0usize;
    let mut up = n + 1;
    let mut m = PageMatch::default();
    while up - low > 1 {
        let mid = (low + up) / 2;
        let rec = rec_at(page, mid)?;
        let n_cmp = tuple.n_fields_cmp.min(n_uniq).min(rec.n_fields());
        let mut cur_match = m.low_match.min(m.up_match);
        let mut cur_bytes = m.low_bytes.min(m.up_bytes);
        let ord = rec::cmp_tuple_rec_with_match(tuple, &rec, n_cmp, &mut cur_match, &mut cur_bytes);
        let move_low = match ord {
            Ordering::Greater => true,
            Ordering::Equal => matches!(mode, PageSearchMode::G | PageSearchMode::LE),
            Ordering::Less => false,
        };
        if move_low {
            low = mid;
            m.low_match = cur_match;
            m.low_bytes = cur_bytes;
        } else {
            up = mid;
            m.up_match = cur_match;
            m.up_bytes = cur_bytes;
        }
    }
    m.pos = match mode {
        PageSearchMode::G | PageSearchMode::GE => up,
        PageSearchMode::L | PageSearchMode::LE => low,
    };
    Ok(m)
}
