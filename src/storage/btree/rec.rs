//! Logical tuples and the physical record format.
//!
//! A record is `info:u8 | heap_no:u16 | n_fields:u16`, then one `u16` header
//! per field (`0x8000` extern, `0x4000` SQL NULL, low 14 bits length), then
//! the field bytes in order.

use std::cmp::Ordering;
use std::ops::Range;

use crate::primitives::bytes::be;
use crate::types::{CairnError, Result};

/// Record header length before the per-field headers.
pub const REC_HDR_LEN: usize = 5;
/// Size of one per-field header.
pub const FIELD_HDR_LEN: usize = 2;
/// Longest field that can be stored inline.
pub const MAX_FIELD_LEN: usize = 0x3FFF;

/// Info bit: record is delete-marked.
pub const REC_INFO_DELETED: u8 = 0x20;
/// Info bit: leftmost node pointer on its level; compares below every key.
pub const REC_INFO_MIN_REC: u8 = 0x10;

const FIELD_EXTERN: u16 = 0x8000;
const FIELD_NULL: u16 = 0x4000;
const FIELD_LEN_MASK: u16 = 0x3FFF;

const INFO_OFF: usize = 0;
const HEAP_NO_OFF: usize = 1;
const N_FIELDS_OFF: usize = 3;

/// One column value of a logical row.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Field {
    /// Value bytes; `None` is SQL NULL.
    pub data: Option<Vec<u8>>,
    /// The bytes end with an overflow reference.
    pub ext: bool,
}

impl Field {
    /// Inline, non-NULL value.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Some(bytes.into()),
            ext: false,
        }
    }

    /// SQL NULL.
    pub fn null() -> Self {
        Self {
            data: None,
            ext: false,
        }
    }

    /// Encoded length of the value (0 for NULL).
    pub fn len(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// True for NULL or zero-length values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Logical row: a search key, an entry to insert, or the image of an update.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Tuple {
    /// Info bits copied into the record.
    pub info_bits: u8,
    /// Fields in index order.
    pub fields: Vec<Field>,
    /// Number of leading fields used by comparisons.
    pub n_fields_cmp: usize,
}

impl Tuple {
    /// Builds a tuple whose every field participates in comparisons.
    pub fn new(fields: Vec<Field>) -> Self {
        let n = fields.len();
        Self {
            info_bits: 0,
            fields,
            n_fields_cmp: n,
        }
    }

    /// Search key built from raw byte slices.
    pub fn key<I, B>(values: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        Self::new(values.into_iter().map(Field::new).collect())
    }

    /// Restricts comparisons to the first `n` fields.
    pub fn with_cmp(mut self, n: usize) -> Self {
        self.n_fields_cmp = n.min(self.fields.len());
        self
    }

    /// Number of fields.
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// True when some field is stored externally.
    pub fn has_ext(&self) -> bool {
        self.fields.iter().any(|f| f.ext)
    }
}

/// Bytes the tuple occupies once encoded as a record.
pub fn converted_size(tuple: &Tuple) -> usize {
    REC_HDR_LEN
        + tuple.fields.len() * FIELD_HDR_LEN
        + tuple.fields.iter().map(Field::len).sum::<usize>()
}

/// Encodes `tuple` as a record with the given heap number.
pub fn encode(tuple: &Tuple, heap_no: u16) -> Result<Vec<u8>> {
    let n = tuple.fields.len();
    if n > u16::MAX as usize {
        return Err(CairnError::Invalid("too many fields"));
    }
    let mut out = vec![0u8; converted_size(tuple)];
    out[INFO_OFF] = tuple.info_bits;
    be::write_u16(&mut out, HEAP_NO_OFF, heap_no);
    be::write_u16(&mut out, N_FIELDS_OFF, n as u16);
    let mut data_off = REC_HDR_LEN + n * FIELD_HDR_LEN;
    for (i, field) in tuple.fields.iter().enumerate() {
        let len = field.len();
        if len > MAX_FIELD_LEN {
            return Err(CairnError::Invalid("field too long to store inline"));
        }
        let mut hdr = len as u16;
        if field.data.is_none() {
            hdr |= FIELD_NULL;
        }
        if field.ext {
            hdr |= FIELD_EXTERN;
        }
        be::write_u16(&mut out, REC_HDR_LEN + i * FIELD_HDR_LEN, hdr);
        if let Some(data) = &field.data {
            out[data_off..data_off + len].copy_from_slice(data);
        }
        data_off += len;
    }
    Ok(out)
}

/// Borrowed view of a record inside a page.
#[derive(Clone, Copy)]
pub struct Rec<'a> {
    bytes: &'a [u8],
    /// Offset of the record inside its page.
    pub offset: usize,
}

impl<'a> Rec<'a> {
    /// Parses the record starting at `offset`, validating it lies inside `page`.
    pub fn at(page: &'a [u8], offset: usize) -> Result<Self> {
        let hdr_end = offset
            .checked_add(REC_HDR_LEN)
            .filter(|&e| e <= page.len())
            .ok_or(CairnError::Corruption("record header beyond page"))?;
        let n = be::read_u16(page, offset + N_FIELDS_OFF) as usize;
        let dir_end = hdr_end + n * FIELD_HDR_LEN;
        if dir_end > page.len() {
            return Err(CairnError::Corruption("record field headers beyond page"));
        }
        let data_len: usize = (0..n)
            .map(|i| (be::read_u16(page, hdr_end + i * FIELD_HDR_LEN) & FIELD_LEN_MASK) as usize)
            .sum();
        let end = dir_end + data_len;
        if end > page.len() {
            return Err(CairnError::Corruption("record data beyond page"));
        }
        Ok(Self {
            bytes: &page[offset..end],
            offset,
        })
    }

    /// Raw record bytes.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Encoded size.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Info bits.
    pub fn info_bits(&self) -> u8 {
        self.bytes[INFO_OFF]
    }

    /// Heap number within the page.
    pub fn heap_no(&self) -> u16 {
        be::read_u16(self.bytes, HEAP_NO_OFF)
    }

    /// Number of fields.
    pub fn n_fields(&self) -> usize {
        be::read_u16(self.bytes, N_FIELDS_OFF) as usize
    }

    /// Delete mark.
    pub fn is_deleted(&self) -> bool {
        self.info_bits() & REC_INFO_DELETED != 0
    }

    /// Minimum-record mark.
    pub fn is_min_rec(&self) -> bool {
        self.info_bits() & REC_INFO_MIN_REC != 0
    }

    fn field_hdr(&self, i: usize) -> u16 {
        be::read_u16(self.bytes, REC_HDR_LEN + i * FIELD_HDR_LEN)
    }

    /// Byte range of field `i` relative to the record start.
    pub fn field_range(&self, i: usize) -> Range<usize> {
        let n = self.n_fields();
        let mut start = REC_HDR_LEN + n * FIELD_HDR_LEN;
        for j in 0..i {
            start += (self.field_hdr(j) & FIELD_LEN_MASK) as usize;
        }
        let len = (self.field_hdr(i) & FIELD_LEN_MASK) as usize;
        start..start + len
    }

    /// Field bytes, `None` for SQL NULL.
    pub fn field(&self, i: usize) -> Option<&'a [u8]> {
        if self.is_null(i) {
            return None;
        }
        let range = self.field_range(i);
        Some(&self.bytes[range])
    }

    /// SQL NULL flag of field `i`.
    pub fn is_null(&self, i: usize) -> bool {
        self.field_hdr(i) & FIELD_NULL != 0
    }

    /// Extern flag of field `i`.
    pub fn is_ext(&self, i: usize) -> bool {
        self.field_hdr(i) & FIELD_EXTERN != 0
    }

    /// True when any field is stored externally.
    pub fn has_ext(&self) -> bool {
        (0..self.n_fields()).any(|i| self.is_ext(i))
    }

    /// Field length, 0 for NULL.
    pub fn field_len(&self, i: usize) -> usize {
        (self.field_hdr(i) & FIELD_LEN_MASK) as usize
    }

    /// Copies the record back into a logical tuple.
    pub fn to_tuple(&self) -> Tuple {
        let fields = (0..self.n_fields())
            .map(|i| Field {
                data: self.field(i).map(<[u8]>::to_vec),
                ext: self.is_ext(i),
            })
            .collect();
        let mut tuple = Tuple::new(fields);
        tuple.info_bits = self.info_bits();
        tuple
    }
}

/// Overwrites the info bits of the record at `offset`.
pub fn set_info_bits(page: &mut [u8], offset: usize, bits: u8) {
    page[offset + INFO_OFF] = bits;
}

/// Sets or clears the delete mark of the record at `offset`.
pub fn set_deleted(page: &mut [u8], offset: usize, deleted: bool) {
    let bits = page[offset + INFO_OFF];
    page[offset + INFO_OFF] = if deleted {
        bits | REC_INFO_DELETED
    } else {
        bits & !REC_INFO_DELETED
    };
}

/// Sets the minimum-record mark of the record at `offset`.
pub fn set_min_rec(page: &mut [u8], offset: usize) {
    page[offset + INFO_OFF] |= REC_INFO_MIN_REC;
}

/// Rewrites the heap number of the record at `offset`.
pub fn set_heap_no(page: &mut [u8], offset: usize, heap_no: u16) {
    be::write_u16(page, offset + HEAP_NO_OFF, heap_no);
}

/// Sets the extern flag of field `i`.
pub fn set_field_ext(page: &mut [u8], offset: usize, i: usize) {
    let at = offset + REC_HDR_LEN + i * FIELD_HDR_LEN;
    let hdr = be::read_u16(page, at);
    be::write_u16(page, at, hdr | FIELD_EXTERN);
}

/// Replaces field `i` with a value of the same encoded length.
pub fn write_field_in_place(page: &mut [u8], offset: usize, i: usize, value: Option<&[u8]>) -> Result<()> {
    let rec = Rec::at(page, offset)?;
    let range = rec.field_range(i);
    let new_len = value.map(<[u8]>::len).unwrap_or(0);
    if new_len != range.len() {
        return Err(CairnError::Invalid("in-place field write changes length"));
    }
    let at = offset + REC_HDR_LEN + i * FIELD_HDR_LEN;
    let mut hdr = be::read_u16(page, at) & !FIELD_NULL;
    if value.is_none() {
        hdr |= FIELD_NULL;
    }
    be::write_u16(page, at, hdr);
    if let Some(bytes) = value {
        page[offset + range.start..offset + range.end].copy_from_slice(bytes);
    }
    Ok(())
}

/// Compares `tuple` with `rec` on the first `n_cmp` fields.
///
/// `matched_fields`/`matched_bytes` carry a known common prefix in and the
/// full common prefix out: equal leading fields, then equal bytes of the
/// first differing field.
pub fn cmp_tuple_rec_with_match(
    tuple: &Tuple,
    rec: &Rec<'_>,
    n_cmp: usize,
    matched_fields: &mut usize,
    matched_bytes: &mut usize,
) -> Ordering {
    if tuple.info_bits & REC_INFO_MIN_REC != 0 {
        return Ordering::Less;
    }
    if rec.is_min_rec() {
        return Ordering::Greater;
    }
    let mut field = *matched_fields;
    let mut bytes = *matched_bytes;
    while field < n_cmp {
        let ord = match (tuple.fields[field].data.as_deref(), rec.field(field)) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => {
                let common = a.len().min(b.len());
                let mut i = bytes.min(common);
                while i < common && a[i] == b[i] {
                    i += 1;
                }
                bytes = i;
                if i < common {
                    a[i].cmp(&b[i])
                } else {
                    a.len().cmp(&b.len())
                }
            }
        };
        if ord != Ordering::Equal {
            *matched_fields = field;
            *matched_bytes = bytes;
            return ord;
        }
        field += 1;
        bytes = 0;
    }
    *matched_fields = n_cmp;
    *matched_bytes = 0;
    Ordering::Equal
}

/// Number of equal leading fields of two records, up to `n`.
pub fn common_prefix_fields(a: &Rec<'_>, b: &Rec<'_>, n: usize) -> usize {
    (0..n)
        .take_while(|&i| a.is_null(i) == b.is_null(i) && a.field(i) == b.field(i))
        .count()
}

/// Encoded size of the node pointer that would be built from a record
/// holding `entry`.
pub fn node_ptr_size(entry: &Tuple, n_uniq: usize) -> usize {
    let n = n_uniq.min(entry.fields.len());
    REC_HDR_LEN + (n + 1) * FIELD_HDR_LEN + entry.fields[..n].iter().map(Field::len).sum::<usize>() + 4
}

/// Node pointer for a child whose first record is `rec`.
pub fn build_node_ptr(rec: &Rec<'_>, n_uniq: usize, child: u32) -> Tuple {
    let mut fields: Vec<Field> = (0..n_uniq.min(rec.n_fields()))
        .map(|i| Field {
            data: rec.field(i).map(<[u8]>::to_vec),
            ext: false,
        })
        .collect();
    fields.push(Field::new(child.to_be_bytes().to_vec()));
    Tuple::new(fields).with_cmp(n_uniq)
}

/// Child page number stored in the last field of a node pointer.
pub fn node_ptr_child(rec: &Rec<'_>) -> Result<u32> {
    let n = rec.n_fields();
    let bytes = n
        .checked_sub(1)
        .and_then(|last| rec.field(last))
        .filter(|b| b.len() == 4)
        .ok_or(CairnError::Corruption("malformed node pointer"))?;
    Ok(be::read_u32(bytes, 0))
}

/// Rewrites the child page number of the node pointer at `offset`.
pub fn set_node_ptr_child(page: &mut [u8], offset: usize, child: u32) -> Result<()> {
    let rec = Rec::at(page, offset)?;
    let last = rec
        .n_fields()
        .checked_sub(1)
        .ok_or(CairnError::Corruption("malformed node pointer"))?;
    write_field_in_place(page, offset, last, Some(&child.to_be_bytes()))
}
