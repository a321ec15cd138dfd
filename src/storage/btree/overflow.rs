//! Externally stored fields.
//!
//! A field too large for its record keeps a local prefix followed by a
//! 20-byte reference:
//!
//! ```text
//! space u32 | first page u32 | offset u32 | external length u64
//! ```
//!
//! The remainder lives in a singly linked chain of blob pages. Each page
//! carries `part_len u32 | next u32` right after the file header, then the
//! part bytes.

use tracing::debug;

use crate::primitives::bytes::be;
use crate::primitives::concurrency::RwLatch;
use crate::primitives::mtr::Mtr;
use crate::types::page::{self as fil, PageKind, FIL_HDR_LEN};
use crate::types::{CairnError, PageId, Result, SpaceId, FIL_NULL};

use super::engine::IndexEngine;
use super::index::Index;
use super::page;
use super::rec::{self, Field, Rec, Tuple, MAX_FIELD_LEN};

/// Size of the reference stored at the end of an external field.
pub const BTR_EXTERN_FIELD_REF_SIZE: usize = 20;

const BLOB_HDR_PART_LEN: usize = FIL_HDR_LEN;
const BLOB_HDR_NEXT: usize = FIL_HDR_LEN + 4;
const BLOB_HDR_SIZE: usize = 8;

/// Bytes of field data one blob page holds.
pub fn blob_part_capacity(page_size: usize) -> usize {
    page_size - FIL_HDR_LEN - BLOB_HDR_SIZE
}

/// Decoded overflow reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ExternRef {
    /// Space of the chain.
    pub space: SpaceId,
    /// First blob page, `FIL_NULL` once freed or before storing.
    pub page_no: u32,
    /// Offset of the part header inside each blob page.
    pub offset: u32,
    /// Bytes stored off-page.
    pub ext_len: u64,
}

impl ExternRef {
    /// Reads the reference from the last 20 bytes of `field`.
    pub fn read(field: &[u8]) -> Result<Self> {
        let start = field
            .len()
            .checked_sub(BTR_EXTERN_FIELD_REF_SIZE)
            .ok_or(CairnError::Corruption("external field shorter than its reference"))?;
        let r = &field[start..];
        Ok(Self {
            space: SpaceId(be::read_u32(r, 0)),
            page_no: be::read_u32(r, 4),
            offset: be::read_u32(r, 8),
            ext_len: be::read_u64(r, 12),
        })
    }

    fn write(&self, dst: &mut [u8]) {
        be::write_u32(dst, 0, self.space.0);
        be::write_u32(dst, 4, self.page_no);
        be::write_u32(dst, 8, self.offset);
        be::write_u64(dst, 12, self.ext_len);
    }
}

/// One field moved off-page by [`IndexEngine::convert_big_rec`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BigRecField {
    /// Field number in the entry.
    pub field_no: usize,
    /// Full original value.
    pub data: Vec<u8>,
    /// Bytes kept in the record in front of the reference.
    pub local_len: usize,
}

impl BigRecField {
    /// Bytes that go to blob pages.
    pub fn extern_len(&self) -> usize {
        self.data.len() - self.local_len
    }
}

/// Fields of one entry that still have to be written to blob pages.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BigRec {
    /// Converted fields in field order.
    pub fields: Vec<BigRecField>,
}

impl BigRec {
    /// Number of converted fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when nothing was converted.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Blob pages needed to store every field.
    pub fn n_pages(&self, page_size: usize) -> usize {
        let cap = blob_part_capacity(page_size);
        self.fields.iter().map(|f| f.extern_len().div_ceil(cap)).sum()
    }
}

/// True when `entry` cannot be stored as an ordinary record.
pub fn needs_big_rec(entry: &Tuple, page_size: usize) -> bool {
    rec::converted_size(entry) > page::max_rec_size(page_size)
        || entry.fields.iter().any(|f| !f.ext && f.len() > MAX_FIELD_LEN)
}

/// Puts the values moved by a conversion back into `entry`.
pub fn restore_big_rec(entry: &mut Tuple, big: BigRec) {
    for f in big.fields {
        if let Some(field) = entry.fields.get_mut(f.field_no) {
            *field = Field::new(f.data);
        }
    }
}

impl IndexEngine {
    /// Moves the longest eligible fields of `entry` off-page until it fits
    /// in a record.
    ///
    /// Key fields and system fields never move. Returns `None`, with
    /// `entry` unchanged, when no choice of fields makes the record fit.
    pub fn convert_big_rec(&self, index: &Index, entry: &mut Tuple) -> Option<BigRec> {
        let page_size = self.page_size();
        let local_len = self.options().extern_local_prefix as usize;
        let sys = [index.trx_id_pos(), index.roll_ptr_pos()];
        let mut big = BigRec::default();
        while needs_big_rec(entry, page_size) {
            let candidate = entry
                .fields
                .iter()
                .enumerate()
                .filter(|(i, f)| {
                    *i >= index.n_uniq
                        && !sys.contains(&Some(*i))
                        && !f.ext
                        && f.len() > local_len + BTR_EXTERN_FIELD_REF_SIZE
                })
                .max_by_key(|(_, f)| f.len())
                .map(|(i, _)| i);
            let Some(field_no) = candidate else {
                restore_big_rec(entry, big);
                return None;
            };
            let data = entry.fields[field_no].data.take().unwrap_or_default();
            let mut local = Vec::with_capacity(local_len + BTR_EXTERN_FIELD_REF_SIZE);
            local.extend_from_slice(&data[..local_len]);
            local.resize(local_len + BTR_EXTERN_FIELD_REF_SIZE, 0);
            ExternRef {
                space: index.space,
                page_no: FIL_NULL,
                offset: 0,
                ext_len: 0,
            }
            .write(&mut local[local_len..]);
            entry.fields[field_no] = Field::new(local);
            big.fields.push(BigRecField {
                field_no,
                data,
                local_len,
            });
        }
        big.fields.sort_by_key(|f| f.field_no);
        Some(big)
    }

    /// Writes the off-page parts of `big` for the record at `offset` of
    /// `page_id` and sets the record's extern bits.
    ///
    /// Every blob page is allocated before anything is written; if one
    /// allocation fails the others are given back and the record is left
    /// untouched.
    pub fn store_big_rec_extern_fields(
        &self,
        mtr: &mut Mtr,
        index: &Index,
        page_id: PageId,
        offset: usize,
        big: &BigRec,
    ) -> Result<()> {
        let page_size = mtr.page_size();
        let cap = blob_part_capacity(page_size);

        let mut chains: Vec<Vec<PageId>> = Vec::with_capacity(big.fields.len());
        let mut hint = page_id.page_no.saturating_add(1);
        for field in &big.fields {
            let n_pages = field.extern_len().div_ceil(cap);
            let mut chain = Vec::with_capacity(n_pages);
            for _ in 0..n_pages {
                match mtr.allocate_page(index.space, Some(hint)) {
                    Ok(id) => {
                        hint = id.page_no.saturating_add(1);
                        chain.push(id);
                    }
                    Err(err) => {
                        for id in chains.iter().flatten().chain(chain.iter()) {
                            mtr.free_page(*id)?;
                        }
                        debug!(
                            target: "cairn::btree::blob",
                            index = %index.name,
                            %err,
                            "overflow page allocation failed"
                        );
                        return Err(err);
                    }
                }
            }
            chains.push(chain);
        }

        let mut written = 0u64;
        for (field, chain) in big.fields.iter().zip(&chains) {
            let ext = &field.data[field.local_len..];
            for (k, (blob, part)) in chain.iter().zip(ext.chunks(cap)).enumerate() {
                let next = chain.get(k + 1).map(|id| id.page_no).unwrap_or(FIL_NULL);
                let frame = mtr.page_mut(*blob)?;
                fil::set_kind(frame, PageKind::Blob);
                be::write_u32(frame, BLOB_HDR_PART_LEN, part.len() as u32);
                be::write_u32(frame, BLOB_HDR_NEXT, next);
                let start = FIL_HDR_LEN + BLOB_HDR_SIZE;
                frame[start..start + part.len()].copy_from_slice(part);
                written += 1;
            }

            let first = chain
                .first()
                .ok_or(CairnError::Corruption("external field without blob pages"))?;
            let frame = mtr.page_mut(page_id)?;
            let range = Rec::at(frame, offset)?.field_range(field.field_no);
            if range.len() != field.local_len + BTR_EXTERN_FIELD_REF_SIZE {
                return Err(CairnError::Corruption("converted field has an unexpected length"));
            }
            let ref_at = offset + range.end - BTR_EXTERN_FIELD_REF_SIZE;
            ExternRef {
                space: index.space,
                page_no: first.page_no,
                offset: BLOB_HDR_PART_LEN as u32,
                ext_len: ext.len() as u64,
            }
            .write(&mut frame[ref_at..ref_at + BTR_EXTERN_FIELD_REF_SIZE]);
            rec::set_field_ext(frame, offset, field.field_no);
        }
        self.stats().overflow_pages_written(written);
        debug!(
            target: "cairn::btree::blob",
            index = %index.name,
            page = %page_id,
            fields = big.fields.len(),
            pages = written,
            "stored external fields"
        );
        Ok(())
    }

    /// Frees the blob chain of field `field_no` of the record at `offset`.
    ///
    /// The reference is advanced page by page, so it ends with `FIL_NULL`
    /// and a zero length. Returns the number of pages freed.
    pub fn free_externally_stored_field(
        &self,
        mtr: &mut Mtr,
        page_id: PageId,
        offset: usize,
        field_no: usize,
    ) -> Result<u64> {
        let mut freed = 0u64;
        loop {
            let frame = mtr.page(page_id)?;
            let rec = Rec::at(frame, offset)?;
            if !rec.is_ext(field_no) {
                break;
            }
            let range = rec.field_range(field_no);
            if range.len() < BTR_EXTERN_FIELD_REF_SIZE {
                return Err(CairnError::Corruption("external field shorter than its reference"));
            }
            let ref_at = offset + range.end - BTR_EXTERN_FIELD_REF_SIZE;
            let r = ExternRef::read(&frame[ref_at..ref_at + BTR_EXTERN_FIELD_REF_SIZE])?;
            if r.page_no == FIL_NULL {
                if r.ext_len != 0 {
                    return Err(CairnError::Corruption("freed external field keeps a length"));
                }
                break;
            }

            let blob = PageId::new(r.space, r.page_no);
            mtr.latch_page(blob, RwLatch::Exclusive)?;
            let (part_len, next) = {
                let b = mtr.page(blob)?;
                if fil::kind(b)? != PageKind::Blob {
                    return Err(CairnError::Corruption("overflow chain points at a non-blob page"));
                }
                (u64::from(be::read_u32(b, BLOB_HDR_PART_LEN)), be::read_u32(b, BLOB_HDR_NEXT))
            };
            let remaining = r
                .ext_len
                .checked_sub(part_len)
                .ok_or(CairnError::Corruption("overflow part longer than the field"))?;
            if (next == FIL_NULL) != (remaining == 0) {
                return Err(CairnError::Corruption("overflow chain length mismatch"));
            }
            mtr.free_page(blob)?;
            let frame = mtr.page_mut(page_id)?;
            ExternRef {
                page_no: next,
                ext_len: remaining,
                ..r
            }
            .write(&mut frame[ref_at..ref_at + BTR_EXTERN_FIELD_REF_SIZE]);
            freed += 1;
        }
        if freed > 0 {
            self.stats().overflow_pages_freed(freed);
            debug!(target: "cairn::btree::blob", page = %page_id, field_no, pages = freed, "freed external field");
        }
        Ok(freed)
    }

    /// Frees every external field of the record at `pos`.
    pub(crate) fn free_record_externs(&self, mtr: &mut Mtr, page_id: PageId, pos: usize) -> Result<u64> {
        let (offset, ext_fields) = {
            let rec = page::rec_at(mtr.page(page_id)?, pos)?;
            let ext: Vec<usize> = (0..rec.n_fields()).filter(|&i| rec.is_ext(i)).collect();
            (rec.offset, ext)
        };
        let mut freed = 0;
        for field_no in ext_fields {
            freed += self.free_externally_stored_field(mtr, page_id, offset, field_no)?;
        }
        Ok(freed)
    }

    /// Reassembles a full value from its local prefix and blob chain.
    ///
    /// `local` is the in-record field: prefix followed by the reference.
    /// The caller must hold a latch on the page of the owning record in
    /// `mtr`; each blob page is latched shared in `mtr` only while its part
    /// is copied.
    pub fn copy_externally_stored_field(&self, mtr: &mut Mtr, local: &[u8]) -> Result<Vec<u8>> {
        let r = ExternRef::read(local)?;
        let prefix = &local[..local.len() - BTR_EXTERN_FIELD_REF_SIZE];
        let expected = prefix.len() as u64 + r.ext_len;
        let mut out = Vec::with_capacity(expected as usize);
        out.extend_from_slice(prefix);

        let mut page_no = r.page_no;
        while page_no != FIL_NULL {
            let id = PageId::new(r.space, page_no);
            let held = mtr.held_latch(id).is_some();
            let savepoint = mtr.savepoint();
            if !held {
                mtr.latch_page(id, RwLatch::Shared)?;
            }
            let next = {
                let frame = mtr.page(id)?;
                if fil::kind(frame)? != PageKind::Blob {
                    return Err(CairnError::Corruption("overflow chain points at a non-blob page"));
                }
                let part_len = be::read_u32(frame, BLOB_HDR_PART_LEN) as usize;
                let start = FIL_HDR_LEN + BLOB_HDR_SIZE;
                let part = frame
                    .get(start..start + part_len)
                    .ok_or(CairnError::Corruption("overflow part exceeds its page"))?;
                out.extend_from_slice(part);
                be::read_u32(frame, BLOB_HDR_NEXT)
            };
            if !held {
                mtr.release_at_savepoint(savepoint);
            }
            page_no = next;
            if out.len() as u64 > expected {
                return Err(CairnError::Corruption("overflow chain longer than recorded"));
            }
        }
        if out.len() as u64 != expected {
            return Err(CairnError::Corruption("overflow chain shorter than recorded"));
        }
        Ok(out)
    }

    /// Copy of `tuple` with every external field replaced by its full value.
    ///
    /// `tuple` must have been read from a record still latched in `mtr`.
    pub fn fetch_full_tuple(&self, mtr: &mut Mtr, tuple: &Tuple) -> Result<Tuple> {
        let mut full = tuple.clone();
        for field in full.fields.iter_mut().filter(|f| f.ext) {
            let local = field
                .data
                .as_deref()
                .ok_or(CairnError::Corruption("external field is NULL"))?;
            *field = Field::new(self.copy_externally_stored_field(mtr, local)?);
        }
        Ok(full)
    }
}
