//! Compact redo records for in-place record changes.
//!
//! Structural changes are logged as full page images by the
//! mini-transaction; the three record kinds here cover changes that keep
//! every record where it is. All integers are big-endian and every record
//! travels in the `kind | space | page_no` envelope.
//!
//! ```text
//! 0x21 update in place   flags u8 | sys | offset u16 | info u8 | n varint
//!                        | n x (field_no varint | len varint | bytes)
//! 0x22 clust del-mark    flags u8 | value u8 | sys | offset u16
//! 0x23 sec del-mark      value u8 | offset u16
//! sys                    pos varint | roll_ptr 7 bytes | trx_id varint
//! ```

use std::ops::Range;

use tracing::trace;

use crate::primitives::bytes::{buf::Reader, var};
use crate::primitives::mtr::{Mtr, MLOG_PAGE_IMAGE, REDO_ENVELOPE_LEN};
use crate::types::{CairnError, PageId, Result, SpaceId};

use super::engine::OpFlags;
use super::index::{DATA_ROLL_PTR_LEN, DATA_TRX_ID_LEN};
use super::rec::{self, Field, Rec};
use super::update::{UpdField, UpdateVector};

/// Redo kind for an in-place update of a clustered record.
pub const MLOG_REC_UPDATE_IN_PLACE: u8 = 0x21;
/// Redo kind for setting or clearing a clustered delete mark.
pub const MLOG_REC_CLUST_DELETE_MARK: u8 = 0x22;
/// Redo kind for setting or clearing a secondary delete mark.
pub const MLOG_REC_SEC_DELETE_MARK: u8 = 0x23;

const NULL_LEN: u64 = 0xFFFF_FFFF;

/// System field values carried by clustered record changes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SysFields {
    /// Field number of `DB_TRX_ID`.
    pub pos: usize,
    /// Transaction id.
    pub trx_id: u64,
    /// Rollback pointer.
    pub roll_ptr: u64,
}

fn truncated() -> CairnError {
    CairnError::Corruption("truncated redo record")
}

fn write_sys(sys: SysFields, out: &mut Vec<u8>) {
    var::encode_u64(sys.pos as u64, out);
    out.extend_from_slice(&sys.roll_ptr.to_be_bytes()[8 - DATA_ROLL_PTR_LEN..]);
    var::encode_u64(sys.trx_id, out);
}

fn read_sys(r: &mut Reader<'_>) -> Result<SysFields> {
    let pos = r.varint().ok_or_else(truncated)? as usize;
    let roll = r.take(DATA_ROLL_PTR_LEN).ok_or_else(truncated)?;
    let mut roll_ptr = 0u64;
    for b in roll {
        roll_ptr = (roll_ptr << 8) | u64::from(*b);
    }
    let trx_id = r.varint().ok_or_else(truncated)?;
    Ok(SysFields { pos, trx_id, roll_ptr })
}

fn check_offset(page: &[u8], offset: usize) -> Result<()> {
    Rec::at(page, offset).map(|_| ())
}

/// Writes the system fields of the record at `offset`.
pub(crate) fn apply_sys(page: &mut [u8], offset: usize, sys: SysFields) -> Result<()> {
    let trx = sys.trx_id.to_be_bytes();
    let roll = sys.roll_ptr.to_be_bytes();
    rec::write_field_in_place(page, offset, sys.pos, Some(&trx[8 - DATA_TRX_ID_LEN..]))?;
    rec::write_field_in_place(page, offset, sys.pos + 1, Some(&roll[8 - DATA_ROLL_PTR_LEN..]))
}

/// Logs an in-place update of the record at `offset`.
pub fn log_update_in_place(
    mtr: &mut Mtr,
    page_id: PageId,
    offset: usize,
    flags: OpFlags,
    sys: SysFields,
    update: &UpdateVector,
) {
    let mut body = Vec::with_capacity(32);
    body.push(flags.0);
    write_sys(sys, &mut body);
    body.extend_from_slice(&(offset as u16).to_be_bytes());
    body.push(update.info_bits);
    var::encode_u64(update.fields.len() as u64, &mut body);
    for uf in &update.fields {
        var::encode_u64(uf.field_no as u64, &mut body);
        match &uf.new.data {
            Some(bytes) => {
                var::encode_u64(bytes.len() as u64, &mut body);
                body.extend_from_slice(bytes);
            }
            None => var::encode_u64(NULL_LEN, &mut body),
        }
    }
    mtr.log_record(MLOG_REC_UPDATE_IN_PLACE, page_id, &body);
}

/// Logs a clustered delete-mark change of the record at `offset`.
pub fn log_clust_del_mark(mtr: &mut Mtr, page_id: PageId, offset: usize, flags: OpFlags, value: bool, sys: SysFields) {
    let mut body = Vec::with_capacity(20);
    body.push(flags.0);
    body.push(u8::from(value));
    write_sys(sys, &mut body);
    body.extend_from_slice(&(offset as u16).to_be_bytes());
    mtr.log_record(MLOG_REC_CLUST_DELETE_MARK, page_id, &body);
}

/// Logs a secondary delete-mark change of the record at `offset`.
pub fn log_sec_del_mark(mtr: &mut Mtr, page_id: PageId, offset: usize, value: bool) {
    let mut body = [0u8; 3];
    body[0] = u8::from(value);
    body[1..].copy_from_slice(&(offset as u16).to_be_bytes());
    mtr.log_record(MLOG_REC_SEC_DELETE_MARK, page_id, &body);
}

/// Parses one record body of `kind`, applying it to `page` when given.
///
/// Returns the number of body bytes consumed.
pub fn parse_record(kind: u8, body: &[u8], page: Option<&mut [u8]>) -> Result<usize> {
    let mut r = Reader::new(body);
    match kind {
        MLOG_PAGE_IMAGE => {
            let len = r.u32().ok_or_else(truncated)? as usize;
            let image = r.take(len).ok_or_else(truncated)?;
            if let Some(page) = page {
                if page.len() != len {
                    return Err(CairnError::Corruption("page image size mismatch"));
                }
                page.copy_from_slice(image);
            }
        }
        MLOG_REC_UPDATE_IN_PLACE => {
            let flags = OpFlags(r.u8().ok_or_else(truncated)?);
            let sys = read_sys(&mut r)?;
            let offset = usize::from(r.u16().ok_or_else(truncated)?);
            let info_bits = r.u8().ok_or_else(truncated)?;
            let n = r.varint().ok_or_else(truncated)? as usize;
            let mut fields = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                let field_no = r.varint().ok_or_else(truncated)? as usize;
                let len = r.varint().ok_or_else(truncated)?;
                let new = if len == NULL_LEN {
                    Field::null()
                } else {
                    Field::new(r.take(len as usize).ok_or_else(truncated)?.to_vec())
                };
                fields.push(UpdField { field_no, new });
            }
            if let Some(page) = page {
                check_offset(page, offset)?;
                rec::set_info_bits(page, offset, info_bits);
                if !flags.contains(OpFlags::KEEP_SYS) {
                    apply_sys(page, offset, sys)?;
                }
                for uf in &fields {
                    rec::write_field_in_place(page, offset, uf.field_no, uf.new.data.as_deref())?;
                }
            }
        }
        MLOG_REC_CLUST_DELETE_MARK => {
            let flags = OpFlags(r.u8().ok_or_else(truncated)?);
            let value = r.u8().ok_or_else(truncated)? != 0;
            let sys = read_sys(&mut r)?;
            let offset = usize::from(r.u16().ok_or_else(truncated)?);
            if let Some(page) = page {
                check_offset(page, offset)?;
                rec::set_deleted(page, offset, value);
                if !flags.contains(OpFlags::KEEP_SYS) {
                    apply_sys(page, offset, sys)?;
                }
            }
        }
        MLOG_REC_SEC_DELETE_MARK => {
            let value = r.u8().ok_or_else(truncated)? != 0;
            let offset = usize::from(r.u16().ok_or_else(truncated)?);
            if let Some(page) = page {
                check_offset(page, offset)?;
                rec::set_deleted(page, offset, value);
            }
        }
        _ => return Err(CairnError::Corruption("unknown redo record kind")),
    }
    Ok(r.off)
}

/// Splits a redo group into `(kind, page, body range)` entries.
pub fn records_in_group(group: &[u8]) -> Result<Vec<(u8, PageId, Range<usize>)>> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < group.len() {
        let mut r = Reader::new(&group[off..]);
        let kind = r.u8().ok_or_else(truncated)?;
        let space = r.u32().ok_or_else(truncated)?;
        let page_no = r.u32().ok_or_else(truncated)?;
        let start = off + REDO_ENVELOPE_LEN;
        let len = parse_record(kind, &group[start..], None)?;
        out.push((kind, PageId::new(SpaceId(space), page_no), start..start + len));
        off = start + len;
    }
    Ok(out)
}

/// Replays every record of `group` addressed to `page_id` onto `page`.
///
/// Returns the number of records applied.
pub fn apply_group(group: &[u8], page_id: PageId, page: &mut [u8]) -> Result<usize> {
    let mut applied = 0;
    for (kind, id, range) in records_in_group(group)? {
        if id == page_id {
            parse_record(kind, &group[range], Some(&mut *page))?;
            applied += 1;
        }
    }
    trace!(target: "cairn::redo", page = %page_id, applied, "replayed redo group");
    Ok(applied)
}
