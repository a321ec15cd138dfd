#![forbid(unsafe_code)]
//! Identifiers, the crate-wide error type, and the shared page header layout.

use std::fmt;

mod checksum;

pub use checksum::{page_checksum, stamp_page_checksum, verify_page_checksum};

/// Tablespace identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SpaceId(pub u32);

/// Page number sentinel meaning "no page".
pub const FIL_NULL: u32 = u32::MAX;

/// Address of a page inside a tablespace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId {
    /// Owning tablespace.
    pub space: SpaceId,
    /// Page number within the tablespace.
    pub page_no: u32,
}

impl PageId {
    /// Builds a page address.
    pub const fn new(space: SpaceId, page_no: u32) -> Self {
        Self { space, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space.0, self.page_no)
    }
}

/// Identifier carried by every page of one index tree.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u64);

/// Transaction identifier stored in clustered records (6 bytes on page).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TrxId(pub u64);

/// Rollback pointer into the undo log (7 bytes on page).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct RollPtr(pub u64);

/// Log sequence number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the storage layers below the cursor engine.
#[derive(thiserror::Error, Debug)]
pub enum CairnError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-page or log structure violated an invariant.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an argument the operation cannot honour.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Requested object does not exist.
    #[error("not found")]
    NotFound,
    /// A file space could not supply the requested pages or extents.
    #[error("out of file space")]
    OutOfFileSpace,
    /// Configuration could not be parsed.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CairnError>;

pub mod page {
    //! File header shared by every page kind.

    use super::{CairnError, Result};

    /// Length of the file header at the start of every page.
    pub const FIL_HDR_LEN: usize = 32;
    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: u32 = 4096;
    /// Largest supported page size.
    pub const MAX_PAGE_SIZE: u32 = 16384;

    pub mod header {
        //! Byte offsets for fixed header fields.
        use core::ops::Range;

        pub const CHECKSUM: Range<usize> = 0..4;
        pub const SPACE: Range<usize> = 4..8;
        pub const PAGE_NO: Range<usize> = 8..12;
        pub const PREV: Range<usize> = 12..16;
        pub const NEXT: Range<usize> = 16..20;
        pub const KIND: Range<usize> = 20..22;
        pub const LSN: Range<usize> = 24..32;
    }

    /// What a page currently stores.
    #[repr(u16)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// Freshly allocated, not yet formatted.
        Allocated = 0,
        /// B-tree node (leaf or internal).
        Index = 1,
        /// Part of an externally stored field chain.
        Blob = 2,
    }

    impl PageKind {
        /// Decodes the on-page kind tag.
        pub fn from_u16(value: u16) -> Result<Self> {
            match value {
                0 => Ok(Self::Allocated),
                1 => Ok(Self::Index),
                2 => Ok(Self::Blob),
                _ => Err(CairnError::Corruption("unknown page kind")),
            }
        }
    }

    fn read_u32(page: &[u8], range: core::ops::Range<usize>) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&page[range]);
        u32::from_be_bytes(buf)
    }

    /// Page number stored in the header.
    pub fn page_no(page: &[u8]) -> u32 {
        read_u32(page, header::PAGE_NO)
    }

    /// Space id stored in the header.
    pub fn space(page: &[u8]) -> u32 {
        read_u32(page, header::SPACE)
    }

    /// Left sibling page number, or `FIL_NULL`.
    pub fn prev(page: &[u8]) -> u32 {
        read_u32(page, header::PREV)
    }

    /// Right sibling page number, or `FIL_NULL`.
    pub fn next(page: &[u8]) -> u32 {
        read_u32(page, header::NEXT)
    }

    /// Sets the left sibling link.
    pub fn set_prev(page: &mut [u8], page_no: u32) {
        page[header::PREV].copy_from_slice(&page_no.to_be_bytes());
    }

    /// Sets the right sibling link.
    pub fn set_next(page: &mut [u8], page_no: u32) {
        page[header::NEXT].copy_from_slice(&page_no.to_be_bytes());
    }

    /// Page kind stored in the header.
    pub fn kind(page: &[u8]) -> Result<PageKind> {
        PageKind::from_u16(u16::from_be_bytes([page[header::KIND.start], page[header::KIND.start + 1]]))
    }

    /// Overwrites the page kind.
    pub fn set_kind(page: &mut [u8], kind: PageKind) {
        page[header::KIND].copy_from_slice(&(kind as u16).to_be_bytes());
    }

    /// LSN of the last mini-transaction that modified the page.
    pub fn lsn(page: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&page[header::LSN]);
        u64::from_be_bytes(buf)
    }

    /// Stamps the page LSN.
    pub fn set_lsn(page: &mut [u8], lsn: u64) {
        page[header::LSN].copy_from_slice(&lsn.to_be_bytes());
    }

    /// Zeroes the page and writes a fresh file header.
    pub fn format(page: &mut [u8], space: u32, page_no: u32, kind: PageKind) {
        page.fill(0);
        page[header::SPACE].copy_from_slice(&space.to_be_bytes());
        page[header::PAGE_NO].copy_from_slice(&page_no.to_be_bytes());
        set_prev(page, super::FIL_NULL);
        set_next(page, super::FIL_NULL);
        set_kind(page, kind);
    }
}
