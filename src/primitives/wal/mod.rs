#![forbid(unsafe_code)]

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{CairnError, Lsn, Result};

const GROUP_HEADER_LEN: usize = 8;

/// Statistics tracking redo appends.
#[derive(Clone, Debug, Default)]
pub struct RedoStats {
    /// Number of mini-transaction groups appended.
    pub groups_appended: u64,
    /// Total bytes appended, framing included.
    pub bytes_appended: u64,
}

#[derive(Default)]
struct RedoState {
    buf: Vec<u8>,
    stats: RedoStats,
}

/// In-memory redo log buffer.
///
/// Each committed mini-transaction becomes one group framed as
/// `len:u32 | crc32:u32 | records`, so a torn tail is detected on scan.
/// The LSN of a group is the buffer offset just past its frame.
#[derive(Default)]
pub struct RedoLog {
    state: Mutex<RedoState>,
}

impl RedoLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the records of one mini-transaction and returns its end LSN.
    pub fn append_group(&self, records: &[u8]) -> Result<Lsn> {
        let len = u32::try_from(records.len())
            .map_err(|_| CairnError::Invalid("redo group exceeds u32 length"))?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(records);
        let crc = hasher.finalize();
        let mut state = self.state.lock();
        state.buf.extend_from_slice(&len.to_be_bytes());
        state.buf.extend_from_slice(&crc.to_be_bytes());
        state.buf.extend_from_slice(records);
        state.stats.groups_appended += 1;
        state.stats.bytes_appended += (GROUP_HEADER_LEN + records.len()) as u64;
        let lsn = Lsn(state.buf.len() as u64);
        debug!(target: "cairn::redo", lsn = lsn.0, bytes = records.len(), "appended redo group");
        Ok(lsn)
    }

    /// Current end of the log.
    pub fn current_lsn(&self) -> Lsn {
        Lsn(self.state.lock().buf.len() as u64)
    }

    /// Copies the raw log contents from `from` to the end.
    pub fn read_from(&self, from: Lsn) -> Vec<u8> {
        let state = self.state.lock();
        let start = (from.0 as usize).min(state.buf.len());
        state.buf[start..].to_vec()
    }

    /// Returns a snapshot of the append counters.
    pub fn stats(&self) -> RedoStats {
        self.state.lock().stats.clone()
    }

    /// Splits a raw log slice into verified group payloads.
    ///
    /// A truncated trailing group ends the scan; a checksum mismatch is
    /// reported as corruption.
    pub fn groups(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        let mut off = 0usize;
        while off + GROUP_HEADER_LEN <= raw.len() {
            let len = u32::from_be_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
                as usize;
            let crc =
                u32::from_be_bytes([raw[off + 4], raw[off + 5], raw[off + 6], raw[off + 7]]);
            let start = off + GROUP_HEADER_LEN;
            let Some(payload) = raw.get(start..start + len) else {
                break;
            };
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(payload);
            if hasher.finalize() != crc {
                return Err(CairnError::Corruption("redo group crc mismatch"));
            }
            out.push(payload.to_vec());
            off = start + len;
        }
        Ok(out)
    }
}
