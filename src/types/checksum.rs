use super::page::header;

/// CRC32 over everything after the checksum field.
pub fn page_checksum(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[header::CHECKSUM.end..]);
    hasher.finalize()
}

/// Recomputes and stores the page checksum.
pub fn stamp_page_checksum(page: &mut [u8]) {
    let crc = page_checksum(page);
    page[header::CHECKSUM].copy_from_slice(&crc.to_be_bytes());
}

/// Returns true when the stored checksum matches the page contents.
///
/// Pages that were never stamped (all-zero checksum and LSN) are accepted.
pub fn verify_page_checksum(page: &[u8]) -> bool {
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&page[header::CHECKSUM]);
    let stored = u32::from_be_bytes(stored);
    if stored == 0 && super::page::lsn(page) == 0 {
        return true;
    }
    stored == page_checksum(page)
}
