use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::types::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{CairnError, Result};

/// Tunables of an [`super::btree::IndexEngine`].
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// page_size = 8192
/// merge_threshold_pct = 40
/// adaptive_hash = false
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineOptions {
    /// Page size in bytes; must match the page store.
    pub page_size: u32,
    /// Bytes of an externally stored field kept in the record.
    pub extern_local_prefix: u32,
    /// Pages filled below this percentage are candidates for merging.
    pub merge_threshold_pct: u32,
    /// Free space kept on clustered leaves for future updates.
    /// `None` means `page_size / 16`.
    pub update_reserve: Option<u32>,
    /// Pages with less than `page_size / reorganize_limit` free are only
    /// inserted into when the record fits without reorganizing.
    pub reorganize_limit: u32,
    /// Pages per extent for space reservations.
    pub extent_pages: u32,
    /// Enables the adaptive hash shortcut on leaf searches.
    pub adaptive_hash: bool,
    /// Enables buffering of secondary-index inserts into non-resident pages.
    pub insert_buffer: bool,
    /// Verifies page checksums when pages are read back in.
    pub verify_checksums: bool,
    /// Leaf pages sampled by the distinct-key estimate.
    pub distinct_sample_pages: u32,
    /// Seed for the random descents used by sampling.
    pub random_seed: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            extern_local_prefix: 768,
            merge_threshold_pct: 50,
            update_reserve: None,
            reorganize_limit: 32,
            extent_pages: 64,
            adaptive_hash: true,
            insert_buffer: true,
            verify_checksums: true,
            distinct_sample_pages: 8,
            random_seed: 0x6361_6972_6e00_0001,
        }
    }
}

impl EngineOptions {
    /// Parses options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: Self = toml::from_str(text).map_err(|err| CairnError::Config(err.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads options from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(CairnError::Invalid("page_size must be a power of two in 4K..=16K"));
        }
        if self.merge_threshold_pct == 0 || self.merge_threshold_pct > 100 {
            return Err(CairnError::Invalid("merge_threshold_pct must be in 1..=100"));
        }
        if self.reorganize_limit == 0 {
            return Err(CairnError::Invalid("reorganize_limit must be positive"));
        }
        if self.extent_pages == 0 {
            return Err(CairnError::Invalid("extent_pages must be positive"));
        }
        if self.distinct_sample_pages == 0 {
            return Err(CairnError::Invalid("distinct_sample_pages must be positive"));
        }
        if self.extern_local_prefix as usize + super::btree::overflow::BTR_EXTERN_FIELD_REF_SIZE
            >= self.page_size as usize / 4
        {
            return Err(CairnError::Invalid("extern_local_prefix too large for page_size"));
        }
        if let Some(reserve) = self.update_reserve {
            if reserve >= self.page_size / 2 {
                return Err(CairnError::Invalid("update_reserve must be below half a page"));
            }
        }
        Ok(())
    }

    /// Sets the page size.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Sets the inline prefix kept for externally stored fields.
    pub fn extern_local_prefix(mut self, bytes: u32) -> Self {
        self.extern_local_prefix = bytes;
        self
    }

    /// Sets the merge threshold percentage.
    pub fn merge_threshold_pct(mut self, pct: u32) -> Self {
        self.merge_threshold_pct = pct;
        self
    }

    /// Sets the clustered-leaf update reserve.
    pub fn update_reserve(mut self, bytes: u32) -> Self {
        self.update_reserve = Some(bytes);
        self
    }

    /// Sets the pages-per-extent used by reservations.
    pub fn extent_pages(mut self, pages: u32) -> Self {
        self.extent_pages = pages;
        self
    }

    /// Toggles the adaptive hash shortcut.
    pub fn adaptive_hash(mut self, enabled: bool) -> Self {
        self.adaptive_hash = enabled;
        self
    }

    /// Toggles insert buffering.
    pub fn insert_buffer(mut self, enabled: bool) -> Self {
        self.insert_buffer = enabled;
        self
    }

    /// Toggles checksum verification on page reads.
    pub fn verify_checksums(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    /// Sets the seed for sampling descents.
    pub fn random_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    /// Effective update reserve in bytes.
    pub fn effective_update_reserve(&self) -> usize {
        self.update_reserve
            .map(|r| r as usize)
            .unwrap_or(self.page_size as usize / 16)
    }

    /// Free space below which inserts avoid reorganizing.
    pub fn reorganize_threshold(&self) -> usize {
        self.page_size as usize / self.reorganize_limit as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() -> Result<()> {
        let opts = EngineOptions::from_toml_str("page_size = 8192\nadaptive_hash = false\n")?;
        assert_eq!(opts.page_size, 8192);
        assert!(!opts.adaptive_hash);
        assert_eq!(opts.extern_local_prefix, 768);
        assert_eq!(opts.effective_update_reserve(), 512);
        Ok(())
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        assert!(matches!(
            EngineOptions::from_toml_str("pagesize = 8192"),
            Err(CairnError::Config(_))
        ));
        assert!(matches!(
            EngineOptions::from_toml_str("page_size = 5000"),
            Err(CairnError::Invalid(_))
        ));
        assert!(matches!(
            EngineOptions::from_toml_str("merge_threshold_pct = 0"),
            Err(CairnError::Invalid(_))
        ));
    }

    #[test]
    fn loads_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("engine.toml");
        let mut file = fs::File::create(&path)?;
        writeln!(file, "page_size = 4096")?;
        writeln!(file, "update_reserve = 100")?;
        drop(file);
        let opts = EngineOptions::from_path(&path)?;
        assert_eq!(opts.page_size, 4096);
        assert_eq!(opts.effective_update_reserve(), 100);
        Ok(())
    }
}
