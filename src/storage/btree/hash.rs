use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::types::{IndexId, PageId};

use super::index::Index;
use super::rec::Tuple;

/// Adaptive hash index: remembers which leaf holds a full ordering key so a
/// later search can skip the descent. Guesses are always verified on the page.
pub trait AdaptiveHashIndex: Send + Sync {
    /// Leaf that probably holds `tuple`.
    fn guess(&self, index: &Index, tuple: &Tuple) -> Option<PageId>;
    /// True when some entry points into `page`.
    fn is_page_hashed(&self, page: PageId) -> bool;
    /// Records the leaf a full-key descent ended on.
    fn update_on_search(&self, index: &Index, tuple: &Tuple, page: PageId);
    /// A record was inserted into `page`.
    fn on_insert(&self, index: &Index, entry: &Tuple, page: PageId);
    /// A record was removed from `page`.
    fn on_delete(&self, index: &Index, entry: &Tuple, page: PageId);
    /// `page` was freed or rebuilt; drop everything pointing into it.
    fn drop_page(&self, page: PageId);
}

/// Hash index that never guesses.
#[derive(Default, Debug, Clone, Copy)]
pub struct DisabledHashIndex;

impl AdaptiveHashIndex for DisabledHashIndex {
    fn guess(&self, _index: &Index, _tuple: &Tuple) -> Option<PageId> {
        None
    }
    fn is_page_hashed(&self, _page: PageId) -> bool {
        false
    }
    fn update_on_search(&self, _index: &Index, _tuple: &Tuple, _page: PageId) {}
    fn on_insert(&self, _index: &Index, _entry: &Tuple, _page: PageId) {}
    fn on_delete(&self, _index: &Index, _entry: &Tuple, _page: PageId) {}
    fn drop_page(&self, _page: PageId) {}
}

type HashKey = (IndexId, Vec<Option<Vec<u8>>>);

#[derive(Default)]
struct KeyHashState {
    entries: FxHashMap<HashKey, PageId>,
    per_page: FxHashMap<PageId, usize>,
}

impl KeyHashState {
    fn insert(&mut self, key: HashKey, page: PageId) {
        if let Some(old) = self.entries.insert(key, page) {
            self.dec(old);
        }
        *self.per_page.entry(page).or_default() += 1;
    }

    fn remove(&mut self, key: &HashKey) {
        if let Some(old) = self.entries.remove(key) {
            self.dec(old);
        }
    }

    fn dec(&mut self, page: PageId) {
        if let Some(n) = self.per_page.get_mut(&page) {
            *n -= 1;
            if *n == 0 {
                self.per_page.remove(&page);
            }
        }
    }
}

/// Hash index keyed on the full ordering prefix of a record.
#[derive(Default)]
pub struct KeyHashIndex {
    state: RwLock<KeyHashState>,
}

impl KeyHashIndex {
    /// Creates an empty hash index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hashed keys.
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// True when nothing is hashed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(index: &Index, tuple: &Tuple) -> Option<HashKey> {
        if tuple.n_fields_cmp < index.n_uniq || tuple.fields.len() < index.n_uniq {
            return None;
        }
        let prefix = tuple.fields[..index.n_uniq]
            .iter()
            .map(|f| f.data.clone())
            .collect();
        Some((index.id, prefix))
    }
}

impl AdaptiveHashIndex for KeyHashIndex {
    fn guess(&self, index: &Index, tuple: &Tuple) -> Option<PageId> {
        let key = Self::key(index, tuple)?;
        self.state.read().entries.get(&key).copied()
    }

    fn is_page_hashed(&self, page: PageId) -> bool {
        self.state.read().per_page.contains_key(&page)
    }

    fn update_on_search(&self, index: &Index, tuple: &Tuple, page: PageId) {
        if let Some(key) = Self::key(index, tuple) {
            self.state.write().insert(key, page);
        }
    }

    fn on_insert(&self, index: &Index, entry: &Tuple, page: PageId) {
        if !self.is_page_hashed(page) {
            return;
        }
        if let Some(key) = Self::key(index, entry) {
            self.state.write().insert(key, page);
        }
    }

    fn on_delete(&self, index: &Index, entry: &Tuple, _page: PageId) {
        if let Some(key) = Self::key(index, entry) {
            self.state.write().remove(&key);
        }
    }

    fn drop_page(&self, page: PageId) {
        let mut state = self.state.write();
        if state.per_page.remove(&page).is_some() {
            state.entries.retain(|_, p| *p != page);
        }
    }
}
