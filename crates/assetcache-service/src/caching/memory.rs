use std::collections::HashMap;
use std::sync::Mutex;

use crate::metric;
use crate::types::Asset;

use super::CacheKey;

/// The in-memory tier, mapping keys to fully formatted assets.
///
/// There is no eviction policy. The tier only shrinks when it is cleared as a whole.
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: Mutex<HashMap<CacheKey, Asset>>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Asset> {
        let asset = self.entries.lock().unwrap().get(key).cloned();
        if asset.is_some() {
            metric!(counter("caches.memory.hit") += 1);
        } else {
            metric!(counter("caches.memory.miss") += 1);
        }
        asset
    }

    /// Inserts `asset`, replacing any previous asset for `key`.
    pub fn insert(&self, key: CacheKey, asset: Asset) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key, asset);
        metric!(gauge("caches.memory.entries") = entries.len() as u64);
    }

    /// Removes all entries, returning how many there were.
    pub fn clear(&self) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        metric!(gauge("caches.memory.entries") = 0);
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
