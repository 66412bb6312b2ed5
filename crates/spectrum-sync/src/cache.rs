//! Recent-state cache.
//!
//! Holds the committed `(supply, hash, total_burned)` of the last few blocks
//! so the next block's commit can read its parent without a storage round
//! trip. Only ever written after a successful commit; purged wholesale on a
//! reorg.

use alloy_primitives::U256;
use std::collections::VecDeque;

/// Default number of heights kept.
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlock {
    pub supply: U256,
    pub hash: String,
    pub total_burned: U256,
}

impl From<&crate::Block> for CachedBlock {
    fn from(block: &crate::Block) -> Self {
        Self {
            supply: block.supply,
            hash: block.hash.clone(),
            total_burned: block.total_burned,
        }
    }
}

/// Fixed-capacity LRU keyed by block height.
///
/// Most recently used entries sit at the back; eviction pops the front.
#[derive(Debug)]
pub struct BlockCache {
    entries: VecDeque<(u64, CachedBlock)>,
    capacity: usize,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Look up `height`, marking it most recently used.
    pub fn get(&mut self, height: u64) -> Option<CachedBlock> {
        let idx = self.entries.iter().position(|(h, _)| *h == height)?;
        let entry = self.entries.remove(idx)?;
        let value = entry.1.clone();
        self.entries.push_back(entry);
        Some(value)
    }

    /// Insert or replace `height`, evicting the least recently used entry
    /// when full.
    pub fn insert(&mut self, height: u64, value: CachedBlock) {
        if let Some(idx) = self.entries.iter().position(|(h, _)| *h == height) {
            self.entries.remove(idx);
        } else if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((height, value));
    }

    pub fn contains(&self, height: u64) -> bool {
        self.entries.iter().any(|(h, _)| *h == height)
    }

    /// Drop every entry.
    pub fn purge(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u64) -> CachedBlock {
        CachedBlock {
            supply: U256::from(n),
            hash: format!("0x{:02x}", n),
            total_burned: U256::ZERO,
        }
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = BlockCache::new(3);
        cache.insert(1, entry(1));
        cache.insert(2, entry(2));
        cache.insert(3, entry(3));

        // Touch 1 so 2 becomes the eviction candidate.
        assert_eq!(cache.get(1), Some(entry(1)));
        cache.insert(4, entry(4));

        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_insert_replaces_existing_height() {
        let mut cache = BlockCache::new(2);
        cache.insert(7, entry(7));
        cache.insert(7, entry(70));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(7).unwrap().supply, U256::from(70u64));
    }

    #[test]
    fn test_purge() {
        let mut cache = BlockCache::default();
        for h in 0..15 {
            cache.insert(h, entry(h));
        }
        assert_eq!(cache.len(), DEFAULT_CACHE_CAPACITY);
        assert!(!cache.contains(4));
        assert!(cache.contains(14));

        cache.purge();
        assert!(cache.is_empty());
        assert_eq!(cache.get(14), None);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut cache = BlockCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(1, entry(1));
        cache.insert(2, entry(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(2));
    }
}
