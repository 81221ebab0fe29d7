// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Bounded side cache of statistics for recently-missed keys that are not
//! yet tracked by the uncached metadata, so a newly tracked key starts with
//! usable stats. Admission is unconditional; eviction is strict LRU once the
//! byte bound is exceeded.

use hashlink::LinkedHashMap;

use crate::types::{Frequency, Key};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MissStats {
    pub frequency: Frequency,
    pub last_object_size: u64,
}

impl MissStats {
    const ENTRY_SIZE: u64 = 8 + 8;
}

#[derive(Debug)]
pub struct UncachedLru {
    entries: LinkedHashMap<Key, MissStats>,
    max_bytes: u64,
    used_bytes: u64,
}

impl UncachedLru {
    pub fn new(max_bytes: u64) -> Self {
        assert!(max_bytes > 0);
        UncachedLru {
            entries: LinkedHashMap::new(),
            max_bytes,
            used_bytes: 0,
        }
    }

    fn entry_bytes(key: &Key) -> u64 {
        key.len() as u64 + MissStats::ENTRY_SIZE
    }

    /// Record one miss for `key`; admits unconditionally and trims strictly
    /// LRU past the byte bound.
    pub fn record_miss(&mut self, key: &Key, object_size: u64) -> MissStats {
        let stats = if let Some(mut stats) = self.entries.remove(key) {
            stats.frequency += 1;
            if object_size > 0 {
                stats.last_object_size = object_size;
            }
            // Re-insertion refreshes the entry's recency.
            self.entries.insert(key.clone(), stats);
            stats
        } else {
            let stats = MissStats {
                frequency: 1,
                last_object_size: object_size,
            };
            self.used_bytes += Self::entry_bytes(key);
            self.entries.insert(key.clone(), stats);
            stats
        };
        while self.used_bytes > self.max_bytes {
            let Some((evicted, _)) = self.entries.pop_front() else {
                break;
            };
            self.used_bytes = self.used_bytes.saturating_sub(Self::entry_bytes(&evicted));
        }
        stats
    }

    /// Remove and return the stats for a key being promoted into tracked
    /// metadata.
    pub fn take(&mut self, key: &Key) -> Option<MissStats> {
        let stats = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(Self::entry_bytes(key));
        Some(stats)
    }

    pub fn peek(&self, key: &Key) -> Option<&MissStats> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_counting_accumulates() {
        let mut lru = UncachedLru::new(1024);
        let key = Key::from("k");
        assert_eq!(lru.record_miss(&key, 100).frequency, 1);
        assert_eq!(lru.record_miss(&key, 100).frequency, 2);
        assert_eq!(lru.peek(&key).unwrap().last_object_size, 100);
    }

    #[test]
    fn strict_lru_eviction_past_byte_bound() {
        // Room for roughly two entries.
        let mut lru = UncachedLru::new(2 * (2 + 16));
        lru.record_miss(&Key::from("aa"), 1);
        lru.record_miss(&Key::from("bb"), 1);
        // Touch "aa" so "bb" is the LRU entry.
        lru.record_miss(&Key::from("aa"), 1);
        lru.record_miss(&Key::from("cc"), 1);
        assert!(lru.peek(&Key::from("aa")).is_some());
        assert!(lru.peek(&Key::from("bb")).is_none());
        assert!(lru.peek(&Key::from("cc")).is_some());
    }

    #[test]
    fn take_removes_and_frees_bytes() {
        let mut lru = UncachedLru::new(1024);
        lru.record_miss(&Key::from("k"), 7);
        let used = lru.used_bytes();
        let stats = lru.take(&Key::from("k")).unwrap();
        assert_eq!(stats.frequency, 1);
        assert!(lru.used_bytes() < used);
        assert!(lru.take(&Key::from("k")).is_none());
    }
}
