// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::num::NonZeroUsize;

use ahash::HashMap;
use lru::LruCache;
use nonzero_ext::nonzero;
use parking_lot::Mutex;

use crate::message::CollectedPopularity;
use crate::types::{EdgeId, Key, Popularity};

/// Rough bytes per aggregated key, used to turn the configured byte bound
/// into an entry bound.
const EST_ENTRY_BYTES: u64 = 64;

/// Beacon-side aggregate of per-edge local-uncached popularity for keys
/// this node beacons. Memory-bounded: least-recently-updated keys fall out
/// first. Aggregation is eventually consistent by design.
pub struct PopularityAggregator {
    entries: Mutex<LruCache<Key, HashMap<EdgeId, Popularity>>>,
    change_ratio: f64,
}

impl PopularityAggregator {
    pub fn new(max_bytes: u64, change_ratio: f64) -> Self {
        let cap = NonZeroUsize::new((max_bytes / EST_ENTRY_BYTES) as usize)
            .unwrap_or(nonzero!(1usize));
        PopularityAggregator {
            entries: Mutex::new(LruCache::new(cap)),
            change_ratio,
        }
    }

    /// Fold one report. Returns whether the aggregate changed enough to be
    /// worth a placement recalculation (the change-ratio throttle).
    pub fn fold(
        &self,
        key: &Key,
        source: EdgeId,
        collected: CollectedPopularity,
        is_source_cached: bool,
    ) -> bool {
        let mut entries = self.entries.lock();
        if !collected.is_tracked || is_source_cached {
            // The source no longer tracks this key as uncached; drop any
            // stale aggregate it reported earlier.
            if let Some(per_edge) = entries.get_mut(key) {
                per_edge.remove(&source);
                if per_edge.is_empty() {
                    entries.pop(key);
                }
            }
            return false;
        }
        if !entries.contains(key) {
            entries.put(key.clone(), HashMap::default());
        }
        let per_edge = entries.get_mut(key).expect("entry present");
        let old = per_edge.insert(source, collected.popularity);
        match old {
            None => true,
            Some(old) => {
                let base = old.abs().max(f64::EPSILON);
                (collected.popularity - old).abs() / base >= self.change_ratio
            }
        }
    }

    /// Current per-edge aggregate for a key.
    pub fn popularity_of(&self, key: &Key) -> HashMap<EdgeId, Popularity> {
        self.entries
            .lock()
            .peek(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_source(&self, key: &Key, source: EdgeId) {
        let mut entries = self.entries.lock();
        if let Some(per_edge) = entries.get_mut(key) {
            per_edge.remove(&source);
            if per_edge.is_empty() {
                entries.pop(key);
            }
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}
