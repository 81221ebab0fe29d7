// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Local edge cache: the in-memory slot store (value + validity bit) plus
//! the metadata views driving admission and eviction.
//!
//! Lock order is store → metadata; workers take the store lock for writes
//! only when mutating slots. Per-key serialization is provided above this
//! layer by hashing keys to cache-server workers.

use parking_lot::RwLock;

use ahash::HashMap;

use crate::config::CachePolicy;
use crate::message::{CollectedPopularity, VictimEntry};
use crate::metadata::{
    CacheMetadata, CachedStats, KeyLevelStats, RewardPolicy, StatsSeed, UncachedLru, UncachedStats,
};
use crate::types::{Key, Value};

/// Result of a cache probe.
#[derive(Debug, Clone, PartialEq)]
pub enum GetResult {
    /// Present and valid.
    Hit(Value),
    /// Present but invalidated by a remote write.
    Invalid,
    Miss,
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    valid: bool,
}

#[derive(Debug, Default)]
struct StoreInner {
    slots: HashMap<Key, Slot>,
    data_bytes: u64,
}

impl StoreInner {
    fn charge(key: &Key, value: &Value) -> u64 {
        key.len() as u64 + value.size()
    }
}

struct MetaInner {
    cached: CacheMetadata<CachedStats>,
    uncached: CacheMetadata<UncachedStats>,
    miss_lru: UncachedLru,
}

/// The local edge cache with its policy state.
pub struct EdgeCache {
    policy: CachePolicy,
    reward_policy: RewardPolicy,
    capacity_bytes: u64,
    synced_victimcnt: usize,
    local_uncached_max_bytes: u64,
    store: RwLock<StoreInner>,
    meta: RwLock<MetaInner>,
}

impl EdgeCache {
    pub fn new(
        policy: CachePolicy,
        capacity_bytes: u64,
        pergroup_max_keys: u32,
        synced_victimcnt: usize,
        local_uncached_max_bytes: u64,
    ) -> Self {
        EdgeCache {
            policy,
            reward_policy: RewardPolicy,
            capacity_bytes,
            synced_victimcnt,
            local_uncached_max_bytes,
            store: RwLock::new(StoreInner::default()),
            meta: RwLock::new(MetaInner {
                cached: CacheMetadata::new(pergroup_max_keys),
                uncached: CacheMetadata::new(pergroup_max_keys),
                miss_lru: UncachedLru::new(local_uncached_max_bytes),
            }),
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Probe for a local request and account the access.
    pub fn get_local(&self, key: &Key) -> GetResult {
        let result = self.probe(key);
        if matches!(result, GetResult::Hit(_) | GetResult::Invalid) {
            let mut meta = self.meta.write();
            meta.cached
                .update_no_value_stats(key, false, true, &self.reward_policy);
        }
        result
    }

    /// Probe for a peer-redirected request and account the access.
    pub fn get_redirected(&self, key: &Key) -> GetResult {
        let result = self.probe(key);
        if matches!(result, GetResult::Hit(_) | GetResult::Invalid) {
            let mut meta = self.meta.write();
            meta.cached
                .update_no_value_stats(key, true, true, &self.reward_policy);
        }
        result
    }

    /// Probe without touching access statistics (background pipelines).
    pub fn peek(&self, key: &Key) -> GetResult {
        self.probe(key)
    }

    fn probe(&self, key: &Key) -> GetResult {
        let store = self.store.read();
        match store.slots.get(key) {
            Some(slot) if slot.valid => GetResult::Hit(slot.value.clone()),
            Some(_) => GetResult::Invalid,
            None => GetResult::Miss,
        }
    }

    pub fn is_cached(&self, key: &Key) -> bool {
        self.store.read().slots.contains_key(key)
    }

    pub fn is_valid(&self, key: &Key) -> Option<bool> {
        self.store.read().slots.get(key).map(|slot| slot.valid)
    }

    /// Insert a new entry; rejected when already present. Returns whether
    /// the admission changed the set of lowest-reward eviction candidates.
    pub fn admit(&self, key: &Key, value: Value, is_valid: bool, is_neighbor_cached: bool) -> bool {
        {
            let mut store = self.store.write();
            if store.slots.contains_key(key) {
                return false;
            }
            store.data_bytes += StoreInner::charge(key, &value);
            store.slots.insert(
                key.clone(),
                Slot {
                    value: value.clone(),
                    valid: is_valid,
                },
            );
        }
        let mut meta = self.meta.write();
        // A key moving into the store stops being tracked as uncached.
        if meta.uncached.contains(key) {
            let size = meta.uncached.approx_object_size(key).unwrap_or(0);
            meta.uncached.remove_for_existing_key(key, size);
        }
        meta.miss_lru.take(key);
        meta.cached.add_for_new_key(
            key.clone(),
            value.size(),
            StatsSeed {
                is_neighbor_cached,
                ..Default::default()
            },
            &self.reward_policy,
        );
        meta.cached
            .is_within_least_reward_rank(key, self.synced_victimcnt)
    }

    /// Replace the value and mark valid; no-op when absent (write-through
    /// without admission).
    pub fn update(&self, key: &Key, value: Value) -> bool {
        let new_size = value.size();
        let old_size = {
            let mut store = self.store.write();
            let Some(slot) = store.slots.get_mut(key) else {
                return false;
            };
            let old_size = slot.value.size();
            slot.value = value;
            slot.valid = true;
            store.data_bytes = (store.data_bytes + new_size).saturating_sub(old_size);
            old_size
        };
        let mut meta = self.meta.write();
        meta.cached
            .update_value_stats(key, new_size, old_size, &self.reward_policy);
        true
    }

    /// Replace the value with a tombstone. The slot keeps occupying a lookup
    /// position until a later admission or eviction overwrites it.
    pub fn remove(&self, key: &Key) -> bool {
        self.update(key, Value::deleted())
    }

    /// Mark an entry invalid, keeping the slot. Idempotent.
    pub fn invalidate(&self, key: &Key) -> bool {
        let mut store = self.store.write();
        match store.slots.get_mut(key) {
            Some(slot) => {
                slot.valid = false;
                true
            }
            None => false,
        }
    }

    /// Refresh an invalid entry with a fetched value (get-response path).
    pub fn update_if_invalid_for_getrsp(&self, key: &Key, value: Value) -> bool {
        if self.is_valid(key) != Some(false) {
            return false;
        }
        self.update(key, value)
    }

    /// Drop an entry iff present and already invalid (deleted upstream).
    pub fn remove_if_invalid_for_getrsp(&self, key: &Key) -> bool {
        {
            let mut store = self.store.write();
            let charge = match store.slots.get(key) {
                Some(slot) if !slot.valid => StoreInner::charge(key, &slot.value),
                _ => return false,
            };
            store.slots.remove(key);
            store.data_bytes = store.data_bytes.saturating_sub(charge);
        }
        let mut meta = self.meta.write();
        if meta.cached.contains(key) {
            let size = meta.cached.approx_object_size(key).unwrap_or(0);
            meta.cached.remove_for_existing_key(key, size);
        }
        true
    }

    /// Pop victims (reward order for COVERED, recency order for the LRU
    /// baseline) until at least `required_bytes` are freed or the store is
    /// empty.
    pub fn evict(&self, required_bytes: u64) -> Vec<(Key, Value)> {
        let mut victims = Vec::new();
        let mut freed = 0u64;
        while freed < required_bytes {
            let Some((key, value)) = self.pop_victim() else {
                break;
            };
            freed += key.len() as u64 + value.size();
            victims.push((key, value));
        }
        victims
    }

    /// Evict until the capacity invariant holds again. Returns the victims;
    /// the caller must send a directory-update remove for each one.
    pub fn evict_until_fits(&self) -> Vec<(Key, Value)> {
        let mut victims = Vec::new();
        while self.used_bytes() > self.capacity_bytes {
            let Some(victim) = self.pop_victim() else {
                break;
            };
            victims.push(victim);
        }
        victims
    }

    fn pop_victim(&self) -> Option<(Key, Value)> {
        let victim_key = {
            let meta = self.meta.read();
            match self.policy {
                CachePolicy::Covered => meta.cached.least_reward(0).map(|(key, _)| key),
                CachePolicy::Lru => meta.cached.lru_victim().cloned(),
            }
        }?;
        let value = {
            let mut store = self.store.write();
            let slot = store.slots.remove(&victim_key)?;
            let charge = StoreInner::charge(&victim_key, &slot.value);
            store.data_bytes = store.data_bytes.saturating_sub(charge);
            slot.value
        };
        let mut meta = self.meta.write();
        meta.cached
            .remove_for_existing_key(&victim_key, value.size());
        Some((victim_key, value))
    }

    /// Bytes charged to capacity: slot data plus every metadata view.
    pub fn used_bytes(&self) -> u64 {
        let store = self.store.read();
        let meta = self.meta.read();
        store.data_bytes
            + meta.cached.size_for_capacity(false)
            + meta.uncached.size_for_capacity(true)
            + meta.miss_lru.used_bytes()
    }

    pub fn margin_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes())
    }

    /// Whether the baseline policy admits on miss. COVERED never makes an
    /// independent admission decision; placement comes from the beacon.
    pub fn need_independent_admit(&self, _key: &Key) -> bool {
        matches!(self.policy, CachePolicy::Lru)
    }

    /// Record a local miss for an uncached key.
    pub fn track_miss(&self, key: &Key, is_global_cached: bool) {
        if self.is_cached(key) {
            return;
        }
        let mut meta = self.meta.write();
        if meta.uncached.contains(key) {
            meta.uncached
                .update_no_value_stats(key, false, is_global_cached, &self.reward_policy);
        } else {
            meta.miss_lru.record_miss(key, 0);
        }
    }

    /// Fold the fetched value of a miss into the uncached view, promoting
    /// the key from the miss LRU on first sight of its size.
    pub fn note_getrsp_value(&self, key: &Key, value: &Value, is_global_cached: bool) {
        if self.is_cached(key) {
            return;
        }
        let mut meta = self.meta.write();
        if meta.uncached.contains(key) {
            let old = meta.uncached.approx_object_size(key).unwrap_or(0);
            meta.uncached
                .update_value_stats(key, value.size(), old, &self.reward_policy);
            meta.uncached
                .update_stats_with(key, &self.reward_policy, |s| {
                    s.is_global_cached = is_global_cached;
                });
        } else {
            let seeded = meta.miss_lru.take(key);
            meta.uncached.add_for_new_key(
                key.clone(),
                value.size(),
                StatsSeed {
                    is_global_cached,
                    ..Default::default()
                },
                &self.reward_policy,
            );
            if let Some(stats) = seeded {
                // Replay the misses observed while the key sat in the side
                // LRU so the tracked popularity starts warm.
                meta.uncached
                    .update_stats_with(key, &self.reward_policy, |s| {
                        s.local_frequency = s.local_frequency.max(stats.frequency);
                    });
            }
        }
        // Tracking uncached keys must not itself exceed its memory bound.
        while meta.uncached.size_for_capacity(true) > self.local_uncached_max_bytes {
            let Some((victim, _)) = meta.uncached.least_reward(0) else {
                break;
            };
            let size = meta.uncached.approx_object_size(&victim).unwrap_or(0);
            meta.uncached.remove_for_existing_key(&victim, size);
        }
    }

    /// Popularity summary piggybacked on control messages to the beacon.
    pub fn collected_popularity(&self, key: &Key) -> CollectedPopularity {
        let meta = self.meta.read();
        match meta.uncached.stats(key) {
            Some(stats) => {
                let size = meta.uncached.approx_object_size(key).unwrap_or(0);
                CollectedPopularity::tracked_sized(stats.local_popularity, size)
            }
            None => CollectedPopularity::untracked(),
        }
    }

    /// The current lowest-reward cached keys, for victim synchronization.
    pub fn local_victims(&self, n: usize) -> Vec<VictimEntry> {
        let meta = self.meta.read();
        meta.cached
            .least_reward_keys(n)
            .into_iter()
            .map(|(key, reward)| {
                let object_size = meta.cached.approx_object_size(&key).unwrap_or(0);
                VictimEntry {
                    key,
                    reward,
                    object_size,
                }
            })
            .collect()
    }

    /// Flip the neighbor-cached bit that feeds the last-copy eviction cost.
    pub fn set_neighbor_cached(&self, key: &Key, is_neighbor_cached: bool) -> bool {
        let mut meta = self.meta.write();
        meta.cached
            .update_stats_with(key, &self.reward_policy, |s| {
                s.is_neighbor_cached = is_neighbor_cached;
            })
    }

    pub fn synced_victimcnt(&self) -> usize {
        self.synced_victimcnt
    }

    /// Snapshot both metadata views for on-disk persistence.
    pub fn dump_metadata_snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        let meta = self.meta.read();
        (meta.cached.dump_snapshot(), meta.uncached.dump_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(policy: CachePolicy, capacity: u64) -> EdgeCache {
        EdgeCache::new(policy, capacity, 8, 2, 1 << 16)
    }

    #[test]
    fn admit_then_get_hits() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        let key = Key::from("a");
        assert!(cache.admit(&key, Value::new("1"), true, false));
        assert_eq!(cache.get_local(&key), GetResult::Hit(Value::new("1")));
        // Double admission is rejected.
        assert!(!cache.admit(&key, Value::new("2"), true, false));
    }

    #[test]
    fn invalidate_keeps_slot_and_is_idempotent() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        let key = Key::from("x");
        cache.admit(&key, Value::new("v"), true, false);
        assert!(cache.invalidate(&key));
        assert_eq!(cache.get_local(&key), GetResult::Invalid);
        // Second invalidation leaves the same state.
        assert!(cache.invalidate(&key));
        assert_eq!(cache.get_local(&key), GetResult::Invalid);
    }

    #[test]
    fn invalid_entry_refreshes_to_valid() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        let key = Key::from("x");
        cache.admit(&key, Value::new("old"), true, false);
        cache.invalidate(&key);
        assert!(cache.update_if_invalid_for_getrsp(&key, Value::new("new")));
        assert_eq!(cache.get_local(&key), GetResult::Hit(Value::new("new")));
        // Not applicable when already valid.
        assert!(!cache.update_if_invalid_for_getrsp(&key, Value::new("x")));
    }

    #[test]
    fn remove_if_invalid_drops_only_invalid_slots() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        let key = Key::from("gone");
        cache.admit(&key, Value::new("v"), true, false);
        assert!(!cache.remove_if_invalid_for_getrsp(&key));
        cache.invalidate(&key);
        assert!(cache.remove_if_invalid_for_getrsp(&key));
        assert_eq!(cache.get_local(&key), GetResult::Miss);
    }

    #[test]
    fn del_leaves_tombstone_occupying_slot() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        let key = Key::from("d");
        cache.admit(&key, Value::new("v"), true, false);
        assert!(cache.remove(&key));
        match cache.get_local(&key) {
            GetResult::Hit(value) => assert!(value.is_deleted()),
            other => panic!("expected tombstone hit, got {other:?}"),
        }
    }

    #[test]
    fn eviction_frees_required_bytes_lowest_reward_first() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        cache.admit(&Key::from("cold"), Value::new(vec![0u8; 100]), true, false);
        cache.admit(&Key::from("hot"), Value::new(vec![0u8; 100]), true, false);
        for _ in 0..5 {
            cache.get_local(&Key::from("hot"));
        }
        let victims = cache.evict(50);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].0, Key::from("cold"));
        assert!(cache.is_cached(&Key::from("hot")));
    }

    #[test]
    fn capacity_invariant_restored_by_eviction() {
        let cache = cache(CachePolicy::Lru, 4096);
        for i in 0..8 {
            cache.admit(
                &Key::from(format!("k{i}").as_str()),
                Value::new(vec![0u8; 1024]),
                true,
                false,
            );
            cache.evict_until_fits();
        }
        assert!(cache.used_bytes() <= cache.capacity_bytes());
    }

    #[test]
    fn lru_baseline_evicts_least_recently_used() {
        let cache = cache(CachePolicy::Lru, 1 << 20);
        cache.admit(&Key::from("a"), Value::new(vec![0u8; 10]), true, false);
        cache.admit(&Key::from("b"), Value::new(vec![0u8; 10]), true, false);
        cache.get_local(&Key::from("a"));
        let victims = cache.evict(1);
        assert_eq!(victims[0].0, Key::from("b"));
    }

    #[test]
    fn miss_tracking_promotes_on_getrsp() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        let key = Key::from("m");
        cache.track_miss(&key, false);
        assert!(!cache.collected_popularity(&key).is_tracked);
        cache.note_getrsp_value(&key, &Value::new(vec![0u8; 64]), false);
        let cp = cache.collected_popularity(&key);
        assert!(cp.is_tracked);
        assert!(cp.popularity > 0.0);
        // Admission detracks the uncached view.
        cache.admit(&key, Value::new(vec![0u8; 64]), true, false);
        assert!(!cache.collected_popularity(&key).is_tracked);
    }

    #[test]
    fn victim_set_reports_lowest_rewards() {
        let cache = cache(CachePolicy::Covered, 1 << 20);
        cache.admit(&Key::from("a"), Value::new(vec![0u8; 100]), true, false);
        cache.admit(&Key::from("b"), Value::new(vec![0u8; 100]), true, false);
        cache.get_local(&Key::from("b"));
        let victims = cache.local_victims(1);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, Key::from("a"));
    }
}
