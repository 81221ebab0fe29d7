// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Property-style checks over the metadata and store invariants.

use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;

use covered::config::CachePolicy;
use covered::metadata::{CacheMetadata, CachedStats, RewardPolicy, StatsSeed};
use covered::store::EdgeCache;
use covered::types::{Key, Value};

#[derive(Debug, Clone, Copy)]
enum Op {
    Add(u8, u16),
    Touch(u8),
    Remove(u8),
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 4 {
            0 => Op::Add(u8::arbitrary(g) % 16, u16::arbitrary(g) % 1024 + 1),
            1 | 2 => Op::Touch(u8::arbitrary(g) % 16),
            _ => Op::Remove(u8::arbitrary(g) % 16),
        }
    }
}

fn key_of(id: u8) -> Key {
    Key::from(format!("key-{id}").as_str())
}

/// Frequency never decreases under touches, and with a constant object
/// size neither does popularity.
#[quickcheck]
fn popularity_monotone_under_touches(touches: u8) -> bool {
    let policy = RewardPolicy;
    let mut meta: CacheMetadata<CachedStats> = CacheMetadata::new(8);
    let key = Key::from("fixed");
    meta.add_for_new_key(key.clone(), 256, StatsSeed::default(), &policy);

    let mut last = meta.stats(&key).unwrap().local_popularity;
    for _ in 0..touches {
        meta.update_no_value_stats(&key, false, true, &policy);
        let now = meta.stats(&key).unwrap().local_popularity;
        if now < last {
            return false;
        }
        last = now;
    }
    true
}

/// The three cross-linked structures stay consistent under arbitrary
/// operation sequences: every tracked key has a reward, the lowest-reward
/// probe always names a tracked key, and removal leaves no residue.
#[quickcheck]
fn metadata_structures_stay_linked(ops: Vec<Op>) -> bool {
    let policy = RewardPolicy;
    let mut meta: CacheMetadata<CachedStats> = CacheMetadata::new(4);
    for op in ops {
        match op {
            Op::Add(id, size) => {
                let key = key_of(id);
                if !meta.contains(&key) {
                    meta.add_for_new_key(key, size as u64, StatsSeed::default(), &policy);
                }
            }
            Op::Touch(id) => {
                meta.update_no_value_stats(&key_of(id), false, true, &policy);
            }
            Op::Remove(id) => {
                let key = key_of(id);
                if meta.contains(&key) {
                    let size = meta.approx_object_size(&key).unwrap_or(0);
                    meta.remove_for_existing_key(&key, size);
                }
            }
        }
        if let Some((victim, _)) = meta.least_reward(0) {
            if !meta.contains(&victim) {
                return false;
            }
        } else if meta.len() != 0 {
            return false;
        }
    }
    true
}

/// Two consecutive invalidations leave the same state as one.
#[quickcheck]
fn invalidate_is_idempotent(payload: Vec<u8>) -> bool {
    let cache = EdgeCache::new(CachePolicy::Covered, 1 << 20, 8, 2, 1 << 16);
    let key = Key::from("k");
    cache.admit(&key, Value::new(payload), true, false);

    cache.invalidate(&key);
    let once = (cache.is_valid(&key), cache.used_bytes());
    cache.invalidate(&key);
    let twice = (cache.is_valid(&key), cache.used_bytes());
    once == twice && once.0 == Some(false)
}
