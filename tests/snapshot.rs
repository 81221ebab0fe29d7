// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Metadata snapshot persistence: the dump written by one instance restores
//! into an equivalent view, including through a file on disk.

use std::io::{Read, Write};

use rstest::rstest;

use covered::config::CachePolicy;
use covered::metadata::{CacheMetadata, CachedStats, RewardPolicy, StatsSeed, UncachedStats};
use covered::store::EdgeCache;
use covered::types::{Key, Value};

#[rstest]
#[case(1)]
#[case(4)]
#[case(64)]
fn cached_view_restores_identically(#[case] pergroup_max_keys: u32) {
    let policy = RewardPolicy;
    let mut meta: CacheMetadata<CachedStats> = CacheMetadata::new(pergroup_max_keys);
    for i in 0..20 {
        meta.add_for_new_key(
            Key::from(format!("k{i}").as_str()),
            64 * (i + 1),
            StatsSeed::default(),
            &policy,
        );
    }
    for i in (0..20).step_by(3) {
        meta.update_no_value_stats(&Key::from(format!("k{i}").as_str()), i % 2 == 0, true, &policy);
    }

    let restored: CacheMetadata<CachedStats> =
        CacheMetadata::load_snapshot(&meta.dump_snapshot(), pergroup_max_keys, &policy).unwrap();

    assert_eq!(restored.len(), meta.len());
    for i in 0..20 {
        let key = Key::from(format!("k{i}").as_str());
        assert_eq!(restored.stats(&key), meta.stats(&key));
    }
    // The eviction order carries over: drain both views in parallel.
    let mine = meta.least_reward_keys(20);
    let theirs = restored.least_reward_keys(20);
    assert_eq!(mine, theirs);
}

#[test]
fn snapshot_round_trips_through_disk() {
    let policy = RewardPolicy;
    let cache = EdgeCache::new(CachePolicy::Covered, 1 << 20, 8, 2, 1 << 16);
    for i in 0..5 {
        cache.admit(
            &Key::from(format!("k{i}").as_str()),
            Value::new(vec![0u8; 128]),
            true,
            false,
        );
    }
    let (cached_dump, uncached_dump) = cache.dump_metadata_snapshot();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metadata.snapshot");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&(cached_dump.len() as u64).to_be_bytes()).unwrap();
        file.write_all(&cached_dump).unwrap();
        file.write_all(&uncached_dump).unwrap();
    }

    let mut raw = Vec::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_end(&mut raw)
        .unwrap();
    let cached_len = u64::from_be_bytes(raw[..8].try_into().unwrap()) as usize;
    let cached: CacheMetadata<CachedStats> =
        CacheMetadata::load_snapshot(&raw[8..8 + cached_len], 8, &policy).unwrap();
    let uncached: CacheMetadata<UncachedStats> =
        CacheMetadata::load_snapshot(&raw[8 + cached_len..], 8, &policy).unwrap();

    assert_eq!(cached.len(), 5);
    assert_eq!(uncached.len(), 0);
    for i in 0..5 {
        assert!(cached.contains(&Key::from(format!("k{i}").as_str())));
    }
}
