// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! End-to-end coherence scenarios over an in-process cluster.

mod common;

use std::time::Duration;

use common::{wait_for, Cluster};
use covered::config::CachePolicy;
use covered::types::Hitflag;

#[test]
fn single_edge_hit() {
    let cluster = Cluster::start(1, CachePolicy::Lru);
    let mut client = cluster.client();
    let key = cluster.key_beaconed_at(0, "a");

    assert_eq!(client.put(0, &key, "1"), Hitflag::GlobalMiss);
    let (value, hitflag) = client.get(0, &key);
    assert_eq!(value.data(), b"1");
    assert_eq!(hitflag, Hitflag::LocalHit);

    // Write-through reached the origin exactly once; the hit never did.
    assert_eq!(cluster.origin_stats.puts(), 1);
    assert_eq!(cluster.origin_stats.gets(), 0);

    cluster.shutdown();
}

#[test]
fn cross_edge_redirection() {
    let cluster = Cluster::start(2, CachePolicy::Lru);
    let mut client = cluster.client();
    // Beaconed at edge 0, written at edge 1.
    let key = cluster.key_beaconed_at(0, "a");

    assert_eq!(client.put(1, &key, "v"), Hitflag::GlobalMiss);

    // The writer admitted locally and published the directory entry.
    assert!(wait_for(Duration::from_secs(2), || {
        cluster.edges[1].cache.is_cached(&key)
            && cluster.edges[0]
                .cooperation
                .all_cachers(&key)
                .iter()
                .any(|info| info.edge == 1 && info.valid)
    }));

    // A client at the beacon edge is redirected to the cacher.
    let (value, hitflag) = client.get(0, &key);
    assert_eq!(value.data(), b"v");
    assert_eq!(hitflag, Hitflag::CooperativeHit);

    cluster.shutdown();
}

#[test]
fn concurrent_writers_serialize() {
    let cluster = Cluster::start(2, CachePolicy::Lru);
    let key = cluster.key_beaconed_at(0, "w");

    // Seed a replica so writers must actually take the lock.
    let mut client = cluster.client();
    client.put(0, &key, "seed");
    let (_, _) = client.get(0, &key);

    let fleet = cluster.fleet.clone();
    let handles: Vec<_> = (0..2u32)
        .map(|writer| {
            let fleet = fleet.clone();
            let key = key.clone();
            std::thread::spawn(move || {
                let mut client = common::Client::connect(fleet);
                client.put(writer, &key, &format!("value-{writer}"));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // The origin holds whichever write finished second, and a subsequent
    // read observes exactly that value.
    let origin_value = cluster.origin.get(&key).expect("origin has the key");
    assert!(
        origin_value.data() == b"value-0" || origin_value.data() == b"value-1",
        "unexpected origin value {:?}",
        origin_value
    );
    let (read, _) = client.get(0, &key);
    assert_eq!(read.data(), origin_value.data());

    cluster.shutdown();
}

#[test]
fn invalidation_on_write() {
    let cluster = Cluster::start(3, CachePolicy::Lru);
    let mut client = cluster.client();
    let key = cluster.key_beaconed_at(0, "x");

    client.put(0, &key, "v1");
    // Cache the key at edges 0 and 1 (edge 1 via redirection + admission).
    client.get(0, &key);
    client.get(1, &key);
    assert!(wait_for(Duration::from_secs(2), || {
        cluster.edges[0].cache.is_cached(&key) && cluster.edges[1].cache.is_cached(&key)
    }));

    // A third edge overwrites; every replica must be invalidated.
    client.put(2, &key, "v2");

    // Neither old replica may serve the stale value again.
    for edge in [0u32, 1u32] {
        let (value, hitflag) = client.get(edge, &key);
        assert_eq!(
            value.data(),
            b"v2",
            "edge {edge} served stale data (hitflag {hitflag:?})"
        );
    }

    cluster.shutdown();
}

#[test]
fn delete_tombstones_propagate() {
    let cluster = Cluster::start(2, CachePolicy::Lru);
    let mut client = cluster.client();
    let key = cluster.key_beaconed_at(0, "d");

    client.put(0, &key, "v");
    client.get(0, &key);
    assert_eq!(client.del(1, &key), Hitflag::GlobalMiss);

    assert!(cluster.origin.get(&key).is_none());
    let (value, _) = client.get(0, &key);
    assert!(value.is_deleted(), "deleted key served a value");

    cluster.shutdown();
}

#[test]
fn round_trip_same_client() {
    let cluster = Cluster::start(2, CachePolicy::Lru);
    let mut client = cluster.client();
    let key = cluster.key_beaconed_at(1, "r");

    client.put(0, &key, "payload");
    let (value, _) = client.get(0, &key);
    assert_eq!(value.data(), b"payload");

    cluster.shutdown();
}
