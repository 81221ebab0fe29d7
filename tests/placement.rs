// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! COVERED placement deployment over an in-process cluster.

mod common;

use std::time::Duration;

use common::{wait_for, Cluster};
use covered::config::CachePolicy;

#[test]
fn aggregated_popularity_drives_placement() {
    let cluster = Cluster::start_with(4, CachePolicy::Covered, |config| {
        // React to every report so the scenario converges quickly.
        config.covered.popularity_collection_change_ratio = 0.01;
        config.covered.topk_edgecnt = 3;
    });
    let mut client = cluster.client();
    let key = cluster.key_beaconed_at(0, "p");

    // Seed the origin through an edge write; COVERED takes no independent
    // admission on the write path.
    client.put(1, &key, "hot-object");
    for edge in &cluster.edges {
        assert!(!edge.cache.is_cached(&key));
    }

    // Misses from three edges report rising local-uncached popularity to
    // the beacon on every directory lookup.
    for round in 0..4 {
        for edge in 1..=3u32 {
            let (value, _) = client.get(edge, &key);
            assert_eq!(value.data(), b"hot-object", "round {round} edge {edge}");
        }
    }

    // The placement deployer admits the object at the computed edgeset and
    // each target publishes its directory entry at the beacon.
    assert!(
        wait_for(Duration::from_secs(5), || {
            let cachers = cluster.edges[0].cooperation.all_cachers(&key);
            cachers
                .iter()
                .any(|info| cluster.edges[info.edge as usize].cache.is_cached(&key))
        }),
        "no placement was deployed"
    );

    // Placed copies serve local hits with the pushed value.
    let cachers = cluster.edges[0].cooperation.all_cachers(&key);
    assert!(!cachers.is_empty());
    for info in &cachers {
        let edge = &cluster.edges[info.edge as usize];
        assert!(edge.cache.is_cached(&key), "edge {} listed but empty", info.edge);
    }

    cluster.shutdown();
}

#[test]
fn covered_takes_no_independent_admission() {
    let cluster = Cluster::start(2, CachePolicy::Covered);
    let mut client = cluster.client();
    let key = cluster.key_beaconed_at(0, "solo");

    client.put(0, &key, "value");
    // A single cold read does not admit by itself.
    let (value, _) = client.get(0, &key);
    assert_eq!(value.data(), b"value");
    assert!(!cluster.edges[0].cache.is_cached(&key));
    assert!(!cluster.edges[1].cache.is_cached(&key));

    cluster.shutdown();
}
