// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The COVERED manager: victim tracking, beacon-side popularity
//! aggregation, and placement calculation. Victim and popularity summaries
//! travel piggybacked on the existing directory/MSI traffic; nothing here
//! issues its own control round-trips. Placement deployment jobs are handed
//! to the edge's background pipeline.

mod placement;
mod popularity;
mod victim;

pub use placement::compute_best_placement;
pub use popularity::PopularityAggregator;
pub use victim::{PeerVictimView, VictimTracker};

use crate::config::CoveredConfig;
use crate::message::{CollectedPopularity, Edgeset, VictimSyncset};
use crate::store::EdgeCache;
use crate::types::{EdgeId, Key};

/// Work items for the background placement/metadata pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum BackgroundJob {
    /// Fetch the value of `key` (cacher or origin) and admit it on every
    /// edge of the set.
    Placement { key: Key, edgeset: Edgeset },
    /// Tell a cacher whether some neighbor also holds the key, flipping its
    /// last-copy eviction cost.
    MetadataUpdate {
        key: Key,
        edge: EdgeId,
        is_neighbor_cached: bool,
    },
}

pub struct CoveredManager {
    edge_id: EdgeId,
    victims: VictimTracker,
    aggregator: PopularityAggregator,
    synced_victimcnt: usize,
    topk_edgecnt: usize,
}

impl CoveredManager {
    pub fn new(edge_id: EdgeId, cfg: &CoveredConfig) -> Self {
        CoveredManager {
            edge_id,
            victims: VictimTracker::new(),
            aggregator: PopularityAggregator::new(
                cfg.popularity_aggregation_max_bytes,
                cfg.popularity_collection_change_ratio,
            ),
            synced_victimcnt: cfg.peredge_synced_victimcnt as usize,
            topk_edgecnt: cfg.topk_edgecnt as usize,
        }
    }

    /// Victim syncset for the next outgoing control message, or `None` when
    /// the lowest-reward set has not changed since the last sync.
    pub fn local_victim_syncset(&self, cache: &EdgeCache) -> Option<VictimSyncset> {
        let current = cache.local_victims(self.synced_victimcnt);
        self.victims
            .sync_local(self.edge_id, current, cache.margin_bytes())
    }

    /// Fold a peer's piggybacked victim syncset into the neighbor view.
    /// Always applied before popularity aggregation so placement sees the
    /// latest synced victims.
    pub fn apply_victim_syncset(&self, syncset: &VictimSyncset) {
        self.victims.apply_peer(syncset);
    }

    /// Fold one reported popularity and, when asked, recompute the best
    /// placement for the key. Returns a non-empty edgeset when a placement
    /// should be deployed.
    pub fn fold_popularity(
        &self,
        key: &Key,
        source: EdgeId,
        collected: CollectedPopularity,
        is_source_cached: bool,
        want_placement: bool,
    ) -> Option<Edgeset> {
        let changed = self
            .aggregator
            .fold(key, source, collected, is_source_cached);
        if !want_placement || !changed {
            return None;
        }
        let per_edge = self.aggregator.popularity_of(key);
        if per_edge.is_empty() {
            return None;
        }
        let edgeset = compute_best_placement(
            collected.object_size,
            &per_edge,
            self.topk_edgecnt,
            |edge| self.victims.peer_view(edge),
        );
        (!edgeset.is_empty()).then_some(edgeset)
    }

    /// Drop the aggregate a source reported once the key is admitted there.
    pub fn clear_after_admission(&self, key: &Key, source: EdgeId) {
        self.aggregator.clear_source(key, source);
    }

    pub fn victims(&self) -> &VictimTracker {
        &self.victims
    }

    pub fn aggregator(&self) -> &PopularityAggregator {
        &self.aggregator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePolicy;
    use crate::types::Value;

    fn manager() -> CoveredManager {
        let cfg = CoveredConfig {
            popularity_collection_change_ratio: 0.01,
            ..Default::default()
        };
        CoveredManager::new(0, &cfg)
    }

    fn cache() -> EdgeCache {
        EdgeCache::new(CachePolicy::Covered, 1 << 20, 8, 4, 1 << 16)
    }

    #[test]
    fn victim_syncset_only_on_change() {
        let manager = manager();
        let cache = cache();
        cache.admit(&Key::from("a"), Value::new(vec![0u8; 64]), true, false);
        let first = manager.local_victim_syncset(&cache);
        assert!(first.is_some());
        // Nothing changed: no new syncset.
        assert!(manager.local_victim_syncset(&cache).is_none());
        cache.admit(&Key::from("b"), Value::new(vec![0u8; 64]), true, false);
        assert!(manager.local_victim_syncset(&cache).is_some());
    }

    #[test]
    fn placement_triggers_once_popularity_accumulates() {
        let manager = manager();
        let key = Key::from("p");

        // Peers advertise free margin so placement is feasible.
        for edge in 1..=3 {
            manager.apply_victim_syncset(&VictimSyncset {
                edge,
                margin_bytes: 1 << 20,
                victims: vec![],
            });
        }

        let mut result = None;
        for edge in 1..=3 {
            result = manager.fold_popularity(
                &key,
                edge,
                CollectedPopularity::tracked_sized(edge as f64, 128),
                false,
                true,
            );
        }
        let edgeset = result.expect("placement after enough popularity");
        assert!(!edgeset.is_empty());
        // The most popular source is chosen first.
        assert!(edgeset.contains(&3));
    }

    #[test]
    fn untracked_report_clears_the_source() {
        let manager = manager();
        let key = Key::from("p");
        manager.fold_popularity(&key, 1, CollectedPopularity::tracked(5.0), false, false);
        assert_eq!(manager.aggregator().popularity_of(&key).len(), 1);
        manager.fold_popularity(&key, 1, CollectedPopularity::untracked(), false, false);
        assert!(manager.aggregator().popularity_of(&key).is_empty());
    }
}
