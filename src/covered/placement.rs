// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;

use super::victim::PeerVictimView;
use crate::message::Edgeset;
use crate::types::{EdgeId, Popularity};

/// Pick the subset of edges where admitting the object maximizes aggregated
/// benefit minus eviction cost, bounded by `topk` and by each edge's cache
/// margin.
///
/// Candidates are the edges that reported uncached popularity, scanned in
/// descending popularity order. An edge is chosen when the admission
/// benefit (its reported popularity) exceeds the cost of the evictions
/// needed to fit the object there, estimated from the victims the edge last
/// synced.
pub fn compute_best_placement(
    object_size: u64,
    per_edge_popularity: &HashMap<EdgeId, Popularity>,
    topk: usize,
    peer_view: impl Fn(EdgeId) -> PeerVictimView,
) -> Edgeset {
    let mut candidates: Vec<(EdgeId, Popularity)> = per_edge_popularity
        .iter()
        .map(|(&edge, &pop)| (edge, pop))
        .collect();
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut chosen = Edgeset::new();
    for (edge, benefit) in candidates {
        if chosen.len() >= topk {
            break;
        }
        if benefit <= 0.0 {
            continue;
        }
        let view = peer_view(edge);
        let Some(cost) = eviction_cost(object_size, &view) else {
            continue;
        };
        if benefit > cost {
            chosen.push(edge);
        }
    }
    chosen
}

/// Reward forfeited to make room on one edge, or `None` when the object
/// cannot fit even after evicting every synced victim. An unknown peer view
/// admits nothing.
fn eviction_cost(object_size: u64, view: &PeerVictimView) -> Option<f64> {
    if !view.known {
        return None;
    }
    if view.margin_bytes >= object_size {
        return Some(0.0);
    }
    let mut needed = object_size - view.margin_bytes;
    let mut cost = 0.0;
    // Victims arrive sorted by ascending reward; evict cheapest first.
    for victim in &view.victims {
        if needed == 0 {
            break;
        }
        cost += victim.reward;
        needed = needed.saturating_sub(victim.object_size);
    }
    (needed == 0).then_some(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::VictimEntry;
    use crate::types::Key;

    fn views(entries: Vec<(EdgeId, PeerVictimView)>) -> HashMap<EdgeId, PeerVictimView> {
        entries.into_iter().collect()
    }

    fn roomy() -> PeerVictimView {
        PeerVictimView {
            margin_bytes: 1 << 20,
            victims: vec![],
            known: true,
        }
    }

    #[test]
    fn picks_most_popular_edges_up_to_topk() {
        let pops: HashMap<EdgeId, Popularity> =
            [(0, 1.0), (1, 3.0), (2, 2.0)].into_iter().collect();
        let all = views(vec![(0, roomy()), (1, roomy()), (2, roomy())]);
        let chosen = compute_best_placement(100, &pops, 2, |e| all[&e].clone());
        assert_eq!(chosen.len(), 2);
        assert!(chosen.contains(&1));
        assert!(chosen.contains(&2));
    }

    #[test]
    fn skips_edges_with_unknown_state() {
        let pops: HashMap<EdgeId, Popularity> = [(0, 5.0)].into_iter().collect();
        let chosen = compute_best_placement(100, &pops, 4, |_| PeerVictimView::default());
        assert!(chosen.is_empty());
    }

    #[test]
    fn eviction_cost_gates_tight_edges() {
        let expensive = PeerVictimView {
            margin_bytes: 0,
            victims: vec![VictimEntry {
                key: Key::from("v"),
                reward: 100.0,
                object_size: 200,
            }],
            known: true,
        };
        let pops: HashMap<EdgeId, Popularity> = [(0, 1.0)].into_iter().collect();
        // Benefit 1.0 does not justify evicting a reward-100 victim.
        let chosen = compute_best_placement(150, &pops, 4, |_| expensive.clone());
        assert!(chosen.is_empty());

        // A hot enough key justifies it.
        let pops: HashMap<EdgeId, Popularity> = [(0, 500.0)].into_iter().collect();
        let chosen = compute_best_placement(150, &pops, 4, |_| expensive.clone());
        assert_eq!(chosen.as_slice(), &[0]);
    }

    #[test]
    fn object_that_cannot_fit_is_not_placed() {
        let view = PeerVictimView {
            margin_bytes: 10,
            victims: vec![VictimEntry {
                key: Key::from("v"),
                reward: 0.1,
                object_size: 20,
            }],
            known: true,
        };
        let pops: HashMap<EdgeId, Popularity> = [(0, 50.0)].into_iter().collect();
        let chosen = compute_best_placement(1000, &pops, 4, |_| view.clone());
        assert!(chosen.is_empty());
    }
}
