// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;
use parking_lot::Mutex;

use crate::message::{VictimEntry, VictimSyncset};
use crate::types::EdgeId;

/// What one peer last advertised: its lowest-reward keys and free margin.
#[derive(Debug, Clone, Default)]
pub struct PeerVictimView {
    pub margin_bytes: u64,
    pub victims: Vec<VictimEntry>,
    pub known: bool,
}

/// Tracks the lowest-reward keys of this edge (to advertise) and of every
/// peer (as synced). Peer views are replaced wholesale by each syncset;
/// consistency across the fleet is eventual.
#[derive(Debug, Default)]
pub struct VictimTracker {
    peers: Mutex<HashMap<EdgeId, PeerVictimView>>,
    last_synced: Mutex<Option<Vec<VictimEntry>>>,
}

impl VictimTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce a syncset when the local lowest-reward key set changed since
    /// the last sync; piggybacked on the next outgoing control message. The
    /// very first call always syncs so peers learn this edge's margin.
    pub fn sync_local(
        &self,
        edge: EdgeId,
        current: Vec<VictimEntry>,
        margin_bytes: u64,
    ) -> Option<VictimSyncset> {
        let mut last = self.last_synced.lock();
        if let Some(last) = last.as_ref() {
            let unchanged = last.len() == current.len()
                && last
                    .iter()
                    .zip(current.iter())
                    .all(|(a, b)| a.key == b.key);
            if unchanged {
                return None;
            }
        }
        *last = Some(current.clone());
        Some(VictimSyncset {
            edge,
            margin_bytes,
            victims: current,
        })
    }

    pub fn apply_peer(&self, syncset: &VictimSyncset) {
        let mut peers = self.peers.lock();
        peers.insert(
            syncset.edge,
            PeerVictimView {
                margin_bytes: syncset.margin_bytes,
                victims: syncset.victims.clone(),
                known: true,
            },
        );
    }

    pub fn peer_view(&self, edge: EdgeId) -> PeerVictimView {
        self.peers.lock().get(&edge).cloned().unwrap_or_default()
    }

    pub fn known_peers(&self) -> Vec<EdgeId> {
        self.peers.lock().keys().copied().collect()
    }
}
