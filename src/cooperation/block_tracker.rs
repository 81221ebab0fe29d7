// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashSet;

use crate::net::NetworkAddr;
use crate::types::EdgeId;

/// Per-key MSI coherence state at the beacon: a write flag plus the set of
/// edges suspended until the writer releases. State exists only while a
/// write is in flight or waiters remain.
#[derive(Debug, Clone)]
pub struct MsiState {
    pub writer: EdgeId,
    blocked: HashSet<NetworkAddr>,
}

impl MsiState {
    pub fn new(writer: EdgeId) -> Self {
        MsiState {
            writer,
            blocked: HashSet::default(),
        }
    }

    /// Suspend an edge until the write finishes. The block set is a set:
    /// repeated blocks from the same address are deduplicated, guaranteeing
    /// one blocked entry per edge at a time.
    pub fn block(&mut self, addr: NetworkAddr) {
        self.blocked.insert(addr);
    }

    /// Atomically finish the write and hand back everyone to wake.
    pub fn unblock_all_and_finish(self) -> HashSet<NetworkAddr> {
        self.blocked
    }

    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Bytes charged to capacity for this state.
    pub fn size_for_capacity(&self) -> u64 {
        1 + self.blocked.len() as u64 * 6
    }
}
