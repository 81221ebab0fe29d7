// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;
use rand::seq::IteratorRandom;

use crate::config::DirectoryTieBreak;
use crate::types::{DirectoryInfo, EdgeId};

/// Cachers of one key, as known by its beacon. An entry exists only while at
/// least one cacher is listed.
#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    cachers: HashMap<EdgeId, bool>,
}

impl DirEntry {
    /// Bytes charged per listed cacher.
    pub const PER_CACHER_SIZE: u64 = 4 + 1;

    pub fn admit(&mut self, edge: EdgeId) {
        self.cachers.insert(edge, true);
    }

    /// Returns true when the entry became empty and should be destroyed.
    pub fn evict(&mut self, edge: EdgeId) -> bool {
        self.cachers.remove(&edge);
        self.cachers.is_empty()
    }

    pub fn contains(&self, edge: EdgeId) -> bool {
        self.cachers.contains_key(&edge)
    }

    pub fn is_empty(&self) -> bool {
        self.cachers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cachers.len()
    }

    /// Mark every listed copy invalid; a writer is about to mutate the key.
    pub fn invalidate_all(&mut self) {
        for valid in self.cachers.values_mut() {
            *valid = false;
        }
    }

    /// Re-validate one cacher (the writer after its write-back).
    pub fn validate(&mut self, edge: EdgeId) -> bool {
        match self.cachers.get_mut(&edge) {
            Some(valid) => {
                *valid = true;
                true
            }
            None => false,
        }
    }

    pub fn all(&self) -> Vec<DirectoryInfo> {
        self.cachers
            .iter()
            .map(|(&edge, &valid)| DirectoryInfo { edge, valid })
            .collect()
    }

    /// Pick one *valid* cacher other than the requester, per the configured
    /// tie-break.
    pub fn pick_valid(
        &self,
        exclude: EdgeId,
        tiebreak: DirectoryTieBreak,
    ) -> Option<DirectoryInfo> {
        let candidates = self
            .cachers
            .iter()
            .filter(|(&edge, &valid)| valid && edge != exclude)
            .map(|(&edge, _)| edge);
        let chosen = match tiebreak {
            DirectoryTieBreak::Random => candidates.choose(&mut rand::thread_rng()),
            DirectoryTieBreak::LowestId => candidates.min(),
        }?;
        Some(DirectoryInfo::new(chosen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_valid_skips_invalid_and_requester() {
        let mut entry = DirEntry::default();
        entry.admit(0);
        entry.admit(1);
        entry.admit(2);
        entry.invalidate_all();
        entry.validate(1);
        entry.validate(2);

        // Requester 1 can only be sent to edge 2.
        let info = entry.pick_valid(1, DirectoryTieBreak::LowestId).unwrap();
        assert_eq!(info.edge, 2);
        // Edge 0 is listed but invalid, so with both others excluded there
        // is no valid target.
        entry.evict(2);
        assert!(entry.pick_valid(1, DirectoryTieBreak::LowestId).is_none());
    }

    #[test]
    fn entry_empties_after_last_evict() {
        let mut entry = DirEntry::default();
        entry.admit(3);
        assert!(!entry.evict(7));
        assert!(entry.evict(3));
    }
}
