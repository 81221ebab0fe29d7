// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Beacon-local cooperation state: the content directory (which edges cache
//! a key) and the MSI block tracker (who is writing it, who is suspended).
//!
//! Both structures are sharded into stripes keyed by `hash(key) mod
//! stripe_count`; a stripe's mutex serializes every directory and MSI
//! mutation for its keys, so the two views never disagree about a key.

mod block_tracker;
mod directory;

pub use block_tracker::MsiState;
pub use directory::DirEntry;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use ahash::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::warn;

use crate::config::DirectoryTieBreak;
use crate::net::NetworkAddr;
use crate::types::{DirectoryInfo, EdgeId, Key, LockResult};

const STRIPE_COUNT: usize = 128;

#[derive(Debug, Default)]
struct Stripe {
    directory: HashMap<Key, DirEntry>,
    msi: HashMap<Key, MsiState>,
}

/// Directory lookup result handed back to a cache server.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupOutcome {
    pub being_written: bool,
    pub dirinfo: Option<DirectoryInfo>,
    /// Whether any edge (valid or not) is listed as a cacher.
    pub is_global_cached: bool,
    /// Whether the requesting edge itself is listed.
    pub is_source_cached: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub being_written: bool,
    pub is_global_cached: bool,
    pub is_source_cached: bool,
    /// Remaining cachers after the update, for neighbor-cached bookkeeping.
    pub cachers: Vec<DirectoryInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquireOutcome {
    pub result: LockResult,
    /// Replica set to invalidate when the acquisition succeeded.
    pub replicas: Vec<DirectoryInfo>,
}

/// The beacon-side cooperation wrapper (directory + MSI).
pub struct CooperationWrapper {
    stripes: Vec<Mutex<Stripe>>,
    tiebreak: DirectoryTieBreak,
}

impl CooperationWrapper {
    pub fn new(tiebreak: DirectoryTieBreak) -> Self {
        CooperationWrapper {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::default()).collect(),
            tiebreak,
        }
    }

    fn stripe(&self, key: &Key) -> &Mutex<Stripe> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPE_COUNT]
    }

    /// Directory lookup. While a write is in flight the
    /// requester is suspended: its wake address joins the block set and the
    /// caller gets `being_written = true`.
    pub fn lookup(
        &self,
        key: &Key,
        source: EdgeId,
        wake_addr: Option<NetworkAddr>,
    ) -> LookupOutcome {
        let mut stripe = self.stripe(key).lock();
        let being_written = stripe.msi.contains_key(key);
        if being_written {
            if let Some(addr) = wake_addr {
                stripe
                    .msi
                    .get_mut(key)
                    .expect("msi state present")
                    .block(addr);
            }
        }
        let (dirinfo, is_global_cached, is_source_cached) = match stripe.directory.get(key) {
            Some(entry) => (
                if being_written {
                    None
                } else {
                    entry.pick_valid(source, self.tiebreak)
                },
                !entry.is_empty(),
                entry.contains(source),
            ),
            None => (None, false, false),
        };
        LookupOutcome {
            being_written,
            dirinfo,
            is_global_cached,
            is_source_cached,
        }
    }

    /// Directory update: admit inserts/ensures the cacher,
    /// evict removes it; the entry is destroyed when its last cacher
    /// leaves.
    pub fn update(&self, key: &Key, is_admit: bool, dirinfo: DirectoryInfo) -> UpdateOutcome {
        let mut stripe = self.stripe(key).lock();
        let being_written = stripe.msi.contains_key(key);
        let entry = stripe.directory.entry(key.clone()).or_default();
        if is_admit {
            entry.admit(dirinfo.edge);
        } else if entry.evict(dirinfo.edge) {
            stripe.directory.remove(key);
        }
        let (is_global_cached, is_source_cached, cachers) = match stripe.directory.get(key) {
            Some(entry) => (!entry.is_empty(), entry.contains(dirinfo.edge), entry.all()),
            None => (false, false, Vec::new()),
        };
        UpdateOutcome {
            being_written,
            is_global_cached,
            is_source_cached,
            cachers,
        }
    }

    /// Try to take the per-key write lock. `NoNeed` when no
    /// replica exists anywhere; `Failure` blocks the provided wake address.
    /// On success every listed copy is marked invalid and returned for
    /// fan-out invalidation.
    pub fn try_acquire(
        &self,
        key: &Key,
        writer: EdgeId,
        wake_addr: Option<NetworkAddr>,
    ) -> AcquireOutcome {
        let mut guard = self.stripe(key).lock();
        let stripe = &mut *guard;
        if let Some(state) = stripe.msi.get_mut(key) {
            if state.writer == writer {
                // Re-acquire after a lost response; the replicas were
                // already invalidated the first time.
                return AcquireOutcome {
                    result: LockResult::Success,
                    replicas: Vec::new(),
                };
            }
            if let Some(addr) = wake_addr {
                state.block(addr);
            }
            return AcquireOutcome {
                result: LockResult::Failure,
                replicas: Vec::new(),
            };
        }
        let Some(entry) = stripe.directory.get_mut(key) else {
            return AcquireOutcome {
                result: LockResult::NoNeed,
                replicas: Vec::new(),
            };
        };
        if entry.is_empty() {
            return AcquireOutcome {
                result: LockResult::NoNeed,
                replicas: Vec::new(),
            };
        }
        let replicas = entry.all();
        entry.invalidate_all();
        stripe.msi.insert(key.clone(), MsiState::new(writer));
        AcquireOutcome {
            result: LockResult::Success,
            replicas,
        }
    }

    /// Finish a write: atomically clear the write flag, re-validate the
    /// writer's directory entry if it holds one, and return the edges to
    /// wake. Releasing a lock this edge does not hold is tolerated with a
    /// warning (acks are idempotent-safe).
    pub fn release(&self, key: &Key, writer: EdgeId) -> HashSet<NetworkAddr> {
        let mut stripe = self.stripe(key).lock();
        let Some(state) = stripe.msi.remove(key) else {
            warn!(?key, writer, "release of a write lock that is not held");
            return HashSet::default();
        };
        if state.writer != writer {
            warn!(
                ?key,
                writer,
                holder = state.writer,
                "release by an edge that is not the lock holder"
            );
            stripe.msi.insert(key.clone(), state);
            return HashSet::default();
        }
        if let Some(entry) = stripe.directory.get_mut(key) {
            entry.validate(writer);
        }
        state.unblock_all_and_finish()
    }

    /// Every cacher currently listed for the key.
    pub fn all_cachers(&self, key: &Key) -> Vec<DirectoryInfo> {
        let stripe = self.stripe(key).lock();
        stripe
            .directory
            .get(key)
            .map(|entry| entry.all())
            .unwrap_or_default()
    }

    pub fn is_being_written(&self, key: &Key) -> bool {
        self.stripe(key).lock().msi.contains_key(key)
    }

    /// Bytes charged to cache capacity for the beacon-side state.
    pub fn size_for_capacity(&self) -> u64 {
        let mut size = 0u64;
        for stripe in &self.stripes {
            let stripe = stripe.lock();
            for (key, entry) in stripe.directory.iter() {
                size += key.len() as u64 + entry.len() as u64 * DirEntry::PER_CACHER_SIZE;
            }
            for state in stripe.msi.values() {
                size += state.size_for_capacity();
            }
        }
        size
    }
}
