// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire message types.
//!
//! Every message carries a 1-byte type tag, a common header (source edge id
//! and source address), and optional trailers: an event list, a bandwidth
//! usage tuple, and — for the COVERED policy — victim-sync, collected
//! popularity and placement edgeset summaries piggybacked on the existing
//! control traffic.

mod codec;

pub use codec::CodecError;

use smallvec::SmallVec;

use crate::net::NetworkAddr;
use crate::telemetry::{BandwidthUsage, EventList};
use crate::types::{DirectoryInfo, EdgeId, Hitflag, Key, LockResult, Value};

/// Edges chosen by a placement calculation.
pub type Edgeset = SmallVec<[EdgeId; 8]>;

/// One recently low-reward eviction candidate advertised to peers.
#[derive(Debug, Clone, PartialEq)]
pub struct VictimEntry {
    pub key: Key,
    pub reward: f64,
    pub object_size: u64,
}

/// Compact summary of an edge's current lowest-reward keys plus its free
/// cache margin, piggybacked on control messages so beacons can estimate
/// placement feasibility and eviction cost remotely.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VictimSyncset {
    pub edge: EdgeId,
    pub margin_bytes: u64,
    pub victims: Vec<VictimEntry>,
}

/// Current local-uncached popularity of a key at the sending edge, with the
/// sender's approximate object size so the beacon can judge placement
/// feasibility. `is_tracked` is false when the key is not in the sender's
/// uncached metadata (e.g. it is locally cached), in which case the beacon
/// drops any stale aggregate it holds for that edge.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CollectedPopularity {
    pub is_tracked: bool,
    pub popularity: f64,
    pub object_size: u64,
}

impl CollectedPopularity {
    pub fn tracked(popularity: f64) -> Self {
        CollectedPopularity {
            is_tracked: true,
            popularity,
            object_size: 0,
        }
    }

    pub fn tracked_sized(popularity: f64, object_size: u64) -> Self {
        CollectedPopularity {
            is_tracked: true,
            popularity,
            object_size,
        }
    }

    pub fn untracked() -> Self {
        CollectedPopularity::default()
    }
}

/// COVERED trailers attached to directory/MSI traffic. Empty for the basic
/// policy; presence is flagged per field on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoveredSync {
    pub victims: Option<VictimSyncset>,
    pub popularity: Option<CollectedPopularity>,
    pub edgeset: Option<Edgeset>,
}

impl CoveredSync {
    pub fn is_empty(&self) -> bool {
        self.victims.is_none() && self.popularity.is_none() && self.edgeset.is_none()
    }
}

/// Message payloads, tagged by type on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgKind {
    // Data plane: client <-> closest edge.
    LocalGetRequest { key: Key },
    LocalGetResponse { key: Key, value: Value, hitflag: Hitflag },
    LocalPutRequest { key: Key, value: Value },
    LocalPutResponse { key: Key, hitflag: Hitflag },
    LocalDelRequest { key: Key },
    LocalDelResponse { key: Key, hitflag: Hitflag },

    // Data plane: edge <-> target edge.
    RedirectedGetRequest { key: Key },
    RedirectedGetResponse { key: Key, value: Value, hitflag: Hitflag },

    // Data plane: edge <-> origin.
    GlobalGetRequest { key: Key },
    GlobalGetResponse { key: Key, value: Value },
    GlobalPutRequest { key: Key, value: Value },
    GlobalPutResponse { key: Key },
    GlobalDelRequest { key: Key },
    GlobalDelResponse { key: Key },

    // Directory plane: edge <-> beacon.
    DirectoryLookupRequest { key: Key },
    DirectoryLookupResponse {
        key: Key,
        being_written: bool,
        dirinfo: Option<DirectoryInfo>,
    },
    DirectoryUpdateRequest {
        key: Key,
        is_admit: bool,
        dirinfo: DirectoryInfo,
    },
    DirectoryUpdateResponse { key: Key, being_written: bool },

    // MSI plane: edge <-> beacon, beacon <-> replicas.
    AcquireWritelockRequest { key: Key },
    AcquireWritelockResponse { key: Key, result: LockResult },
    ReleaseWritelockRequest { key: Key },
    ReleaseWritelockResponse { key: Key },
    InvalidationRequest { key: Key },
    InvalidationResponse { key: Key },
    FinishBlockRequest { key: Key },
    FinishBlockResponse { key: Key },

    // COVERED placement deployment: beacon -> chosen edges.
    PlacementNotifyRequest { key: Key, value: Value },
    PlacementNotifyResponse { key: Key },
    // Beacon -> cacher: flip the is-neighbor-cached bit that feeds the
    // last-copy eviction cost.
    MetadataUpdateRequest { key: Key, is_neighbor_cached: bool },
    MetadataUpdateResponse { key: Key },

    // Benchmark control plane.
    InitializationRequest,
    InitializationResponse,
    StartrunRequest,
    StartrunResponse,
    SwitchSlotRequest { slot: u32 },
    SwitchSlotResponse { slot: u32 },
    FinishrunRequest,
    SimpleFinishrunResponse,
}

impl MsgKind {
    /// Wire tag. Stable across builds; appending new types only.
    pub fn tag(&self) -> u8 {
        use MsgKind::*;
        match self {
            LocalGetRequest { .. } => 0,
            LocalGetResponse { .. } => 1,
            LocalPutRequest { .. } => 2,
            LocalPutResponse { .. } => 3,
            LocalDelRequest { .. } => 4,
            LocalDelResponse { .. } => 5,
            RedirectedGetRequest { .. } => 6,
            RedirectedGetResponse { .. } => 7,
            GlobalGetRequest { .. } => 8,
            GlobalGetResponse { .. } => 9,
            GlobalPutRequest { .. } => 10,
            GlobalPutResponse { .. } => 11,
            GlobalDelRequest { .. } => 12,
            GlobalDelResponse { .. } => 13,
            DirectoryLookupRequest { .. } => 14,
            DirectoryLookupResponse { .. } => 15,
            DirectoryUpdateRequest { .. } => 16,
            DirectoryUpdateResponse { .. } => 17,
            AcquireWritelockRequest { .. } => 18,
            AcquireWritelockResponse { .. } => 19,
            ReleaseWritelockRequest { .. } => 20,
            ReleaseWritelockResponse { .. } => 21,
            InvalidationRequest { .. } => 22,
            InvalidationResponse { .. } => 23,
            FinishBlockRequest { .. } => 24,
            FinishBlockResponse { .. } => 25,
            PlacementNotifyRequest { .. } => 26,
            PlacementNotifyResponse { .. } => 27,
            MetadataUpdateRequest { .. } => 28,
            MetadataUpdateResponse { .. } => 29,
            InitializationRequest => 30,
            InitializationResponse => 31,
            StartrunRequest => 32,
            StartrunResponse => 33,
            SwitchSlotRequest { .. } => 34,
            SwitchSlotResponse { .. } => 35,
            FinishrunRequest => 36,
            SimpleFinishrunResponse => 37,
        }
    }

    /// Requests from a client to its closest edge.
    pub fn is_local_request(&self) -> bool {
        matches!(
            self,
            MsgKind::LocalGetRequest { .. }
                | MsgKind::LocalPutRequest { .. }
                | MsgKind::LocalDelRequest { .. }
        )
    }

    pub fn is_redirected_request(&self) -> bool {
        matches!(self, MsgKind::RedirectedGetRequest { .. })
    }

    pub fn is_data_request(&self) -> bool {
        self.is_local_request() || self.is_redirected_request()
    }

    pub fn is_global_request(&self) -> bool {
        matches!(
            self,
            MsgKind::GlobalGetRequest { .. }
                | MsgKind::GlobalPutRequest { .. }
                | MsgKind::GlobalDelRequest { .. }
        )
    }

    /// Directory/MSI requests addressed to a node in its beacon role.
    pub fn is_beacon_request(&self) -> bool {
        matches!(
            self,
            MsgKind::DirectoryLookupRequest { .. }
                | MsgKind::DirectoryUpdateRequest { .. }
                | MsgKind::AcquireWritelockRequest { .. }
                | MsgKind::ReleaseWritelockRequest { .. }
        )
    }

    pub fn is_benchmark_control(&self) -> bool {
        matches!(
            self,
            MsgKind::InitializationRequest
                | MsgKind::InitializationResponse
                | MsgKind::StartrunRequest
                | MsgKind::StartrunResponse
                | MsgKind::SwitchSlotRequest { .. }
                | MsgKind::SwitchSlotResponse { .. }
                | MsgKind::FinishrunRequest
                | MsgKind::SimpleFinishrunResponse
        )
    }

    /// Key carried by this message, if any.
    pub fn key(&self) -> Option<&Key> {
        use MsgKind::*;
        match self {
            LocalGetRequest { key }
            | LocalGetResponse { key, .. }
            | LocalPutRequest { key, .. }
            | LocalPutResponse { key, .. }
            | LocalDelRequest { key }
            | LocalDelResponse { key, .. }
            | RedirectedGetRequest { key }
            | RedirectedGetResponse { key, .. }
            | GlobalGetRequest { key }
            | GlobalGetResponse { key, .. }
            | GlobalPutRequest { key, .. }
            | GlobalPutResponse { key }
            | GlobalDelRequest { key }
            | GlobalDelResponse { key }
            | DirectoryLookupRequest { key }
            | DirectoryLookupResponse { key, .. }
            | DirectoryUpdateRequest { key, .. }
            | DirectoryUpdateResponse { key, .. }
            | AcquireWritelockRequest { key }
            | AcquireWritelockResponse { key, .. }
            | ReleaseWritelockRequest { key }
            | ReleaseWritelockResponse { key }
            | InvalidationRequest { key }
            | InvalidationResponse { key }
            | FinishBlockRequest { key }
            | FinishBlockResponse { key }
            | PlacementNotifyRequest { key, .. }
            | PlacementNotifyResponse { key }
            | MetadataUpdateRequest { key, .. }
            | MetadataUpdateResponse { key } => Some(key),
            _ => None,
        }
    }
}

/// A complete wire message: typed payload plus the common header and
/// trailers shared by every type.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub kind: MsgKind,
    pub source_edge: EdgeId,
    pub source_addr: NetworkAddr,
    pub events: EventList,
    pub bandwidth: BandwidthUsage,
    pub sync: CoveredSync,
}

impl Message {
    pub fn new(kind: MsgKind, source_edge: EdgeId, source_addr: NetworkAddr) -> Self {
        Message {
            kind,
            source_edge,
            source_addr,
            events: EventList::new(),
            bandwidth: BandwidthUsage::new(),
            sync: CoveredSync::default(),
        }
    }

    pub fn with_sync(mut self, sync: CoveredSync) -> Self {
        self.sync = sync;
        self
    }

    /// Encoded size, used for bandwidth accounting.
    pub fn wire_size(&self) -> u64 {
        self.encode().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MsgKind) -> Message {
        Message::new(kind, 1, NetworkAddr::localhost(4000))
    }

    #[test]
    fn classification_is_disjoint() {
        let local = msg(MsgKind::LocalGetRequest { key: Key::from("a") });
        assert!(local.kind.is_local_request());
        assert!(local.kind.is_data_request());
        assert!(!local.kind.is_beacon_request());

        let lookup = msg(MsgKind::DirectoryLookupRequest { key: Key::from("a") });
        assert!(lookup.kind.is_beacon_request());
        assert!(!lookup.kind.is_data_request());

        let init = msg(MsgKind::InitializationRequest);
        assert!(init.kind.is_benchmark_control());
        assert!(!init.kind.is_data_request());
    }

    #[test]
    fn tags_are_unique() {
        use std::collections::HashSet;
        let kinds = vec![
            MsgKind::LocalGetRequest { key: Key::from("k") },
            MsgKind::RedirectedGetRequest { key: Key::from("k") },
            MsgKind::GlobalDelResponse { key: Key::from("k") },
            MsgKind::DirectoryUpdateResponse {
                key: Key::from("k"),
                being_written: false,
            },
            MsgKind::FinishBlockRequest { key: Key::from("k") },
            MsgKind::SimpleFinishrunResponse,
        ];
        let tags: HashSet<u8> = kinds.iter().map(|k| k.tag()).collect();
        assert_eq!(tags.len(), kinds.len());
    }
}
