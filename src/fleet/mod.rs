// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Fleet topology: the deterministic key-to-beacon map and the address book
//! for every endpoint in a deployment. Both are fixed at startup.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::net::NetworkAddr;
use crate::types::{DirectoryInfo, EdgeId, Key};

/// Consecutive UDP ports reserved per edge node.
const PORTS_PER_EDGE: u16 = 4;

const CACHE_SERVER_PORT_OFFSET: u16 = 0;
const BEACON_SERVER_PORT_OFFSET: u16 = 1;
const INVALIDATION_SERVER_PORT_OFFSET: u16 = 2;
const CONTROL_PORT_OFFSET: u16 = 3;

/// Selectable 32-bit hash family for the beacon map. `beacon_of` must be a
/// pure function of the key bytes so that every node computes the same
/// owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Md5,
    Blake2b,
}

impl HashKind {
    pub fn hash32(&self, bytes: &[u8]) -> u32 {
        match self {
            HashKind::Md5 => {
                use md5::{Digest, Md5};
                let digest = Md5::digest(bytes);
                u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
            }
            HashKind::Blake2b => {
                let hash = blake2b_simd::Params::new().hash_length(4).hash(bytes);
                let out = hash.as_bytes();
                u32::from_be_bytes([out[0], out[1], out[2], out[3]])
            }
        }
    }
}

/// Address book plus beacon map for one deployment.
#[derive(Debug, Clone)]
pub struct Fleet {
    hash: HashKind,
    edge_ips: Vec<Ipv4Addr>,
    edge_port_base: u16,
    cloud_addr: NetworkAddr,
}

impl Fleet {
    pub fn new(
        hash: HashKind,
        edge_ips: Vec<Ipv4Addr>,
        edge_port_base: u16,
        cloud_addr: NetworkAddr,
    ) -> Self {
        assert!(!edge_ips.is_empty(), "fleet requires at least one edge");
        Fleet {
            hash,
            edge_ips,
            edge_port_base,
            cloud_addr,
        }
    }

    pub fn edge_count(&self) -> u32 {
        self.edge_ips.len() as u32
    }

    /// Deterministic beacon owner of a key: `H(key) mod edge_count`.
    pub fn beacon_of(&self, key: &Key) -> EdgeId {
        self.hash.hash32(key.as_bytes()) % self.edge_count()
    }

    pub fn is_beacon(&self, key: &Key, edge: EdgeId) -> bool {
        self.beacon_of(key) == edge
    }

    pub fn is_target(&self, dirinfo: &DirectoryInfo, edge: EdgeId) -> bool {
        dirinfo.edge == edge
    }

    fn edge_port(&self, edge: EdgeId, offset: u16) -> u16 {
        self.edge_port_base + (edge as u16) * PORTS_PER_EDGE + offset
    }

    pub fn edge_ip(&self, edge: EdgeId) -> Ipv4Addr {
        self.edge_ips[edge as usize]
    }

    /// Client-facing and peer-facing data ingress of an edge.
    pub fn cache_server_addr(&self, edge: EdgeId) -> NetworkAddr {
        NetworkAddr::new(self.edge_ip(edge), self.edge_port(edge, CACHE_SERVER_PORT_OFFSET))
    }

    /// Directory/MSI ingress of an edge in its beacon role.
    pub fn beacon_server_addr(&self, edge: EdgeId) -> NetworkAddr {
        NetworkAddr::new(self.edge_ip(edge), self.edge_port(edge, BEACON_SERVER_PORT_OFFSET))
    }

    /// Dedicated invalidation ingress of an edge.
    pub fn invalidation_server_addr(&self, edge: EdgeId) -> NetworkAddr {
        NetworkAddr::new(
            self.edge_ip(edge),
            self.edge_port(edge, INVALIDATION_SERVER_PORT_OFFSET),
        )
    }

    /// Benchmark-control ingress of an edge.
    pub fn control_addr(&self, edge: EdgeId) -> NetworkAddr {
        NetworkAddr::new(self.edge_ip(edge), self.edge_port(edge, CONTROL_PORT_OFFSET))
    }

    pub fn cloud_addr(&self) -> NetworkAddr {
        self.cloud_addr
    }

    /// Recover the edge id owning an invalidation ingress address; used to
    /// sanity-check invalidation acks.
    pub fn edge_of_invalidation_addr(&self, addr: NetworkAddr) -> Option<EdgeId> {
        (0..self.edge_count()).find(|&e| self.invalidation_server_addr(e) == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(edges: usize) -> Fleet {
        Fleet::new(
            HashKind::Md5,
            vec![Ipv4Addr::LOCALHOST; edges],
            40_000,
            NetworkAddr::localhost(39_000),
        )
    }

    #[test]
    fn beacon_is_deterministic_and_in_range() {
        let fleet = fleet(4);
        for i in 0..100 {
            let key = Key::from(format!("key-{i}").as_str());
            let beacon = fleet.beacon_of(&key);
            assert!(beacon < 4);
            assert_eq!(beacon, fleet.beacon_of(&key));
        }
    }

    #[test]
    fn hash_families_agree_with_themselves() {
        let key = b"stable";
        assert_eq!(HashKind::Md5.hash32(key), HashKind::Md5.hash32(key));
        assert_eq!(HashKind::Blake2b.hash32(key), HashKind::Blake2b.hash32(key));
    }

    #[test]
    fn edge_ports_do_not_collide() {
        let fleet = fleet(3);
        let mut seen = std::collections::HashSet::new();
        for e in 0..3 {
            for addr in [
                fleet.cache_server_addr(e),
                fleet.beacon_server_addr(e),
                fleet.invalidation_server_addr(e),
                fleet.control_addr(e),
            ] {
                assert!(seen.insert(addr), "port collision at {addr}");
            }
        }
    }

    #[test]
    fn single_edge_is_always_beacon() {
        let fleet = fleet(1);
        assert!(fleet.is_beacon(&Key::from("anything"), 0));
    }
}
