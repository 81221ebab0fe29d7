// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Node configuration. One owning config value is constructed at startup
//! (from a TOML file or defaults) and threaded through every subsystem
//! constructor; no component reads process-wide state after init.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fleet::{Fleet, HashKind};
use crate::net::NetworkAddr;
use crate::types::EdgeId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Active cache policy, chosen at wiring time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Recency-only baseline.
    Lru,
    /// Reward-driven admission/eviction with beacon-side placement.
    #[default]
    Covered,
}

/// Tie-break among multiple valid cachers in a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryTieBreak {
    #[default]
    Random,
    LowestId,
}

/// Deployment topology shared by every node role.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub hash: HashKind,
    pub edge_ips: Vec<Ipv4Addr>,
    pub edge_port_base: u16,
    pub cloud_ip: Ipv4Addr,
    pub cloud_port: u16,
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig {
            hash: HashKind::default(),
            edge_ips: vec![Ipv4Addr::LOCALHOST],
            edge_port_base: 40_000,
            cloud_ip: Ipv4Addr::LOCALHOST,
            cloud_port: 39_000,
        }
    }
}

impl FleetConfig {
    pub fn build(&self) -> Fleet {
        Fleet::new(
            self.hash,
            self.edge_ips.clone(),
            self.edge_port_base,
            NetworkAddr::new(self.cloud_ip, self.cloud_port),
        )
    }

    pub fn cloud_control_addr(&self) -> NetworkAddr {
        NetworkAddr::new(self.cloud_ip, self.cloud_port + 1)
    }
}

/// Simulated link latencies and per-link FIFO depth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub client_edge_us: u64,
    pub cross_edge_us: u64,
    pub edge_cloud_us: u64,
    pub buffer_size: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig {
            client_edge_us: 0,
            cross_edge_us: 0,
            edge_cloud_us: 0,
            buffer_size: 1024,
        }
    }
}

/// Knobs specific to the COVERED policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoveredConfig {
    /// Lowest-reward keys advertised to peers per sync.
    pub peredge_synced_victimcnt: u32,
    /// Memory bound for the uncached-metadata side LRU.
    pub local_uncached_max_bytes: u64,
    /// Memory bound for the beacon-side popularity aggregator.
    pub popularity_aggregation_max_bytes: u64,
    /// Minimum relative popularity change that re-triggers a placement
    /// calculation.
    pub popularity_collection_change_ratio: f64,
    /// Upper bound on the size of a computed placement edgeset.
    pub topk_edgecnt: u32,
}

impl Default for CoveredConfig {
    fn default() -> Self {
        CoveredConfig {
            peredge_synced_victimcnt: 4,
            local_uncached_max_bytes: 1 << 20,
            popularity_aggregation_max_bytes: 1 << 20,
            popularity_collection_change_ratio: 0.1,
            topk_edgecnt: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub edge_id: EdgeId,
    pub capacity_bytes: u64,
    /// Cache-server worker threads; 0 means one per available core.
    pub workers: usize,
    pub pergroup_max_keys: u32,
    pub policy: CachePolicy,
    pub directory_tiebreak: DirectoryTieBreak,
    pub recv_timeout_ms: u64,
    pub fleet: FleetConfig,
    pub propagation: PropagationConfig,
    pub covered: CoveredConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        EdgeConfig {
            edge_id: 0,
            capacity_bytes: 64 << 20,
            workers: 0,
            pergroup_max_keys: 16,
            policy: CachePolicy::default(),
            directory_tiebreak: DirectoryTieBreak::default(),
            recv_timeout_ms: 200,
            fleet: FleetConfig::default(),
            propagation: PropagationConfig::default(),
            covered: CoveredConfig::default(),
        }
    }
}

impl EdgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: EdgeConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.edge_id as usize >= self.fleet.edge_ips.len() {
            return Err(ConfigError::Invalid(format!(
                "edge_id {} out of range for {} edges",
                self.edge_id,
                self.fleet.edge_ips.len()
            )));
        }
        if self.capacity_bytes == 0 {
            return Err(ConfigError::Invalid("capacity_bytes must be > 0".into()));
        }
        if self.pergroup_max_keys == 0 {
            return Err(ConfigError::Invalid("pergroup_max_keys must be > 0".into()));
        }
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CloudConfig {
    pub recv_timeout_ms: u64,
    pub fleet: FleetConfig,
}

impl CloudConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: CloudConfig = toml::from_str(&raw)?;
        Ok(config)
    }

    pub fn recv_timeout(&self) -> Duration {
        let ms = if self.recv_timeout_ms == 0 {
            200
        } else {
            self.recv_timeout_ms
        };
        Duration::from_millis(ms)
    }
}
