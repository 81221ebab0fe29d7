// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The origin (cloud) node: an authoritative key-value store behind a UDP
//! request loop. The origin is assumed available; it answers every global
//! request it receives and keeps no cache state.

use ahash::HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::CloudConfig;
use crate::message::{Message, MsgKind};
use crate::net::{MsgSocket, NetError};
use crate::node::{control_loop, Running};
use crate::types::{Key, Value};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Thread-safe in-memory KV store backing the origin.
#[derive(Debug, Default, Clone)]
pub struct OriginStore {
    map: Arc<RwLock<HashMap<Key, Value>>>,
}

impl OriginStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Key) -> Option<Value> {
        self.map.read().get(key).cloned()
    }

    pub fn put(&self, key: Key, value: Value) {
        self.map.write().insert(key, value);
    }

    pub fn delete(&self, key: &Key) {
        self.map.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

/// Request counters, mostly of interest to the benchmark harness.
#[derive(Debug, Default)]
pub struct CloudStats {
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub dels: AtomicU64,
}

impl CloudStats {
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn dels(&self) -> u64 {
        self.dels.load(Ordering::Relaxed)
    }
}

pub struct CloudNode {
    config: CloudConfig,
    store: OriginStore,
    running: Running,
    stats: Arc<CloudStats>,
}

impl CloudNode {
    pub fn new(config: CloudConfig) -> Self {
        CloudNode {
            config,
            store: OriginStore::new(),
            running: Running::new(),
            stats: Arc::new(CloudStats::default()),
        }
    }

    pub fn running(&self) -> Running {
        self.running.clone()
    }

    pub fn store(&self) -> OriginStore {
        self.store.clone()
    }

    pub fn stats(&self) -> Arc<CloudStats> {
        self.stats.clone()
    }

    /// Serve global requests until shutdown. Unexpected message types on
    /// the data socket are a programming error and terminate the node.
    pub fn run(&self) -> Result<(), CloudError> {
        let fleet_addr = self.config.fleet.build().cloud_addr();
        let mut socket = MsgSocket::bind(fleet_addr, self.config.recv_timeout())?;
        info!(addr = %fleet_addr, "cloud node listening");

        let control_socket = MsgSocket::bind(
            self.config.fleet.cloud_control_addr(),
            self.config.recv_timeout(),
        )?;
        let control_running = self.running.clone();
        let control = std::thread::Builder::new()
            .name("cloud-control".into())
            .spawn(move || {
                if let Err(err) = control_loop(control_socket, 0, control_running) {
                    error!(%err, "cloud control loop failed");
                }
            })
            .map_err(NetError::Io)?;

        while self.running.is_running() {
            let Some((msg, from)) = socket.recv_msg()? else {
                continue;
            };
            let rsp_kind = match msg.kind {
                MsgKind::GlobalGetRequest { key } => {
                    self.stats.gets.fetch_add(1, Ordering::Relaxed);
                    let value = self.store.get(&key).unwrap_or_else(Value::deleted);
                    debug!(?key, deleted = value.is_deleted(), "global get");
                    MsgKind::GlobalGetResponse { key, value }
                }
                MsgKind::GlobalPutRequest { key, value } => {
                    self.stats.puts.fetch_add(1, Ordering::Relaxed);
                    self.store.put(key.clone(), value);
                    MsgKind::GlobalPutResponse { key }
                }
                MsgKind::GlobalDelRequest { key } => {
                    self.stats.dels.fetch_add(1, Ordering::Relaxed);
                    self.store.delete(&key);
                    MsgKind::GlobalDelResponse { key }
                }
                other => {
                    error!(tag = other.tag(), "invalid message type on cloud data socket");
                    std::process::exit(1);
                }
            };
            let rsp = Message::new(rsp_kind, msg.source_edge, fleet_addr);
            // Replies go to the requester's logical source, not the packet
            // source, so propagation threads can relay.
            let dst = if msg.source_addr.is_valid() {
                msg.source_addr
            } else {
                from
            };
            socket.send_msg(&rsp, dst)?;
        }

        control.join().ok();
        info!("cloud node stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_store_round_trip() {
        let store = OriginStore::new();
        let key = Key::from("k");
        assert!(store.get(&key).is_none());
        store.put(key.clone(), Value::new("v"));
        assert_eq!(store.get(&key), Some(Value::new("v")));
        store.delete(&key);
        assert!(store.get(&key).is_none());
    }
}
