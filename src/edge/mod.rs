// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The edge node: cache-server ingress and workers, beacon server,
//! invalidation/placement/metadata processors, and the background placement
//! deployer, all wired over per-link propagation queues.

mod beacon_server;
mod cache_server;
mod processors;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashSet};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CachePolicy, EdgeConfig};
use crate::cooperation::CooperationWrapper;
use crate::covered::{BackgroundJob, CoveredManager};
use crate::fleet::Fleet;
use crate::message::{CoveredSync, Message, MsgKind};
use crate::net::{
    spawn_propagation_thread, MsgSocket, NetError, NetworkAddr, PropagationHandle,
    PropagationQueue,
};
use crate::node::{control_loop, Running};
use crate::store::EdgeCache;
use crate::telemetry::BackgroundCounter;
use crate::types::{DirectoryInfo, EdgeId, Key};

#[derive(Debug, Error)]
pub enum EdgeError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("thread spawn failed: {0}")]
    Spawn(std::io::Error),
}

/// Everything the edge's threads share. Built once at startup and threaded
/// through each subsystem; nothing reads process-wide state after init.
pub struct EdgeContext {
    pub config: EdgeConfig,
    pub fleet: Fleet,
    pub edge_id: EdgeId,
    pub running: Running,
    pub cache: EdgeCache,
    pub cooperation: CooperationWrapper,
    pub covered: Option<CoveredManager>,
    pub to_client: PropagationHandle,
    pub to_edge: PropagationHandle,
    pub to_cloud: PropagationHandle,
    pub background_tx: flume::Sender<BackgroundJob>,
    pub counter: BackgroundCounter,
}

impl EdgeContext {
    pub fn is_local_beacon(&self, key: &Key) -> bool {
        self.fleet.is_beacon(key, self.edge_id)
    }

    pub fn is_local_target(&self, dirinfo: &DirectoryInfo) -> bool {
        self.fleet.is_target(dirinfo, self.edge_id)
    }

    pub fn recv_timeout(&self) -> Duration {
        self.config.recv_timeout()
    }

    /// Bytes this edge charges against capacity: cache plus beacon-side
    /// cooperation state.
    pub fn size_for_capacity(&self) -> u64 {
        self.cache.used_bytes() + self.cooperation.size_for_capacity()
    }

    /// COVERED trailers for an outgoing control message about `key`.
    pub fn covered_sync_for(&self, key: &Key) -> CoveredSync {
        let Some(manager) = &self.covered else {
            return CoveredSync::default();
        };
        CoveredSync {
            victims: manager.local_victim_syncset(&self.cache),
            popularity: Some(self.cache.collected_popularity(key)),
            edgeset: None,
        }
    }

    /// Fold the trailers a peer piggybacked on a message we received.
    pub fn absorb_sync(&self, sync: &CoveredSync) {
        if let (Some(manager), Some(victims)) = (&self.covered, &sync.victims) {
            manager.apply_victim_syncset(victims);
        }
    }

    pub fn enqueue_background(&self, job: BackgroundJob) {
        if self.background_tx.try_send(job).is_err() {
            warn!(edge = self.edge_id, "background pipeline queue full; job dropped");
        }
    }
}

/// Broadcast with per-target timeout-and-retry until every target acks or
/// the node shuts down. `targets` maps the ack source address
/// to the request to (re)send and its destination. Returns `true` when
/// shutdown interrupted the broadcast.
pub(crate) fn broadcast_acked(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    targets: HashMap<NetworkAddr, (Message, NetworkAddr)>,
    ack_matches: impl Fn(&MsgKind) -> bool,
) -> Result<bool, EdgeError> {
    if targets.is_empty() {
        return Ok(false);
    }
    let mut pending: HashSet<NetworkAddr> = targets.keys().copied().collect();
    while !pending.is_empty() {
        if !ctx.running.is_running() {
            return Ok(true);
        }
        for addr in &pending {
            let (msg, dst) = &targets[addr];
            if let Err(err) = ctx.to_edge.push_wait(msg.clone(), *dst) {
                warn!(%err, dst = %dst, "broadcast push failed; will retry");
            }
        }
        let expected = pending.len();
        for _ in 0..expected {
            match socket.recv_msg()? {
                Some((ack, _)) => {
                    if ack_matches(&ack.kind) {
                        if !pending.remove(&ack.source_addr) {
                            // Duplicate or late ack; idempotent-safe.
                            warn!(source = %ack.source_addr, "ack from an address not in the outstanding set");
                        }
                        continue;
                    }
                    // A stray duplicate wake must still be acked or its
                    // sender would keep retrying.
                    if let MsgKind::FinishBlockRequest { key } = &ack.kind {
                        let rsp = Message::new(
                            MsgKind::FinishBlockResponse { key: key.clone() },
                            ctx.edge_id,
                            socket.local_addr(),
                        );
                        ctx.to_edge.push_wait(rsp, ack.source_addr).ok();
                        continue;
                    }
                    warn!(tag = ack.kind.tag(), "unexpected ack type during broadcast");
                }
                None => {
                    if !ctx.running.is_running() {
                        return Ok(true);
                    }
                    warn!(outstanding = pending.len(), "broadcast timeout; resending");
                    break;
                }
            }
        }
    }
    Ok(false)
}

/// Invalidate every replica in `replicas`, local copy inline and remote
/// copies via acked invalidation requests. Returns `true` on shutdown.
pub(crate) fn broadcast_invalidation(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
    replicas: &[DirectoryInfo],
    exclude: Option<EdgeId>,
) -> Result<bool, EdgeError> {
    let mut targets: HashMap<NetworkAddr, (Message, NetworkAddr)> = HashMap::default();
    for info in replicas {
        if Some(info.edge) == exclude {
            continue;
        }
        if info.edge == ctx.edge_id {
            ctx.cache.invalidate(key);
            continue;
        }
        let dst = ctx.fleet.invalidation_server_addr(info.edge);
        let req = Message::new(
            MsgKind::InvalidationRequest { key: key.clone() },
            ctx.edge_id,
            socket.local_addr(),
        );
        targets.insert(dst, (req, dst));
    }
    broadcast_acked(ctx, socket, targets, |kind| {
        matches!(kind, MsgKind::InvalidationResponse { .. })
    })
}

/// Wake every blocked edge with an acked finish-block fan-out. Returns
/// `true` on shutdown.
pub(crate) fn broadcast_finish_block(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
    blocked: &HashSet<NetworkAddr>,
) -> Result<bool, EdgeError> {
    let mut targets: HashMap<NetworkAddr, (Message, NetworkAddr)> = HashMap::default();
    for addr in blocked {
        let req = Message::new(
            MsgKind::FinishBlockRequest { key: key.clone() },
            ctx.edge_id,
            socket.local_addr(),
        );
        targets.insert(*addr, (req, *addr));
    }
    broadcast_acked(ctx, socket, targets, |kind| {
        matches!(kind, MsgKind::FinishBlockResponse { .. })
    })
}

/// Send one request and wait for its ack, resending on timeout until the
/// node shuts down (`None`). Finish-block wake-ups arriving meanwhile are
/// acked so a releasing writer never stalls on us; anything else unexpected
/// is dropped with a warning.
pub(crate) fn request_ack(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    link: &PropagationHandle,
    req: Message,
    dst: NetworkAddr,
    accept: impl Fn(&MsgKind) -> bool,
) -> Result<Option<Message>, EdgeError> {
    'resend: loop {
        if !ctx.running.is_running() {
            return Ok(None);
        }
        link.push_wait(req.clone(), dst).ok();
        loop {
            let Some((msg, _)) = socket.recv_msg()? else {
                if !ctx.running.is_running() {
                    return Ok(None);
                }
                warn!(tag = req.kind.tag(), "timeout waiting for ack; resending");
                continue 'resend;
            };
            if accept(&msg.kind) {
                ctx.absorb_sync(&msg.sync);
                return Ok(Some(msg));
            }
            if let MsgKind::FinishBlockRequest { key } = &msg.kind {
                let rsp = Message::new(
                    MsgKind::FinishBlockResponse { key: key.clone() },
                    ctx.edge_id,
                    socket.local_addr(),
                );
                ctx.to_edge.push_wait(rsp, msg.source_addr).ok();
                continue;
            }
            warn!(tag = msg.kind.tag(), "dropping unexpected message while awaiting ack");
        }
    }
}

/// Publish an admit/evict for `key` at its beacon; the local fast path
/// elides the RPC. Directory updates always follow the corresponding store
/// change. Returns `None` on shutdown.
pub(crate) fn update_directory(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
    is_admit: bool,
) -> Result<Option<()>, EdgeError> {
    let dirinfo = DirectoryInfo::new(ctx.edge_id);
    if ctx.is_local_beacon(key) {
        beacon_server::handle_update_local(ctx, key, is_admit, dirinfo, &ctx.covered_sync_for(key));
        return Ok(Some(()));
    }
    let dst = ctx.fleet.beacon_server_addr(ctx.fleet.beacon_of(key));
    let mut req = Message::new(
        MsgKind::DirectoryUpdateRequest {
            key: key.clone(),
            is_admit,
            dirinfo,
        },
        ctx.edge_id,
        socket.local_addr(),
    );
    req.sync = ctx.covered_sync_for(key);
    let expect = key.clone();
    let ack = request_ack(ctx, socket, &ctx.to_edge, req, dst, move |kind| {
        matches!(kind, MsgKind::DirectoryUpdateResponse { key: k, .. } if *k == expect)
    })?;
    Ok(ack.map(|_| ()))
}

/// Admit a value, publish the directory entry, then evict back under
/// capacity (each victim sends its own directory evict). Returns `None` on
/// shutdown, otherwise whether the admission actually happened.
pub(crate) fn admit_with_directory(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
    value: crate::types::Value,
    is_neighbor_cached: bool,
) -> Result<Option<bool>, EdgeError> {
    if !ctx.cache.admit(key, value, true, is_neighbor_cached) {
        return Ok(Some(false));
    }
    if update_directory(ctx, socket, key, true)?.is_none() {
        return Ok(None);
    }
    for (victim, _) in ctx.cache.evict_until_fits() {
        if update_directory(ctx, socket, &victim, false)?.is_none() {
            return Ok(None);
        }
    }
    Ok(Some(true))
}

pub struct EdgeNode {
    ctx: Arc<EdgeContext>,
}

impl EdgeNode {
    pub fn new(config: EdgeConfig) -> Result<Self, EdgeError> {
        config.validate()?;
        let running = Running::new();
        let fleet = config.fleet.build();
        let cache = EdgeCache::new(
            config.policy,
            config.capacity_bytes,
            config.pergroup_max_keys,
            config.covered.peredge_synced_victimcnt as usize,
            config.covered.local_uncached_max_bytes,
        );
        let covered = match config.policy {
            CachePolicy::Covered => Some(CoveredManager::new(config.edge_id, &config.covered)),
            CachePolicy::Lru => None,
        };
        let cooperation = CooperationWrapper::new(config.directory_tiebreak);

        let (to_client, client_queue) = PropagationQueue::new(
            config.propagation.client_edge_us,
            config.propagation.buffer_size,
            running.clone(),
        );
        let (to_edge, edge_queue) = PropagationQueue::new(
            config.propagation.cross_edge_us,
            config.propagation.buffer_size,
            running.clone(),
        );
        let (to_cloud, cloud_queue) = PropagationQueue::new(
            config.propagation.edge_cloud_us,
            config.propagation.buffer_size,
            running.clone(),
        );
        let (background_tx, background_rx) = flume::bounded(config.propagation.buffer_size);

        let ctx = Arc::new(EdgeContext {
            edge_id: config.edge_id,
            fleet,
            running,
            cache,
            cooperation,
            covered,
            to_client,
            to_edge,
            to_cloud,
            background_tx,
            counter: BackgroundCounter::new(),
            config,
        });

        // Link propagation threads.
        spawn_propagation_thread(client_queue, "to-client")?;
        spawn_propagation_thread(edge_queue, "to-edge")?;
        spawn_propagation_thread(cloud_queue, "to-cloud")?;

        // Background deployer for placement and metadata jobs.
        processors::spawn_deployer(ctx.clone(), background_rx)?;

        Ok(EdgeNode { ctx })
    }

    pub fn context(&self) -> Arc<EdgeContext> {
        self.ctx.clone()
    }

    pub fn running(&self) -> Running {
        self.ctx.running.clone()
    }

    /// Bring up every server thread and block on the control loop until a
    /// finish-run request (or `shutdown()`) stops the node.
    pub fn run(&self) -> Result<(), EdgeError> {
        let ctx = &self.ctx;
        info!(
            edge = ctx.edge_id,
            policy = ?ctx.config.policy,
            "edge node starting"
        );

        let beacon = beacon_server::spawn(ctx.clone())?;
        let cache_server = cache_server::spawn(ctx.clone())?;
        let invalidation = processors::spawn_invalidation_server(ctx.clone())?;

        let control_socket = MsgSocket::bind(
            ctx.fleet.control_addr(ctx.edge_id),
            ctx.recv_timeout(),
        )?;
        control_loop(control_socket, ctx.edge_id, ctx.running.clone())?;

        beacon.join().ok();
        for handle in cache_server {
            handle.join().ok();
        }
        invalidation.join().ok();
        info!(edge = ctx.edge_id, "edge node stopped");
        Ok(())
    }
}
