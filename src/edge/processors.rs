// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Background processors of the edge node: the invalidation ingress, the
//! placement-notification and metadata-update processors fed by the
//! cache-server dispatcher, and the deployer that drives the COVERED
//! placement pipeline computed at this node's beacon.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::{admit_with_directory, request_ack, EdgeContext, EdgeError};
use crate::covered::BackgroundJob;
use crate::message::{Message, MsgKind};
use crate::net::MsgSocket;
use crate::store::GetResult;
use crate::types::{EdgeId, Hitflag, Key, Value};

/// Dedicated ingress for invalidation requests from beacons. Invalidation
/// keeps the slot and marks it invalid; the ack is idempotent-safe.
pub(crate) fn spawn_invalidation_server(ctx: Arc<EdgeContext>) -> Result<JoinHandle<()>, EdgeError> {
    let mut socket = MsgSocket::bind(
        ctx.fleet.invalidation_server_addr(ctx.edge_id),
        ctx.recv_timeout(),
    )?;
    std::thread::Builder::new()
        .name(format!("edge{}-invalidation", ctx.edge_id))
        .spawn(move || {
            while ctx.running.is_running() {
                let msg = match socket.recv_msg() {
                    Ok(Some((msg, _))) => msg,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(edge = ctx.edge_id, %err, "invalidation socket failed");
                        std::process::exit(1);
                    }
                };
                match &msg.kind {
                    MsgKind::InvalidationRequest { key } => {
                        ctx.cache.invalidate(key);
                        let rsp = Message::new(
                            MsgKind::InvalidationResponse { key: key.clone() },
                            ctx.edge_id,
                            socket.local_addr(),
                        );
                        ctx.to_edge.push_wait(rsp, msg.source_addr).ok();
                    }
                    other => {
                        error!(
                            edge = ctx.edge_id,
                            tag = other.tag(),
                            "invalid message type on invalidation socket"
                        );
                        std::process::exit(1);
                    }
                }
            }
        })
        .map_err(EdgeError::Spawn)
}

/// Handles placement notifications: admit the pushed value locally and
/// publish the directory entry, evicting back under capacity.
pub(crate) fn spawn_placement_processor(
    ctx: Arc<EdgeContext>,
    rx: flume::Receiver<Message>,
) -> Result<JoinHandle<()>, EdgeError> {
    let mut socket = MsgSocket::bind_ephemeral(ctx.fleet.edge_ip(ctx.edge_id), ctx.recv_timeout())?;
    std::thread::Builder::new()
        .name(format!("edge{}-placement", ctx.edge_id))
        .spawn(move || {
            while ctx.running.is_running() {
                let msg = match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(msg) => msg,
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                };
                let MsgKind::PlacementNotifyRequest { key, value } = msg.kind.clone() else {
                    error!(tag = msg.kind.tag(), "invalid message type on placement queue");
                    std::process::exit(1);
                };
                ctx.absorb_sync(&msg.sync);
                // A placement always creates an additional copy somewhere,
                // so the admitted entry starts without last-copy status.
                match admit_with_directory(&ctx, &mut socket, &key, value, true) {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(err) => {
                        error!(edge = ctx.edge_id, %err, "placement admission failed");
                        std::process::exit(1);
                    }
                }
                let rsp = Message::new(
                    MsgKind::PlacementNotifyResponse { key },
                    ctx.edge_id,
                    socket.local_addr(),
                );
                ctx.to_edge.push_wait(rsp, msg.source_addr).ok();
            }
        })
        .map_err(EdgeError::Spawn)
}

/// Handles neighbor-cached metadata updates pushed by beacons.
pub(crate) fn spawn_metadata_processor(
    ctx: Arc<EdgeContext>,
    rx: flume::Receiver<Message>,
) -> Result<JoinHandle<()>, EdgeError> {
    let socket = MsgSocket::bind_ephemeral(ctx.fleet.edge_ip(ctx.edge_id), ctx.recv_timeout())?;
    std::thread::Builder::new()
        .name(format!("edge{}-metadata", ctx.edge_id))
        .spawn(move || {
            while ctx.running.is_running() {
                let msg = match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(msg) => msg,
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                };
                let MsgKind::MetadataUpdateRequest {
                    key,
                    is_neighbor_cached,
                } = msg.kind.clone()
                else {
                    error!(tag = msg.kind.tag(), "invalid message type on metadata queue");
                    std::process::exit(1);
                };
                if !ctx.cache.set_neighbor_cached(&key, is_neighbor_cached) {
                    debug!(edge = ctx.edge_id, ?key, "metadata update for an uncached key");
                }
                let rsp = Message::new(
                    MsgKind::MetadataUpdateResponse { key },
                    ctx.edge_id,
                    socket.local_addr(),
                );
                ctx.to_edge.push_wait(rsp, msg.source_addr).ok();
            }
        })
        .map_err(EdgeError::Spawn)
}

/// The beacon-side background pipeline: hybrid data fetching and placement
/// deployment, plus neighbor-cached fan-out.
pub(crate) fn spawn_deployer(
    ctx: Arc<EdgeContext>,
    rx: flume::Receiver<BackgroundJob>,
) -> Result<JoinHandle<()>, EdgeError> {
    let mut socket = MsgSocket::bind_ephemeral(ctx.fleet.edge_ip(ctx.edge_id), ctx.recv_timeout())?;
    std::thread::Builder::new()
        .name(format!("edge{}-deployer", ctx.edge_id))
        .spawn(move || {
            while ctx.running.is_running() {
                let job = match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(job) => job,
                    Err(flume::RecvTimeoutError::Timeout) => continue,
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                };
                let result = match job {
                    BackgroundJob::Placement { key, edgeset } => {
                        deploy_placement(&ctx, &mut socket, &key, &edgeset)
                    }
                    BackgroundJob::MetadataUpdate {
                        key,
                        edge,
                        is_neighbor_cached,
                    } => push_metadata_update(&ctx, &mut socket, &key, edge, is_neighbor_cached),
                };
                match result {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        error!(edge = ctx.edge_id, %err, "background pipeline failed");
                        std::process::exit(1);
                    }
                }
            }
        })
        .map_err(EdgeError::Spawn)
}

/// Fetch the value (cacher or origin) and admit it on every target edge.
/// Returns `false` when shutdown interrupted the pipeline.
fn deploy_placement(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
    edgeset: &[EdgeId],
) -> Result<bool, EdgeError> {
    debug!(edge = ctx.edge_id, ?key, ?edgeset, "deploying placement");
    let Some(value) = hybrid_fetch(ctx, socket, key)? else {
        return Ok(false);
    };
    if value.is_deleted() {
        debug!(?key, "placement target deleted upstream; skipping");
        return Ok(true);
    }

    for &target in edgeset {
        if target == ctx.edge_id {
            if admit_with_directory(ctx, socket, key, value.clone(), edgeset.len() > 1)?.is_none() {
                return Ok(false);
            }
            continue;
        }
        let req = Message::new(
            MsgKind::PlacementNotifyRequest {
                key: key.clone(),
                value: value.clone(),
            },
            ctx.edge_id,
            socket.local_addr(),
        );
        let expect = key.clone();
        let dst = ctx.fleet.cache_server_addr(target);
        let ack = request_ack(ctx, socket, &ctx.to_edge, req, dst, move |kind| {
            matches!(kind, MsgKind::PlacementNotifyResponse { key: k } if *k == expect)
        })?;
        if ack.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Fetch the placement value from a current cacher if the directory names
/// one, falling back to the origin.
fn hybrid_fetch(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
) -> Result<Option<Value>, EdgeError> {
    // The local copy, when valid, needs no traffic at all.
    if let GetResult::Hit(value) = ctx.cache.peek(key) {
        return Ok(Some(value));
    }

    let lookup = ctx.cooperation.lookup(key, ctx.edge_id, None);
    if let Some(target) = lookup.dirinfo {
        let req = Message::new(
            MsgKind::RedirectedGetRequest { key: key.clone() },
            ctx.edge_id,
            socket.local_addr(),
        );
        let expect = key.clone();
        let dst = ctx.fleet.cache_server_addr(target.edge);
        let ack = request_ack(ctx, socket, &ctx.to_edge, req, dst, move |kind| {
            matches!(kind, MsgKind::RedirectedGetResponse { key: k, .. } if *k == expect)
        })?;
        match ack {
            Some(msg) => {
                if let MsgKind::RedirectedGetResponse { value, hitflag, .. } = msg.kind {
                    ctx.counter.add_bandwidth(&msg.bandwidth);
                    if hitflag == Hitflag::CooperativeHit {
                        return Ok(Some(value));
                    }
                    // Invalid or stale copy: fall through to the origin.
                }
            }
            None => return Ok(None),
        }
    }

    let req = Message::new(
        MsgKind::GlobalGetRequest { key: key.clone() },
        ctx.edge_id,
        socket.local_addr(),
    );
    let expect = key.clone();
    let ack = request_ack(
        ctx,
        socket,
        &ctx.to_cloud,
        req,
        ctx.fleet.cloud_addr(),
        move |kind| matches!(kind, MsgKind::GlobalGetResponse { key: k, .. } if *k == expect),
    )?;
    match ack {
        Some(msg) => match msg.kind {
            MsgKind::GlobalGetResponse { value, .. } => Ok(Some(value)),
            _ => unreachable!("accept matched GlobalGetResponse"),
        },
        None => Ok(None),
    }
}

/// Deliver one neighbor-cached flag flip, locally or to a peer.
fn push_metadata_update(
    ctx: &EdgeContext,
    socket: &mut MsgSocket,
    key: &Key,
    edge: EdgeId,
    is_neighbor_cached: bool,
) -> Result<bool, EdgeError> {
    if edge == ctx.edge_id {
        if !ctx.cache.set_neighbor_cached(key, is_neighbor_cached) {
            warn!(edge, ?key, "neighbor-cached update for an uncached local key");
        }
        return Ok(true);
    }
    let req = Message::new(
        MsgKind::MetadataUpdateRequest {
            key: key.clone(),
            is_neighbor_cached,
        },
        ctx.edge_id,
        socket.local_addr(),
    );
    let expect = key.clone();
    let dst = ctx.fleet.cache_server_addr(edge);
    let ack = request_ack(ctx, socket, &ctx.to_edge, req, dst, move |kind| {
        matches!(kind, MsgKind::MetadataUpdateResponse { key: k } if *k == expect)
    })?;
    Ok(ack.is_some())
}
