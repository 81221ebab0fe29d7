// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Beacon server: handles directory and write-lock traffic for the keys
//! this node beacons. The handlers are shared with cache-server workers so
//! the beacon-local fast path (no RPC) folds piggybacked COVERED state the
//! same way remote requests do.

use std::sync::Arc;
use std::thread::JoinHandle;

use ahash::HashSet;
use tracing::{error, warn};

use super::{broadcast_finish_block, broadcast_invalidation, EdgeContext, EdgeError};
use crate::cooperation::{AcquireOutcome, LookupOutcome};
use crate::covered::BackgroundJob;
use crate::message::{CoveredSync, Message, MsgKind};
use crate::net::{MsgSocket, NetworkAddr};
use crate::types::{DirectoryInfo, EdgeId, Key, LockResult};

/// Apply piggybacked COVERED state in order: victim sync first, so the
/// placement calculation sees the latest synced victims, then popularity
/// aggregation, which may yield a placement to deploy.
fn fold_covered(
    ctx: &EdgeContext,
    key: &Key,
    source: EdgeId,
    sync: &CoveredSync,
    is_source_cached: bool,
    want_placement: bool,
) {
    let Some(manager) = &ctx.covered else {
        return;
    };
    if let Some(victims) = &sync.victims {
        manager.apply_victim_syncset(victims);
    }
    if let Some(collected) = &sync.popularity {
        if let Some(edgeset) =
            manager.fold_popularity(key, source, *collected, is_source_cached, want_placement)
        {
            ctx.enqueue_background(BackgroundJob::Placement {
                key: key.clone(),
                edgeset,
            });
        }
    }
}

/// Victim-syncset-only trailer for beacon responses.
fn response_sync(ctx: &EdgeContext) -> CoveredSync {
    CoveredSync {
        victims: ctx
            .covered
            .as_ref()
            .and_then(|manager| manager.local_victim_syncset(&ctx.cache)),
        popularity: None,
        edgeset: None,
    }
}

pub(crate) fn handle_lookup_local(
    ctx: &EdgeContext,
    key: &Key,
    source: EdgeId,
    wake_addr: Option<NetworkAddr>,
    sync: &CoveredSync,
) -> LookupOutcome {
    let outcome = ctx.cooperation.lookup(key, source, wake_addr);
    fold_covered(ctx, key, source, sync, outcome.is_source_cached, true);
    outcome
}

pub(crate) fn handle_update_local(
    ctx: &EdgeContext,
    key: &Key,
    is_admit: bool,
    dirinfo: DirectoryInfo,
    sync: &CoveredSync,
) -> bool {
    let outcome = ctx.cooperation.update(key, is_admit, dirinfo);
    if let Some(manager) = &ctx.covered {
        if let Some(victims) = &sync.victims {
            manager.apply_victim_syncset(victims);
        }
        if is_admit {
            // The admitting edge stops reporting uncached popularity.
            manager.clear_after_admission(key, dirinfo.edge);
            match outcome.cachers.len() {
                // The second copy appears: both cachers lose last-copy
                // status.
                2 => {
                    for cacher in &outcome.cachers {
                        ctx.enqueue_background(BackgroundJob::MetadataUpdate {
                            key: key.clone(),
                            edge: cacher.edge,
                            is_neighbor_cached: true,
                        });
                    }
                }
                n if n > 2 => {
                    ctx.enqueue_background(BackgroundJob::MetadataUpdate {
                        key: key.clone(),
                        edge: dirinfo.edge,
                        is_neighbor_cached: true,
                    });
                }
                _ => {}
            }
        } else {
            // The eviction may leave a single last copy behind.
            if let [last] = outcome.cachers.as_slice() {
                ctx.enqueue_background(BackgroundJob::MetadataUpdate {
                    key: key.clone(),
                    edge: last.edge,
                    is_neighbor_cached: false,
                });
            }
            fold_covered(ctx, key, dirinfo.edge, sync, outcome.is_source_cached, true);
        }
    }
    outcome.being_written
}

pub(crate) fn handle_acquire_local(
    ctx: &EdgeContext,
    key: &Key,
    writer: EdgeId,
    wake_addr: Option<NetworkAddr>,
    sync: &CoveredSync,
) -> AcquireOutcome {
    let outcome = ctx.cooperation.try_acquire(key, writer, wake_addr);
    // Newly admitted copies would be invalid mid-write, so no placement is
    // calculated for acquire traffic.
    let is_source_cached = outcome
        .replicas
        .iter()
        .any(|replica| replica.edge == writer);
    fold_covered(ctx, key, writer, sync, is_source_cached, false);
    outcome
}

pub(crate) fn handle_release_local(
    ctx: &EdgeContext,
    key: &Key,
    writer: EdgeId,
    sync: &CoveredSync,
) -> HashSet<NetworkAddr> {
    let blocked = ctx.cooperation.release(key, writer);
    // A releasing writer holds a copy, so its popularity report is moot,
    // but eviction-driven placement may still be due.
    fold_covered(ctx, key, writer, sync, true, true);
    blocked
}

pub(crate) fn spawn(ctx: Arc<EdgeContext>) -> Result<JoinHandle<()>, EdgeError> {
    let mut socket = MsgSocket::bind(
        ctx.fleet.beacon_server_addr(ctx.edge_id),
        ctx.recv_timeout(),
    )?;
    let mut fanout = MsgSocket::bind_ephemeral(
        ctx.fleet.edge_ip(ctx.edge_id),
        ctx.recv_timeout(),
    )?;
    std::thread::Builder::new()
        .name(format!("edge{}-beacon", ctx.edge_id))
        .spawn(move || run(ctx, &mut socket, &mut fanout))
        .map_err(EdgeError::Spawn)
}

fn run(ctx: Arc<EdgeContext>, socket: &mut MsgSocket, fanout: &mut MsgSocket) {
    while ctx.running.is_running() {
        let msg = match socket.recv_msg() {
            Ok(Some((msg, _))) => msg,
            Ok(None) => continue,
            Err(err) => {
                error!(edge = ctx.edge_id, %err, "beacon server socket failed");
                std::process::exit(1);
            }
        };
        ctx.counter.add_events(&msg.events);
        if handle_request(&ctx, fanout, msg).is_err() {
            error!(edge = ctx.edge_id, "beacon server send failed");
            std::process::exit(1);
        }
    }
}

fn handle_request(
    ctx: &EdgeContext,
    fanout: &mut MsgSocket,
    msg: Message,
) -> Result<(), EdgeError> {
    let source = msg.source_edge;
    let reply_to = msg.source_addr;
    match msg.kind.clone() {
        MsgKind::DirectoryLookupRequest { key } => {
            let outcome = handle_lookup_local(ctx, &key, source, Some(reply_to), &msg.sync);
            // The response goes out even while a write is in flight; the
            // requester then blocks for the finish-block wake.
            let mut rsp = Message::new(
                MsgKind::DirectoryLookupResponse {
                    key,
                    being_written: outcome.being_written,
                    dirinfo: outcome.dirinfo,
                },
                ctx.edge_id,
                fanout.local_addr(),
            );
            rsp.sync = response_sync(ctx);
            ctx.to_edge.push_wait(rsp, reply_to).ok();
        }
        MsgKind::DirectoryUpdateRequest {
            key,
            is_admit,
            dirinfo,
        } => {
            if dirinfo.edge != source {
                warn!(
                    edge = ctx.edge_id,
                    source,
                    claimed = dirinfo.edge,
                    "directory update for a different edge"
                );
            }
            let being_written = handle_update_local(ctx, &key, is_admit, dirinfo, &msg.sync);
            let mut rsp = Message::new(
                MsgKind::DirectoryUpdateResponse { key, being_written },
                ctx.edge_id,
                fanout.local_addr(),
            );
            rsp.sync = response_sync(ctx);
            ctx.to_edge.push_wait(rsp, reply_to).ok();
        }
        MsgKind::AcquireWritelockRequest { key } => {
            let outcome = handle_acquire_local(ctx, &key, source, Some(reply_to), &msg.sync);
            match outcome.result {
                LockResult::Success => {
                    // The writer only learns of success after every replica
                    // is quiescent.
                    match broadcast_invalidation(ctx, fanout, &key, &outcome.replicas, Some(source))
                    {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(err) => return Err(err),
                    }
                    let mut rsp = Message::new(
                        MsgKind::AcquireWritelockResponse {
                            key,
                            result: LockResult::Success,
                        },
                        ctx.edge_id,
                        fanout.local_addr(),
                    );
                    rsp.sync = response_sync(ctx);
                    ctx.to_edge.push_wait(rsp, reply_to).ok();
                }
                LockResult::NoNeed => {
                    let mut rsp = Message::new(
                        MsgKind::AcquireWritelockResponse {
                            key,
                            result: LockResult::NoNeed,
                        },
                        ctx.edge_id,
                        fanout.local_addr(),
                    );
                    rsp.sync = response_sync(ctx);
                    ctx.to_edge.push_wait(rsp, reply_to).ok();
                }
                // No reply: the requester is blocked and will be woken by a
                // finish-block request when the writer releases.
                LockResult::Failure => {}
            }
        }
        MsgKind::ReleaseWritelockRequest { key } => {
            let blocked = handle_release_local(ctx, &key, source, &msg.sync);
            match broadcast_finish_block(ctx, fanout, &key, &blocked) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => return Err(err),
            }
            let mut rsp = Message::new(
                MsgKind::ReleaseWritelockResponse { key },
                ctx.edge_id,
                fanout.local_addr(),
            );
            rsp.sync = response_sync(ctx);
            ctx.to_edge.push_wait(rsp, reply_to).ok();
        }
        other => {
            error!(
                edge = ctx.edge_id,
                tag = other.tag(),
                "invalid message type on beacon socket"
            );
            std::process::exit(1);
        }
    }
    Ok(())
}
