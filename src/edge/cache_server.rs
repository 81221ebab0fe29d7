// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Cache-server ingress: one dispatcher thread receives on the data socket
//! and routes by message type. Data requests hash their key to one of `W`
//! worker queues, so every operation on a key executes in arrival order on
//! a single worker and no per-key mutex is needed on the hot path.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, warn};

use super::{processors, worker, EdgeContext, EdgeError};
use crate::message::Message;
use crate::net::MsgSocket;

/// Queue depth per worker/processor class.
const QUEUE_DEPTH: usize = 1024;

fn worker_index(key: &crate::types::Key, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

pub(crate) fn spawn(ctx: Arc<EdgeContext>) -> Result<Vec<JoinHandle<()>>, EdgeError> {
    let worker_count = ctx.config.worker_count();
    let mut handles = Vec::new();

    let mut worker_txs = Vec::with_capacity(worker_count);
    for idx in 0..worker_count {
        let (tx, rx) = flume::bounded::<Message>(QUEUE_DEPTH);
        worker_txs.push(tx);
        let worker = worker::Worker::new(ctx.clone(), idx, rx)?;
        handles.push(
            std::thread::Builder::new()
                .name(format!("edge{}-worker{idx}", ctx.edge_id))
                .spawn(move || worker.run())
                .map_err(EdgeError::Spawn)?,
        );
    }

    let (placement_tx, placement_rx) = flume::bounded::<Message>(QUEUE_DEPTH);
    handles.push(processors::spawn_placement_processor(
        ctx.clone(),
        placement_rx,
    )?);

    let (metadata_tx, metadata_rx) = flume::bounded::<Message>(QUEUE_DEPTH);
    handles.push(processors::spawn_metadata_processor(
        ctx.clone(),
        metadata_rx,
    )?);

    let dispatcher_ctx = ctx.clone();
    let mut socket = MsgSocket::bind(
        ctx.fleet.cache_server_addr(ctx.edge_id),
        ctx.recv_timeout(),
    )?;
    handles.push(
        std::thread::Builder::new()
            .name(format!("edge{}-dispatcher", ctx.edge_id))
            .spawn(move || {
                dispatch_loop(
                    dispatcher_ctx,
                    &mut socket,
                    worker_txs,
                    placement_tx,
                    metadata_tx,
                )
            })
            .map_err(EdgeError::Spawn)?,
    );

    Ok(handles)
}

fn dispatch_loop(
    ctx: Arc<EdgeContext>,
    socket: &mut MsgSocket,
    worker_txs: Vec<flume::Sender<Message>>,
    placement_tx: flume::Sender<Message>,
    metadata_tx: flume::Sender<Message>,
) {
    use crate::message::MsgKind::*;
    while ctx.running.is_running() {
        let msg = match socket.recv_msg() {
            Ok(Some((msg, _))) => msg,
            Ok(None) => continue,
            Err(err) => {
                error!(edge = ctx.edge_id, %err, "cache server socket failed");
                std::process::exit(1);
            }
        };
        match &msg.kind {
            LocalGetRequest { key }
            | LocalPutRequest { key, .. }
            | LocalDelRequest { key }
            | RedirectedGetRequest { key } => {
                let idx = worker_index(key, worker_txs.len());
                if worker_txs[idx].send(msg).is_err() {
                    return;
                }
            }
            PlacementNotifyRequest { .. } => {
                if placement_tx.send(msg).is_err() {
                    return;
                }
            }
            MetadataUpdateRequest { .. } => {
                if metadata_tx.send(msg).is_err() {
                    return;
                }
            }
            other if other.is_benchmark_control() => {
                warn!(
                    edge = ctx.edge_id,
                    tag = other.tag(),
                    "benchmark control message on the data socket; ignoring"
                );
            }
            other => {
                error!(
                    edge = ctx.edge_id,
                    tag = other.tag(),
                    "invalid message type on cache server socket"
                );
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Key;

    #[test]
    fn same_key_always_maps_to_same_worker() {
        let key = Key::from("stable");
        let first = worker_index(&key, 7);
        for _ in 0..10 {
            assert_eq!(worker_index(&key, 7), first);
        }
    }

    #[test]
    fn keys_spread_across_workers() {
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            seen.insert(worker_index(&Key::from(format!("k{i}").as_str()), 8));
        }
        assert!(seen.len() > 1);
    }
}
