// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Node roles and run lifecycle shared by edge and cloud nodes.
//!
//! Every timeout-and-retry loop in the system polls the shared [`Running`]
//! flag; shutdown is cooperative and there is no forced thread cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::message::{Message, MsgKind};
use crate::net::{MsgSocket, NetError, NetworkAddr};
use crate::types::EdgeId;

/// Role a process plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Client,
    Edge,
    Cloud,
}

/// Shared shutdown flag. Starts `true`; `shutdown()` is observed by every
/// retry/poll point, after which loops unwind cleanly.
#[derive(Debug, Clone, Default)]
pub struct Running(Arc<AtomicBool>);

impl Running {
    pub fn new() -> Self {
        Running(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Benchmark control handshake processed by both node roles: the harness
/// drives initialization/start/slot-switch, and a finish-run request drops
/// the running flag before the node acks with a finish-run response.
pub fn handle_control_request(
    msg: &Message,
    node_idx: EdgeId,
    source_addr: NetworkAddr,
    running: &Running,
) -> Option<Message> {
    match &msg.kind {
        MsgKind::InitializationRequest => Some(Message::new(
            MsgKind::InitializationResponse,
            node_idx,
            source_addr,
        )),
        MsgKind::StartrunRequest => {
            info!(node = node_idx, "run started");
            Some(Message::new(MsgKind::StartrunResponse, node_idx, source_addr))
        }
        MsgKind::SwitchSlotRequest { slot } => Some(Message::new(
            MsgKind::SwitchSlotResponse { slot: *slot },
            node_idx,
            source_addr,
        )),
        MsgKind::FinishrunRequest => {
            info!(node = node_idx, "finish-run requested; shutting down");
            running.shutdown();
            Some(Message::new(
                MsgKind::SimpleFinishrunResponse,
                node_idx,
                source_addr,
            ))
        }
        _ => None,
    }
}

/// Drive a node's control socket until shutdown. Unknown message types on a
/// control socket are a protocol error.
pub fn control_loop(
    mut socket: MsgSocket,
    node_idx: EdgeId,
    running: Running,
) -> Result<(), NetError> {
    let local = socket.local_addr();
    while running.is_running() {
        let Some((msg, from)) = socket.recv_msg()? else {
            continue;
        };
        match handle_control_request(&msg, node_idx, local, &running) {
            Some(rsp) => socket.send_msg(&rsp, from)?,
            None => {
                tracing::error!(kind = ?msg.kind.tag(), "invalid message type on control socket");
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

/// Default receive timeout for server sockets; short enough that shutdown is
/// observed promptly.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(200);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_flag_toggles_once() {
        let running = Running::new();
        assert!(running.is_running());
        running.shutdown();
        assert!(!running.is_running());
        running.shutdown();
        assert!(!running.is_running());
    }

    #[test]
    fn finishrun_drops_running_flag() {
        let running = Running::new();
        let req = Message::new(
            MsgKind::FinishrunRequest,
            0,
            NetworkAddr::localhost(1),
        );
        let rsp = handle_control_request(&req, 2, NetworkAddr::localhost(9), &running)
            .expect("response");
        assert!(matches!(rsp.kind, MsgKind::SimpleFinishrunResponse));
        assert!(!running.is_running());
    }

    #[test]
    fn data_message_is_not_a_control_request() {
        let running = Running::new();
        let req = Message::new(
            MsgKind::LocalGetRequest {
                key: crate::types::Key::from("x"),
            },
            0,
            NetworkAddr::localhost(1),
        );
        assert!(handle_control_request(&req, 0, NetworkAddr::localhost(9), &running).is_none());
    }
}
