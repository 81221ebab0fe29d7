// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use tracing::warn;

use super::fragment::{fragment_message, ReassemblyBuffer, MAX_PACKET_SIZE};
use super::{NetError, NetworkAddr};
use crate::message::Message;

/// Message-granularity UDP socket: sends fragment messages larger than one
/// packet and reassembles on receive. Receive timeouts are how every retry
/// loop observes the shutdown flag, so the socket always has one configured.
pub struct MsgSocket {
    socket: UdpSocket,
    local: NetworkAddr,
    reassembly: ReassemblyBuffer,
    next_seqnum: u32,
}

impl MsgSocket {
    /// Bind to a fixed address (server sockets).
    pub fn bind(addr: NetworkAddr, recv_timeout: Duration) -> Result<Self, NetError> {
        Self::bind_inner(addr, recv_timeout)
    }

    /// Bind to an OS-assigned port (per-worker response sockets).
    pub fn bind_ephemeral(ip: Ipv4Addr, recv_timeout: Duration) -> Result<Self, NetError> {
        Self::bind_inner(NetworkAddr::new(ip, 0), recv_timeout)
    }

    fn bind_inner(addr: NetworkAddr, recv_timeout: Duration) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(addr.to_socket_addr())?;
        socket.set_read_timeout(Some(recv_timeout))?;
        let local = NetworkAddr::try_from(socket.local_addr()?)?;
        Ok(MsgSocket {
            socket,
            local,
            reassembly: ReassemblyBuffer::new(),
            next_seqnum: 0,
        })
    }

    /// Address this socket is reachable on; inlined as the logical source of
    /// outgoing fragments when the message does not carry one.
    pub fn local_addr(&self) -> NetworkAddr {
        self.local
    }

    /// Encode, fragment and send one message.
    pub fn send_msg(&mut self, msg: &Message, dst: NetworkAddr) -> Result<(), NetError> {
        let payload = msg.encode();
        let source = if msg.source_addr.is_valid() {
            msg.source_addr
        } else {
            self.local
        };
        let seqnum = self.next_seqnum;
        self.next_seqnum = self.next_seqnum.wrapping_add(1);
        for packet in fragment_message(&payload, seqnum, source) {
            self.socket.send_to(&packet, dst.to_socket_addr())?;
        }
        Ok(())
    }

    /// Receive one complete message. Returns `Ok(None)` on timeout so callers
    /// can poll the running flag and retry.
    pub fn recv_msg(&mut self) -> Result<Option<(Message, NetworkAddr)>, NetError> {
        let mut packet = [0u8; MAX_PACKET_SIZE];
        loop {
            let len = match self.socket.recv_from(&mut packet) {
                Ok((len, _)) => len,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            };
            let Some((payload, source)) = self.reassembly.insert(&packet[..len]) else {
                // Incomplete message; keep reading until timeout.
                continue;
            };
            match Message::decode(&payload) {
                Ok(msg) => return Ok(Some((msg, source))),
                Err(err) => {
                    warn!(%source, %err, "dropping undecodable message");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, MsgKind};
    use crate::types::Key;

    #[test]
    fn send_and_recv_round_trip() {
        let mut server =
            MsgSocket::bind_ephemeral(Ipv4Addr::LOCALHOST, Duration::from_millis(500)).unwrap();
        let mut client =
            MsgSocket::bind_ephemeral(Ipv4Addr::LOCALHOST, Duration::from_millis(500)).unwrap();

        let msg = Message::new(
            MsgKind::LocalGetRequest { key: Key::from("k") },
            3,
            client.local_addr(),
        );
        client.send_msg(&msg, server.local_addr()).unwrap();

        let (got, source) = server.recv_msg().unwrap().expect("message");
        assert_eq!(source, client.local_addr());
        assert_eq!(got.source_edge, 3);
        match got.kind {
            MsgKind::LocalGetRequest { key } => assert_eq!(key, Key::from("k")),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn recv_times_out_without_traffic() {
        let mut server =
            MsgSocket::bind_ephemeral(Ipv4Addr::LOCALHOST, Duration::from_millis(50)).unwrap();
        assert!(server.recv_msg().unwrap().is_none());
    }

    #[test]
    fn large_message_is_fragmented_and_reassembled() {
        let mut server =
            MsgSocket::bind_ephemeral(Ipv4Addr::LOCALHOST, Duration::from_millis(500)).unwrap();
        let mut client =
            MsgSocket::bind_ephemeral(Ipv4Addr::LOCALHOST, Duration::from_millis(500)).unwrap();

        let big = vec![0xabu8; 10_000];
        let msg = Message::new(
            MsgKind::GlobalPutRequest {
                key: Key::from("big"),
                value: crate::types::Value::new(big.clone()),
            },
            0,
            client.local_addr(),
        );
        client.send_msg(&msg, server.local_addr()).unwrap();
        let (got, _) = server.recv_msg().unwrap().expect("message");
        match got.kind {
            MsgKind::GlobalPutRequest { value, .. } => assert_eq!(value.data(), &big[..]),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
}
