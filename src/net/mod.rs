// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! UDP transport: addressing, datagram fragmentation/reassembly, message
//! sockets, and the per-link propagation queues used for in-process runs.

mod fragment;
mod propagation;
mod socket;

pub use fragment::{FragHeader, ReassemblyBuffer, FRAG_HEADER_SIZE, MAX_FRAGMENT_PAYLOAD};
pub use propagation::{spawn_propagation_thread, PropagationHandle, PropagationQueue};
pub use socket::MsgSocket;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use thiserror::Error;

/// Wire-encodable IPv4 endpoint (4 address bytes + 2 port bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Size of an inlined [`NetworkAddr`] on the wire.
pub const ADDR_WIRE_SIZE: usize = 6;

impl NetworkAddr {
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        NetworkAddr { ip, port }
    }

    pub const fn localhost(port: u16) -> Self {
        NetworkAddr::new(Ipv4Addr::LOCALHOST, port)
    }

    /// Placeholder used before a real source address is known.
    pub const fn unspecified() -> Self {
        NetworkAddr::new(Ipv4Addr::UNSPECIFIED, 0)
    }

    pub fn is_valid(&self) -> bool {
        self.port != 0
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl From<SocketAddrV4> for NetworkAddr {
    fn from(addr: SocketAddrV4) -> Self {
        NetworkAddr::new(*addr.ip(), addr.port())
    }
}

impl TryFrom<SocketAddr> for NetworkAddr {
    type Error = NetError;

    fn try_from(addr: SocketAddr) -> Result<Self, NetError> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(_) => Err(NetError::Ipv6Unsupported),
        }
    }
}

impl fmt::Display for NetworkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("IPv6 endpoints are not supported")]
    Ipv6Unsupported,
    #[error("message codec error: {0}")]
    Codec(#[from] crate::message::CodecError),
    #[error("propagation queue is full")]
    QueueFull,
    #[error("propagation queue is closed")]
    QueueClosed,
}
