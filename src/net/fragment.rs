// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Datagram fragmentation. Message payloads larger than a single UDP packet
//! are split into fragments, each prefixed by a header carrying the fragment
//! index/count, the total payload size, a per-sender sequence number, and the
//! sender's logical source address used to key server-side reassembly.

use std::net::Ipv4Addr;

use ahash::HashMap;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use super::{NetworkAddr, ADDR_WIRE_SIZE};

/// Fixed-size numeric part of the fragment header.
const NUMERIC_HEADER_SIZE: usize = 16;

/// Total bytes prepended to every fragment: four u32 fields plus the inlined
/// source address.
pub const FRAG_HEADER_SIZE: usize = NUMERIC_HEADER_SIZE + ADDR_WIRE_SIZE;

/// Conservative Ethernet-safe UDP payload bound.
pub const MAX_PACKET_SIZE: usize = 1472;

/// Message bytes carried by one fragment.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_PACKET_SIZE - FRAG_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHeader {
    pub fragment_idx: u32,
    pub fragment_cnt: u32,
    pub msg_payload_size: u32,
    pub msg_seqnum: u32,
    pub source: NetworkAddr,
}

impl FragHeader {
    pub fn write(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAG_HEADER_SIZE);
        BigEndian::write_u32(&mut buf[0..4], self.fragment_idx);
        BigEndian::write_u32(&mut buf[4..8], self.fragment_cnt);
        BigEndian::write_u32(&mut buf[8..12], self.msg_payload_size);
        BigEndian::write_u32(&mut buf[12..16], self.msg_seqnum);
        buf[16..20].copy_from_slice(&self.source.ip.octets());
        BigEndian::write_u16(&mut buf[20..22], self.source.port);
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAG_HEADER_SIZE {
            return None;
        }
        let ip = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
        Some(FragHeader {
            fragment_idx: BigEndian::read_u32(&buf[0..4]),
            fragment_cnt: BigEndian::read_u32(&buf[4..8]),
            msg_payload_size: BigEndian::read_u32(&buf[8..12]),
            msg_seqnum: BigEndian::read_u32(&buf[12..16]),
            source: NetworkAddr::new(ip, BigEndian::read_u16(&buf[20..22])),
        })
    }
}

/// Split an encoded message into ready-to-send packets.
pub fn fragment_message(payload: &[u8], seqnum: u32, source: NetworkAddr) -> Vec<Vec<u8>> {
    let fragment_cnt = payload.len().div_ceil(MAX_FRAGMENT_PAYLOAD).max(1) as u32;
    let mut packets = Vec::with_capacity(fragment_cnt as usize);
    for idx in 0..fragment_cnt {
        let start = idx as usize * MAX_FRAGMENT_PAYLOAD;
        let end = (start + MAX_FRAGMENT_PAYLOAD).min(payload.len());
        let header = FragHeader {
            fragment_idx: idx,
            fragment_cnt,
            msg_payload_size: payload.len() as u32,
            msg_seqnum: seqnum,
            source,
        };
        let mut packet = vec![0u8; FRAG_HEADER_SIZE + (end - start)];
        header.write(&mut packet);
        packet[FRAG_HEADER_SIZE..].copy_from_slice(&payload[start..end]);
        packets.push(packet);
    }
    packets
}

#[derive(Debug)]
struct PartialMessage {
    seqnum: u32,
    payload: Vec<u8>,
    received: Vec<bool>,
    remaining: u32,
}

/// Per-sender reassembly state. At most one in-progress message is kept per
/// source; a fragment with a newer sequence number discards the older set,
/// and fragments older than the current set are dropped.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    partial: HashMap<NetworkAddr, PartialMessage>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received packet. Returns the complete message payload and
    /// the logical source address once the last fragment arrives.
    pub fn insert(&mut self, packet: &[u8]) -> Option<(Bytes, NetworkAddr)> {
        let header = FragHeader::read(packet)?;
        let body = &packet[FRAG_HEADER_SIZE..];

        if header.fragment_cnt == 1 {
            // Single-fragment fast path; also supersedes any stale partial
            // state from the same sender.
            self.partial.remove(&header.source);
            if body.len() != header.msg_payload_size as usize {
                return None;
            }
            return Some((Bytes::copy_from_slice(body), header.source));
        }

        let fresh = match self.partial.get(&header.source) {
            Some(existing) if existing.seqnum == header.msg_seqnum => false,
            // Stale fragment of an abandoned message.
            Some(existing) if existing.seqnum > header.msg_seqnum => return None,
            _ => true,
        };
        if fresh {
            self.partial.insert(
                header.source,
                PartialMessage {
                    seqnum: header.msg_seqnum,
                    payload: vec![0u8; header.msg_payload_size as usize],
                    received: vec![false; header.fragment_cnt as usize],
                    remaining: header.fragment_cnt,
                },
            );
        }
        let entry = self.partial.get_mut(&header.source).expect("present");

        let idx = header.fragment_idx as usize;
        if idx >= entry.received.len() || entry.received[idx] {
            return None;
        }
        let offset = idx * MAX_FRAGMENT_PAYLOAD;
        if offset + body.len() > entry.payload.len() {
            return None;
        }
        entry.payload[offset..offset + body.len()].copy_from_slice(body);
        entry.received[idx] = true;
        entry.remaining -= 1;

        if entry.remaining == 0 {
            let done = self.partial.remove(&header.source).expect("present");
            Some((Bytes::from(done.payload), header.source))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> NetworkAddr {
        NetworkAddr::localhost(port)
    }

    #[test]
    fn header_round_trip() {
        let header = FragHeader {
            fragment_idx: 3,
            fragment_cnt: 7,
            msg_payload_size: 9001,
            msg_seqnum: 42,
            source: addr(5555),
        };
        let mut buf = [0u8; FRAG_HEADER_SIZE];
        header.write(&mut buf);
        assert_eq!(FragHeader::read(&buf), Some(header));
    }

    #[test]
    fn single_fragment_message() {
        let mut buffer = ReassemblyBuffer::new();
        let packets = fragment_message(b"hello", 1, addr(4000));
        assert_eq!(packets.len(), 1);
        let (payload, source) = buffer.insert(&packets[0]).expect("complete");
        assert_eq!(&payload[..], b"hello");
        assert_eq!(source, addr(4000));
    }

    #[test]
    fn multi_fragment_out_of_order() {
        let mut buffer = ReassemblyBuffer::new();
        let payload: Vec<u8> = (0..MAX_FRAGMENT_PAYLOAD * 2 + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        let mut packets = fragment_message(&payload, 7, addr(4001));
        assert_eq!(packets.len(), 3);
        packets.reverse();
        assert!(buffer.insert(&packets[0]).is_none());
        assert!(buffer.insert(&packets[1]).is_none());
        let (got, _) = buffer.insert(&packets[2]).expect("complete");
        assert_eq!(&got[..], &payload[..]);
    }

    #[test]
    fn newer_seqnum_discards_older_partial() {
        let mut buffer = ReassemblyBuffer::new();
        let payload: Vec<u8> = vec![1u8; MAX_FRAGMENT_PAYLOAD * 2];
        let old = fragment_message(&payload, 1, addr(4002));
        let new = fragment_message(&payload, 2, addr(4002));
        assert!(buffer.insert(&old[0]).is_none());
        // Newer message starts; the old set is abandoned.
        assert!(buffer.insert(&new[0]).is_none());
        // The straggler from the old set is dropped.
        assert!(buffer.insert(&old[1]).is_none());
        let done = buffer.insert(&new[1]);
        assert!(done.is_some());
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut buffer = ReassemblyBuffer::new();
        let payload: Vec<u8> = vec![2u8; MAX_FRAGMENT_PAYLOAD + 1];
        let packets = fragment_message(&payload, 5, addr(4003));
        assert!(buffer.insert(&packets[0]).is_none());
        assert!(buffer.insert(&packets[0]).is_none());
        assert!(buffer.insert(&packets[1]).is_some());
    }
}
