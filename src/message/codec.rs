// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Big-endian binary codec for [`Message`]. Layout:
//! `tag u8 | source_edge u32 | source_addr 6B | trailer_flags u8 | payload |
//! trailers`, with each trailer present iff its flag bit is set.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use thiserror::Error;

use super::{
    CollectedPopularity, CoveredSync, Edgeset, Message, MsgKind, VictimEntry, VictimSyncset,
};
use crate::net::NetworkAddr;
use crate::telemetry::{BandwidthUsage, EventList};
use crate::types::{DirectoryInfo, Hitflag, Key, LockResult, Value};

const FLAG_EVENTS: u8 = 0x01;
const FLAG_BANDWIDTH: u8 = 0x02;
const FLAG_VICTIMS: u8 = 0x04;
const FLAG_POPULARITY: u8 = 0x08;
const FLAG_EDGESET: u8 = 0x10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },
    #[error("event name is not valid utf-8")]
    BadEventName,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.u64()?))
    }

    fn addr(&mut self) -> Result<NetworkAddr, CodecError> {
        let octets = self.take(4)?;
        let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        let port = self.u16()?;
        Ok(NetworkAddr::new(ip, port))
    }

    fn key(&mut self) -> Result<Key, CodecError> {
        let len = self.u32()? as usize;
        Ok(Key::new(Bytes::copy_from_slice(self.take(len)?)))
    }

    fn value(&mut self) -> Result<Value, CodecError> {
        let len = self.u32()? as usize;
        let data = Bytes::copy_from_slice(self.take(len)?);
        let deleted = self.bool()?;
        Ok(Value::from_parts(data, deleted))
    }

    fn hitflag(&mut self) -> Result<Hitflag, CodecError> {
        let v = self.u8()?;
        Hitflag::from_u8(v).ok_or(CodecError::InvalidField {
            field: "hitflag",
            value: v,
        })
    }

    fn lock_result(&mut self) -> Result<LockResult, CodecError> {
        let v = self.u8()?;
        LockResult::from_u8(v).ok_or(CodecError::InvalidField {
            field: "lock_result",
            value: v,
        })
    }

    fn dirinfo(&mut self) -> Result<DirectoryInfo, CodecError> {
        let edge = self.u32()?;
        let valid = self.bool()?;
        Ok(DirectoryInfo { edge, valid })
    }
}

fn put_addr(buf: &mut Vec<u8>, addr: NetworkAddr) {
    buf.extend_from_slice(&addr.ip.octets());
    buf.write_u16::<BigEndian>(addr.port).expect("vec write");
}

fn put_key(buf: &mut Vec<u8>, key: &Key) {
    buf.write_u32::<BigEndian>(key.len() as u32).expect("vec write");
    buf.extend_from_slice(key.as_bytes());
}

fn put_value(buf: &mut Vec<u8>, value: &Value) {
    buf.write_u32::<BigEndian>(value.data().len() as u32)
        .expect("vec write");
    buf.extend_from_slice(value.data());
    buf.push(value.is_deleted() as u8);
}

fn put_dirinfo(buf: &mut Vec<u8>, info: &DirectoryInfo) {
    buf.write_u32::<BigEndian>(info.edge).expect("vec write");
    buf.push(info.valid as u8);
}

fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.write_u64::<BigEndian>(v.to_bits()).expect("vec write");
}

fn put_events(buf: &mut Vec<u8>, events: &EventList) {
    buf.write_u32::<BigEndian>(events.len() as u32)
        .expect("vec write");
    for event in events.events() {
        buf.write_u32::<BigEndian>(event.name.len() as u32)
            .expect("vec write");
        buf.extend_from_slice(event.name.as_bytes());
        buf.write_u32::<BigEndian>(event.latency_us).expect("vec write");
    }
}

fn read_events(r: &mut Reader<'_>) -> Result<EventList, CodecError> {
    let count = r.u32()?;
    let mut events = EventList::new();
    for _ in 0..count {
        let name_len = r.u32()? as usize;
        let name = std::str::from_utf8(r.take(name_len)?)
            .map_err(|_| CodecError::BadEventName)?
            .to_owned();
        let latency_us = r.u32()?;
        events.add(name, latency_us);
    }
    Ok(events)
}

fn put_bandwidth(buf: &mut Vec<u8>, usage: &BandwidthUsage) {
    for counter in [
        usage.client_edge_bytes,
        usage.cross_edge_control_bytes,
        usage.cross_edge_data_bytes,
        usage.edge_cloud_bytes,
        usage.client_edge_msgs,
        usage.cross_edge_control_msgs,
        usage.cross_edge_data_msgs,
        usage.edge_cloud_msgs,
    ] {
        buf.write_u64::<BigEndian>(counter).expect("vec write");
    }
}

fn read_bandwidth(r: &mut Reader<'_>) -> Result<BandwidthUsage, CodecError> {
    Ok(BandwidthUsage {
        client_edge_bytes: r.u64()?,
        cross_edge_control_bytes: r.u64()?,
        cross_edge_data_bytes: r.u64()?,
        edge_cloud_bytes: r.u64()?,
        client_edge_msgs: r.u64()?,
        cross_edge_control_msgs: r.u64()?,
        cross_edge_data_msgs: r.u64()?,
        edge_cloud_msgs: r.u64()?,
    })
}

fn put_victims(buf: &mut Vec<u8>, syncset: &VictimSyncset) {
    buf.write_u32::<BigEndian>(syncset.edge).expect("vec write");
    buf.write_u64::<BigEndian>(syncset.margin_bytes)
        .expect("vec write");
    buf.write_u32::<BigEndian>(syncset.victims.len() as u32)
        .expect("vec write");
    for victim in &syncset.victims {
        put_key(buf, &victim.key);
        put_f64(buf, victim.reward);
        buf.write_u64::<BigEndian>(victim.object_size).expect("vec write");
    }
}

fn read_victims(r: &mut Reader<'_>) -> Result<VictimSyncset, CodecError> {
    let edge = r.u32()?;
    let margin_bytes = r.u64()?;
    let count = r.u32()?;
    let mut victims = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = r.key()?;
        let reward = r.f64()?;
        let object_size = r.u64()?;
        victims.push(VictimEntry {
            key,
            reward,
            object_size,
        });
    }
    Ok(VictimSyncset {
        edge,
        margin_bytes,
        victims,
    })
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind.tag());
        buf.write_u32::<BigEndian>(self.source_edge).expect("vec write");
        put_addr(&mut buf, self.source_addr);

        let mut flags = 0u8;
        if !self.events.is_empty() {
            flags |= FLAG_EVENTS;
        }
        if self.bandwidth != BandwidthUsage::default() {
            flags |= FLAG_BANDWIDTH;
        }
        if self.sync.victims.is_some() {
            flags |= FLAG_VICTIMS;
        }
        if self.sync.popularity.is_some() {
            flags |= FLAG_POPULARITY;
        }
        if self.sync.edgeset.is_some() {
            flags |= FLAG_EDGESET;
        }
        buf.push(flags);

        self.encode_payload(&mut buf);

        if let Some(events) = (!self.events.is_empty()).then_some(&self.events) {
            put_events(&mut buf, events);
        }
        if flags & FLAG_BANDWIDTH != 0 {
            put_bandwidth(&mut buf, &self.bandwidth);
        }
        if let Some(victims) = &self.sync.victims {
            put_victims(&mut buf, victims);
        }
        if let Some(popularity) = &self.sync.popularity {
            buf.push(popularity.is_tracked as u8);
            put_f64(&mut buf, popularity.popularity);
            buf.write_u64::<BigEndian>(popularity.object_size)
                .expect("vec write");
        }
        if let Some(edgeset) = &self.sync.edgeset {
            buf.write_u32::<BigEndian>(edgeset.len() as u32)
                .expect("vec write");
            for edge in edgeset {
                buf.write_u32::<BigEndian>(*edge).expect("vec write");
            }
        }
        buf
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        use MsgKind::*;
        match &self.kind {
            LocalGetRequest { key }
            | LocalDelRequest { key }
            | RedirectedGetRequest { key }
            | GlobalGetRequest { key }
            | GlobalPutResponse { key }
            | GlobalDelRequest { key }
            | GlobalDelResponse { key }
            | DirectoryLookupRequest { key }
            | AcquireWritelockRequest { key }
            | ReleaseWritelockRequest { key }
            | ReleaseWritelockResponse { key }
            | InvalidationRequest { key }
            | InvalidationResponse { key }
            | FinishBlockRequest { key }
            | FinishBlockResponse { key }
            | PlacementNotifyResponse { key }
            | MetadataUpdateResponse { key } => put_key(buf, key),
            LocalGetResponse { key, value, hitflag }
            | RedirectedGetResponse { key, value, hitflag } => {
                put_key(buf, key);
                put_value(buf, value);
                buf.push(*hitflag as u8);
            }
            LocalPutRequest { key, value }
            | GlobalPutRequest { key, value }
            | PlacementNotifyRequest { key, value } => {
                put_key(buf, key);
                put_value(buf, value);
            }
            LocalPutResponse { key, hitflag } | LocalDelResponse { key, hitflag } => {
                put_key(buf, key);
                buf.push(*hitflag as u8);
            }
            GlobalGetResponse { key, value } => {
                put_key(buf, key);
                put_value(buf, value);
            }
            DirectoryLookupResponse {
                key,
                being_written,
                dirinfo,
            } => {
                put_key(buf, key);
                buf.push(*being_written as u8);
                match dirinfo {
                    Some(info) => {
                        buf.push(1);
                        put_dirinfo(buf, info);
                    }
                    None => buf.push(0),
                }
            }
            DirectoryUpdateRequest {
                key,
                is_admit,
                dirinfo,
            } => {
                put_key(buf, key);
                buf.push(*is_admit as u8);
                put_dirinfo(buf, dirinfo);
            }
            DirectoryUpdateResponse { key, being_written } => {
                put_key(buf, key);
                buf.push(*being_written as u8);
            }
            AcquireWritelockResponse { key, result } => {
                put_key(buf, key);
                buf.push(*result as u8);
            }
            MetadataUpdateRequest {
                key,
                is_neighbor_cached,
            } => {
                put_key(buf, key);
                buf.push(*is_neighbor_cached as u8);
            }
            SwitchSlotRequest { slot } | SwitchSlotResponse { slot } => {
                buf.write_u32::<BigEndian>(*slot).expect("vec write");
            }
            InitializationRequest
            | InitializationResponse
            | StartrunRequest
            | StartrunResponse
            | FinishrunRequest
            | SimpleFinishrunResponse => {}
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
        let mut r = Reader::new(buf);
        let tag = r.u8()?;
        let source_edge = r.u32()?;
        let source_addr = r.addr()?;
        let flags = r.u8()?;

        let kind = decode_payload(tag, &mut r)?;

        let events = if flags & FLAG_EVENTS != 0 {
            read_events(&mut r)?
        } else {
            EventList::new()
        };
        let bandwidth = if flags & FLAG_BANDWIDTH != 0 {
            read_bandwidth(&mut r)?
        } else {
            BandwidthUsage::default()
        };
        let victims = if flags & FLAG_VICTIMS != 0 {
            Some(read_victims(&mut r)?)
        } else {
            None
        };
        let popularity = if flags & FLAG_POPULARITY != 0 {
            let is_tracked = r.bool()?;
            let popularity = r.f64()?;
            let object_size = r.u64()?;
            Some(CollectedPopularity {
                is_tracked,
                popularity,
                object_size,
            })
        } else {
            None
        };
        let edgeset = if flags & FLAG_EDGESET != 0 {
            let count = r.u32()?;
            let mut edges = Edgeset::new();
            for _ in 0..count {
                edges.push(r.u32()?);
            }
            Some(edges)
        } else {
            None
        };

        Ok(Message {
            kind,
            source_edge,
            source_addr,
            events,
            bandwidth,
            sync: CoveredSync {
                victims,
                popularity,
                edgeset,
            },
        })
    }
}

fn decode_payload(tag: u8, r: &mut Reader<'_>) -> Result<MsgKind, CodecError> {
    use MsgKind::*;
    Ok(match tag {
        0 => LocalGetRequest { key: r.key()? },
        1 => LocalGetResponse {
            key: r.key()?,
            value: r.value()?,
            hitflag: r.hitflag()?,
        },
        2 => LocalPutRequest {
            key: r.key()?,
            value: r.value()?,
        },
        3 => LocalPutResponse {
            key: r.key()?,
            hitflag: r.hitflag()?,
        },
        4 => LocalDelRequest { key: r.key()? },
        5 => LocalDelResponse {
            key: r.key()?,
            hitflag: r.hitflag()?,
        },
        6 => RedirectedGetRequest { key: r.key()? },
        7 => RedirectedGetResponse {
            key: r.key()?,
            value: r.value()?,
            hitflag: r.hitflag()?,
        },
        8 => GlobalGetRequest { key: r.key()? },
        9 => GlobalGetResponse {
            key: r.key()?,
            value: r.value()?,
        },
        10 => GlobalPutRequest {
            key: r.key()?,
            value: r.value()?,
        },
        11 => GlobalPutResponse { key: r.key()? },
        12 => GlobalDelRequest { key: r.key()? },
        13 => GlobalDelResponse { key: r.key()? },
        14 => DirectoryLookupRequest { key: r.key()? },
        15 => {
            let key = r.key()?;
            let being_written = r.bool()?;
            let dirinfo = if r.bool()? { Some(r.dirinfo()?) } else { None };
            DirectoryLookupResponse {
                key,
                being_written,
                dirinfo,
            }
        }
        16 => DirectoryUpdateRequest {
            key: r.key()?,
            is_admit: r.bool()?,
            dirinfo: r.dirinfo()?,
        },
        17 => DirectoryUpdateResponse {
            key: r.key()?,
            being_written: r.bool()?,
        },
        18 => AcquireWritelockRequest { key: r.key()? },
        19 => AcquireWritelockResponse {
            key: r.key()?,
            result: r.lock_result()?,
        },
        20 => ReleaseWritelockRequest { key: r.key()? },
        21 => ReleaseWritelockResponse { key: r.key()? },
        22 => InvalidationRequest { key: r.key()? },
        23 => InvalidationResponse { key: r.key()? },
        24 => FinishBlockRequest { key: r.key()? },
        25 => FinishBlockResponse { key: r.key()? },
        26 => PlacementNotifyRequest {
            key: r.key()?,
            value: r.value()?,
        },
        27 => PlacementNotifyResponse { key: r.key()? },
        28 => MetadataUpdateRequest {
            key: r.key()?,
            is_neighbor_cached: r.bool()?,
        },
        29 => MetadataUpdateResponse { key: r.key()? },
        30 => InitializationRequest,
        31 => InitializationResponse,
        32 => StartrunRequest,
        33 => StartrunResponse,
        34 => SwitchSlotRequest { slot: r.u32()? },
        35 => SwitchSlotResponse { slot: r.u32()? },
        36 => FinishrunRequest,
        37 => SimpleFinishrunResponse,
        other => return Err(CodecError::UnknownTag(other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn round_trip(msg: Message) {
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn directory_lookup_response_with_and_without_dirinfo() {
        let base = Message::new(
            MsgKind::DirectoryLookupResponse {
                key: Key::from("k"),
                being_written: true,
                dirinfo: None,
            },
            2,
            NetworkAddr::localhost(4100),
        );
        round_trip(base);
        round_trip(Message::new(
            MsgKind::DirectoryLookupResponse {
                key: Key::from("k"),
                being_written: false,
                dirinfo: Some(DirectoryInfo::new(5)),
            },
            2,
            NetworkAddr::localhost(4100),
        ));
    }

    #[test]
    fn covered_trailers_round_trip() {
        let mut msg = Message::new(
            MsgKind::DirectoryLookupRequest { key: Key::from("hot") },
            1,
            NetworkAddr::localhost(4200),
        );
        msg.sync = CoveredSync {
            victims: Some(VictimSyncset {
                edge: 1,
                margin_bytes: 4096,
                victims: vec![VictimEntry {
                    key: Key::from("cold"),
                    reward: 0.25,
                    object_size: 128,
                }],
            }),
            popularity: Some(CollectedPopularity::tracked(3.5)),
            edgeset: Some(smallvec![0, 2]),
        };
        msg.events.add("lookup", 17);
        msg.bandwidth.add_cross_edge_control(99);
        round_trip(msg);
    }

    #[test]
    fn tombstone_value_round_trip() {
        round_trip(Message::new(
            MsgKind::RedirectedGetResponse {
                key: Key::from("gone"),
                value: Value::deleted(),
                hitflag: Hitflag::CooperativeHit,
            },
            0,
            NetworkAddr::localhost(4300),
        ));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let mut msg = Message::new(
            MsgKind::InitializationRequest,
            0,
            NetworkAddr::localhost(1),
        )
        .encode();
        msg[0] = 200;
        assert_eq!(Message::decode(&msg), Err(CodecError::UnknownTag(200)));
    }

    #[test]
    fn truncated_message_is_an_error() {
        let msg = Message::new(
            MsgKind::LocalPutRequest {
                key: Key::from("k"),
                value: Value::new(vec![1, 2, 3]),
            },
            0,
            NetworkAddr::localhost(1),
        )
        .encode();
        assert_eq!(
            Message::decode(&msg[..msg.len() - 2]),
            Err(CodecError::Truncated)
        );
    }
}
