// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Length-prefixed binary snapshot of cache metadata, stable across runs of
//! the same build. Layout: per-key list size + entries, per-group map size +
//! entries, lookup table size (the lookup table and reward index are rebuilt
//! from the restored stats on load).

use ahash::HashMap;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use hashlink::LinkedHashMap;
use thiserror::Error;

use super::{CacheMetadata, GroupStats, KeyLevelStats, RewardPolicy};
use crate::types::{GroupId, Key};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot truncated")]
    Truncated,
    #[error("snapshot lookup size {found} does not match {expected} restored entries")]
    LookupMismatch { expected: usize, found: usize },
}

pub struct SnapshotReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        SnapshotReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        if self.pos + n > self.buf.len() {
            return Err(SnapshotError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, SnapshotError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64, SnapshotError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn f64(&mut self) -> Result<f64, SnapshotError> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub fn bool(&mut self) -> Result<bool, SnapshotError> {
        Ok(self.take(1)?[0] != 0)
    }

    pub fn key(&mut self) -> Result<Key, SnapshotError> {
        let len = self.u32()? as usize;
        Ok(Key::new(Bytes::copy_from_slice(self.take(len)?)))
    }
}

pub(super) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.write_u32::<BigEndian>(v).expect("vec write");
}

pub(super) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.write_u64::<BigEndian>(v).expect("vec write");
}

pub(super) fn put_f64(buf: &mut Vec<u8>, v: f64) {
    put_u64(buf, v.to_bits());
}

pub(super) fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(v as u8);
}

fn put_key(buf: &mut Vec<u8>, key: &Key) {
    put_u32(buf, key.len() as u32);
    buf.extend_from_slice(key.as_bytes());
}

impl<M: KeyLevelStats> CacheMetadata<M> {
    /// Serialize this view. Entries dump in recency order so a restored
    /// view evicts identically.
    pub fn dump_snapshot(&self) -> Vec<u8> {
        let (entries, groups, (cur_group, cur_group_len, next_seq), lookup_len) =
            self.snapshot_parts();
        let mut buf = Vec::new();

        put_u32(&mut buf, cur_group);
        put_u32(&mut buf, cur_group_len);
        put_u64(&mut buf, next_seq);

        put_u64(&mut buf, entries.len() as u64);
        for (key, stats) in entries.iter() {
            put_key(&mut buf, key);
            stats.write_snapshot(&mut buf);
        }

        put_u64(&mut buf, groups.len() as u64);
        for (group, stats) in groups.iter() {
            put_u32(&mut buf, *group);
            put_u32(&mut buf, stats.object_count);
            put_u64(&mut buf, stats.total_size);
            put_u64(&mut buf, stats.aggregate_frequency);
        }

        put_u64(&mut buf, lookup_len as u64);
        buf
    }

    pub fn load_snapshot(
        buf: &[u8],
        pergroup_max_keys: u32,
        policy: &RewardPolicy,
    ) -> Result<Self, SnapshotError> {
        let mut r = SnapshotReader::new(buf);
        let cur_group = r.u32()?;
        let cur_group_len = r.u32()?;
        let next_seq = r.u64()?;

        let entry_count = r.u64()? as usize;
        let mut entries = LinkedHashMap::new();
        for _ in 0..entry_count {
            let key = r.key()?;
            let stats = M::read_snapshot(&mut r)?;
            entries.insert(key, stats);
        }

        let group_count = r.u64()? as usize;
        let mut groups: HashMap<GroupId, GroupStats> = HashMap::default();
        for _ in 0..group_count {
            let group = r.u32()?;
            let stats = GroupStats {
                object_count: r.u32()?,
                total_size: r.u64()?,
                aggregate_frequency: r.u64()?,
            };
            groups.insert(group, stats);
        }

        let lookup_len = r.u64()? as usize;
        if lookup_len != entry_count {
            return Err(SnapshotError::LookupMismatch {
                expected: entry_count,
                found: lookup_len,
            });
        }

        Ok(CacheMetadata::from_snapshot_parts(
            pergroup_max_keys,
            entries,
            groups,
            (cur_group, cur_group_len, next_seq),
            policy,
        ))
    }
}
