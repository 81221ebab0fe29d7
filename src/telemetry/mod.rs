// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Latency-event and bandwidth accumulators carried on control messages and
//! aggregated by the experimental harness.

use parking_lot::Mutex;

/// A named latency sample, in microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub latency_us: u32,
}

/// Ordered list of latency events accumulated along a request path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventList {
    events: Vec<Event>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, latency_us: u32) {
        self.events.push(Event {
            name: name.into(),
            latency_us,
        });
    }

    /// Fold in the events carried by an intermediate response.
    pub fn extend(&mut self, other: &EventList) {
        self.events.extend(other.events.iter().cloned());
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Byte and message counters split by link class. Travels as a trailer of
/// eight 64-bit counters on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthUsage {
    pub client_edge_bytes: u64,
    pub cross_edge_control_bytes: u64,
    pub cross_edge_data_bytes: u64,
    pub edge_cloud_bytes: u64,
    pub client_edge_msgs: u64,
    pub cross_edge_control_msgs: u64,
    pub cross_edge_data_msgs: u64,
    pub edge_cloud_msgs: u64,
}

impl BandwidthUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client_edge(&mut self, bytes: u64) {
        self.client_edge_bytes += bytes;
        self.client_edge_msgs += 1;
    }

    pub fn add_cross_edge_control(&mut self, bytes: u64) {
        self.cross_edge_control_bytes += bytes;
        self.cross_edge_control_msgs += 1;
    }

    pub fn add_cross_edge_data(&mut self, bytes: u64) {
        self.cross_edge_data_bytes += bytes;
        self.cross_edge_data_msgs += 1;
    }

    pub fn add_edge_cloud(&mut self, bytes: u64) {
        self.edge_cloud_bytes += bytes;
        self.edge_cloud_msgs += 1;
    }

    /// Merge counters from another accumulator.
    pub fn merge(&mut self, other: &BandwidthUsage) {
        self.client_edge_bytes += other.client_edge_bytes;
        self.cross_edge_control_bytes += other.cross_edge_control_bytes;
        self.cross_edge_data_bytes += other.cross_edge_data_bytes;
        self.edge_cloud_bytes += other.edge_cloud_bytes;
        self.client_edge_msgs += other.client_edge_msgs;
        self.cross_edge_control_msgs += other.cross_edge_control_msgs;
        self.cross_edge_data_msgs += other.cross_edge_data_msgs;
        self.edge_cloud_msgs += other.edge_cloud_msgs;
    }

    pub fn total_bytes(&self) -> u64 {
        self.client_edge_bytes
            + self.cross_edge_control_bytes
            + self.cross_edge_data_bytes
            + self.edge_cloud_bytes
    }
}

/// Thread-safe accumulator for background work (placement pipeline,
/// beacon-side fan-outs) whose traffic is not attributable to a single
/// client request.
#[derive(Debug, Default)]
pub struct BackgroundCounter {
    inner: Mutex<BackgroundInner>,
}

#[derive(Debug, Default)]
struct BackgroundInner {
    bandwidth: BandwidthUsage,
    events: EventList,
}

impl BackgroundCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bandwidth(&self, usage: &BandwidthUsage) {
        self.inner.lock().bandwidth.merge(usage);
    }

    pub fn add_events(&self, events: &EventList) {
        self.inner.lock().events.extend(events);
    }

    pub fn snapshot(&self) -> (BandwidthUsage, EventList) {
        let inner = self.inner.lock();
        (inner.bandwidth, inner.events.clone())
    }
}
