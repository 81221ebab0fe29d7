// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-process cluster harness: one cloud node plus N edge nodes on
//! loopback UDP, with a synchronous client helper.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use covered::cloud::{CloudNode, CloudStats, OriginStore};
use covered::config::{CachePolicy, CloudConfig, EdgeConfig, FleetConfig};
use covered::edge::{EdgeContext, EdgeNode};
use covered::fleet::Fleet;
use covered::message::{Message, MsgKind};
use covered::net::MsgSocket;
use covered::node::Running;
use covered::types::{EdgeId, Hitflag, Key, Value};

/// Each cluster takes a disjoint port range so tests can run in parallel.
static NEXT_BASE_PORT: AtomicU16 = AtomicU16::new(42_000);

fn alloc_base_port() -> u16 {
    NEXT_BASE_PORT.fetch_add(64, Ordering::Relaxed)
}

pub struct Cluster {
    pub fleet: Fleet,
    pub edges: Vec<Arc<EdgeContext>>,
    pub origin: OriginStore,
    pub origin_stats: Arc<CloudStats>,
    runnings: Vec<Running>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl Cluster {
    pub fn start(edge_count: usize, policy: CachePolicy) -> Cluster {
        Cluster::start_with(edge_count, policy, |_| {})
    }

    pub fn start_with(
        edge_count: usize,
        policy: CachePolicy,
        tweak: impl Fn(&mut EdgeConfig),
    ) -> Cluster {
        let base = alloc_base_port();
        let fleet_config = FleetConfig {
            edge_ips: vec![Ipv4Addr::LOCALHOST; edge_count],
            edge_port_base: base + 8,
            cloud_ip: Ipv4Addr::LOCALHOST,
            cloud_port: base,
            ..Default::default()
        };
        let fleet = fleet_config.build();

        let mut runnings = Vec::new();
        let mut threads = Vec::new();

        let cloud = CloudNode::new(CloudConfig {
            recv_timeout_ms: 50,
            fleet: fleet_config.clone(),
        });
        let origin = cloud.store();
        let origin_stats = cloud.stats();
        runnings.push(cloud.running());
        threads.push(
            std::thread::Builder::new()
                .name("test-cloud".into())
                .spawn(move || {
                    cloud.run().expect("cloud node failed");
                })
                .unwrap(),
        );

        let mut edges = Vec::new();
        for edge_id in 0..edge_count as EdgeId {
            let mut config = EdgeConfig {
                edge_id,
                policy,
                workers: 2,
                recv_timeout_ms: 50,
                fleet: fleet_config.clone(),
                ..Default::default()
            };
            tweak(&mut config);
            let node = EdgeNode::new(config).expect("edge node setup");
            edges.push(node.context());
            runnings.push(node.running());
            threads.push(
                std::thread::Builder::new()
                    .name(format!("test-edge{edge_id}"))
                    .spawn(move || {
                        node.run().expect("edge node failed");
                    })
                    .unwrap(),
            );
        }

        // Give server sockets a moment to bind before traffic starts.
        std::thread::sleep(Duration::from_millis(100));

        Cluster {
            fleet,
            edges,
            origin,
            origin_stats,
            runnings,
            threads,
        }
    }

    pub fn client(&self) -> Client {
        Client::connect(self.fleet.clone())
    }

    /// Find a key with the given prefix that hashes to `beacon`.
    pub fn key_beaconed_at(&self, beacon: EdgeId, prefix: &str) -> Key {
        for i in 0..10_000 {
            let key = Key::from(format!("{prefix}{i}").as_str());
            if self.fleet.beacon_of(&key) == beacon {
                return key;
            }
        }
        panic!("no key with prefix {prefix} hashes to edge {beacon}");
    }

    pub fn shutdown(self) {
        for running in &self.runnings {
            running.shutdown();
        }
        for thread in self.threads {
            thread.join().ok();
        }
    }
}

pub struct Client {
    fleet: Fleet,
    sock: MsgSocket,
}

impl Client {
    pub fn connect(fleet: Fleet) -> Client {
        let sock = MsgSocket::bind_ephemeral(Ipv4Addr::LOCALHOST, Duration::from_millis(200))
            .expect("client socket");
        Client { fleet, sock }
    }

    fn request(
        &mut self,
        edge: EdgeId,
        kind: MsgKind,
        accept: impl Fn(&MsgKind) -> bool,
    ) -> MsgKind {
        let dst = self.fleet.cache_server_addr(edge);
        let req = Message::new(kind, u32::MAX, self.sock.local_addr());
        self.sock.send_msg(&req, dst).expect("client send");
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            match self.sock.recv_msg().expect("client recv") {
                Some((msg, _)) if accept(&msg.kind) => return msg.kind,
                Some(_) => continue,
                None => continue,
            }
        }
        panic!("client request timed out");
    }

    pub fn get(&mut self, edge: EdgeId, key: &Key) -> (Value, Hitflag) {
        let expect = key.clone();
        let rsp = self.request(
            edge,
            MsgKind::LocalGetRequest { key: key.clone() },
            move |kind| matches!(kind, MsgKind::LocalGetResponse { key, .. } if *key == expect),
        );
        match rsp {
            MsgKind::LocalGetResponse { value, hitflag, .. } => (value, hitflag),
            _ => unreachable!(),
        }
    }

    pub fn put(&mut self, edge: EdgeId, key: &Key, value: &str) -> Hitflag {
        let expect = key.clone();
        let rsp = self.request(
            edge,
            MsgKind::LocalPutRequest {
                key: key.clone(),
                value: Value::new(value.as_bytes().to_vec()),
            },
            move |kind| matches!(kind, MsgKind::LocalPutResponse { key, .. } if *key == expect),
        );
        match rsp {
            MsgKind::LocalPutResponse { hitflag, .. } => hitflag,
            _ => unreachable!(),
        }
    }

    pub fn del(&mut self, edge: EdgeId, key: &Key) -> Hitflag {
        let expect = key.clone();
        let rsp = self.request(
            edge,
            MsgKind::LocalDelRequest { key: key.clone() },
            move |kind| matches!(kind, MsgKind::LocalDelResponse { key, .. } if *key == expect),
        );
        match rsp {
            MsgKind::LocalDelResponse { hitflag, .. } => hitflag,
            _ => unreachable!(),
        }
    }
}

/// Wait until `check` passes or the deadline expires.
pub fn wait_for(deadline: Duration, check: impl Fn() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}
