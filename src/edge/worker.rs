// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Cache-server worker: executes the read and write pipelines for the keys
//! hashed to it. Each worker owns a response socket whose address travels
//! as the source of its requests; beacon replies, redirected-get responses
//! and finish-block wake-ups all arrive there.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::{beacon_server, broadcast_invalidation, EdgeContext, EdgeError};
use crate::message::{Message, MsgKind};
use crate::net::MsgSocket;
use crate::store::GetResult;
use crate::telemetry::{BandwidthUsage, EventList};
use crate::types::{DirectoryInfo, Hitflag, Key, LockResult, Value};

/// What a directory lookup resolved to once any in-flight write finished.
struct LookupView {
    dirinfo: Option<DirectoryInfo>,
    is_global_cached: bool,
}

/// Per-request accumulators attached to the client response.
#[derive(Default)]
struct Trace {
    events: EventList,
    bandwidth: BandwidthUsage,
}

pub(crate) struct Worker {
    ctx: Arc<EdgeContext>,
    idx: usize,
    rx: flume::Receiver<Message>,
    sock: MsgSocket,
}

impl Worker {
    pub(crate) fn new(
        ctx: Arc<EdgeContext>,
        idx: usize,
        rx: flume::Receiver<Message>,
    ) -> Result<Self, EdgeError> {
        let sock = MsgSocket::bind_ephemeral(
            ctx.fleet.edge_ip(ctx.edge_id),
            ctx.recv_timeout(),
        )?;
        Ok(Worker { ctx, idx, rx, sock })
    }

    pub(crate) fn run(mut self) {
        debug!(edge = self.ctx.edge_id, worker = self.idx, "worker up");
        while self.ctx.running.is_running() {
            let msg = match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(msg) => msg,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            };
            let result = self.process_data_request(msg);
            match result {
                Ok(_finished) => continue,
                Err(err) => {
                    error!(edge = self.ctx.edge_id, worker = self.idx, %err, "worker failed");
                    std::process::exit(1);
                }
            }
        }
    }

    /// Route one data request. Returns `true` when shutdown was observed
    /// mid-request.
    fn process_data_request(&mut self, msg: Message) -> Result<bool, EdgeError> {
        match msg.kind.clone() {
            MsgKind::LocalGetRequest { key } => self.process_local_get(&key, &msg),
            MsgKind::LocalPutRequest { key, value } => {
                self.process_local_write(&key, Some(value), &msg)
            }
            MsgKind::LocalDelRequest { key } => self.process_local_write(&key, None, &msg),
            MsgKind::RedirectedGetRequest { key } => self.process_redirected_get(&key, &msg),
            other => {
                error!(tag = other.tag(), "invalid message type on worker queue");
                std::process::exit(1);
            }
        }
    }

    // Read pipeline.

    fn process_local_get(&mut self, key: &Key, request: &Message) -> Result<bool, EdgeError> {
        let mut trace = Trace::default();
        let mut hitflag = Hitflag::GlobalMiss;
        let mut value = match self.ctx.cache.get_local(key) {
            GetResult::Hit(value) => {
                hitflag = Hitflag::LocalHit;
                Some(value)
            }
            GetResult::Invalid | GetResult::Miss => None,
        };

        if value.is_none() {
            let Some((fetched, flag, is_global_cached)) = self.fetch_missing(key, &mut trace)?
            else {
                return Ok(true);
            };
            hitflag = flag;

            // Fold the fetched value into the uncached view, then refresh
            // any invalid local slot with it. Directory updates follow the
            // store change in both directions.
            self.ctx.cache.note_getrsp_value(key, &fetched, is_global_cached);
            if fetched.is_deleted() {
                if self.ctx.cache.remove_if_invalid_for_getrsp(key)
                    && self.update_directory(key, false)?.is_none()
                {
                    return Ok(true);
                }
            } else if self.ctx.cache.update_if_invalid_for_getrsp(key, fetched.clone()) {
                // The refreshed copy can serve peers again.
                if self.update_directory(key, true)?.is_none() {
                    return Ok(true);
                }
            }

            // Baseline policies admit on miss independently; COVERED leaves
            // admission to beacon placement.
            if !fetched.is_deleted()
                && !self.ctx.cache.is_cached(key)
                && self.ctx.cache.need_independent_admit(key)
            {
                if self.admit_locally(key, fetched.clone())?.is_none() {
                    return Ok(true);
                }
            }
            value = Some(fetched);
        }

        let value = value.expect("value resolved above");
        let mut rsp = Message::new(
            MsgKind::LocalGetResponse {
                key: key.clone(),
                value,
                hitflag,
            },
            self.ctx.edge_id,
            self.sock.local_addr(),
        );
        rsp.events = trace.events;
        trace.bandwidth.add_client_edge(rsp.wire_size());
        rsp.bandwidth = trace.bandwidth;
        self.ctx
            .to_client
            .push_wait(rsp, request.source_addr)
            .ok();
        Ok(false)
    }

    /// Resolve a local miss cooperatively, falling back to the origin.
    /// Returns the value, its hitflag, and whether any peer caches the key.
    fn fetch_missing(
        &mut self,
        key: &Key,
        trace: &mut Trace,
    ) -> Result<Option<(Value, Hitflag, bool)>, EdgeError> {
        let mut is_global_cached = false;
        loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let Some(view) = self.lookup_directory(key, trace)? else {
                return Ok(None);
            };
            is_global_cached = view.is_global_cached;
            let Some(target) = view.dirinfo else {
                break;
            };
            if self.ctx.is_local_target(&target) {
                // A local miss cannot name this edge as the cacher.
                warn!(edge = self.ctx.edge_id, ?key, "directory names the requester as target");
                break;
            }
            let Some((value, hitflag)) = self.redirect_get(&target, key, trace)? else {
                return Ok(None);
            };
            match hitflag {
                Hitflag::CooperativeHit => {
                    self.ctx.cache.track_miss(key, true);
                    return Ok(Some((value, Hitflag::CooperativeHit, true)));
                }
                // The target's copy was invalidated meanwhile; look up again.
                Hitflag::CooperativeInvalid => continue,
                // Stale directory entry; fall through to the origin.
                Hitflag::GlobalMiss => break,
                Hitflag::LocalHit => {
                    error!("invalid hitflag in redirected get response");
                    std::process::exit(1);
                }
            }
        }

        self.ctx.cache.track_miss(key, is_global_cached);
        let Some(value) = self.fetch_cloud(key, trace)? else {
            return Ok(None);
        };
        Ok(Some((value, Hitflag::GlobalMiss, is_global_cached)))
    }

    /// Directory lookup with write-wait: polling when this node is beacon,
    /// blocking on a finish-block wake otherwise.
    fn lookup_directory(
        &mut self,
        key: &Key,
        trace: &mut Trace,
    ) -> Result<Option<LookupView>, EdgeError> {
        if self.ctx.is_local_beacon(key) {
            loop {
                if !self.ctx.running.is_running() {
                    return Ok(None);
                }
                let outcome = beacon_server::handle_lookup_local(
                    &self.ctx,
                    key,
                    self.ctx.edge_id,
                    None,
                    &self.ctx.covered_sync_for(key),
                );
                if outcome.being_written {
                    // Beacon-local requesters wait by re-polling.
                    std::thread::yield_now();
                    continue;
                }
                return Ok(Some(LookupView {
                    dirinfo: outcome.dirinfo,
                    is_global_cached: outcome.is_global_cached,
                }));
            }
        }

        let beacon = self.ctx.fleet.beacon_of(key);
        let dst = self.ctx.fleet.beacon_server_addr(beacon);
        let started = Instant::now();
        'resend: loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let mut req = Message::new(
                MsgKind::DirectoryLookupRequest { key: key.clone() },
                self.ctx.edge_id,
                self.sock.local_addr(),
            );
            req.sync = self.ctx.covered_sync_for(key);
            trace.bandwidth.add_cross_edge_control(req.wire_size());
            self.ctx.to_edge.push_wait(req, dst).ok();

            loop {
                let Some((msg, _)) = self.sock.recv_msg()? else {
                    if !self.ctx.running.is_running() {
                        return Ok(None);
                    }
                    warn!(edge = self.ctx.edge_id, "timeout waiting for DirectoryLookupResponse");
                    continue 'resend;
                };
                match &msg.kind {
                    MsgKind::DirectoryLookupResponse {
                        key: k,
                        being_written,
                        dirinfo,
                    } if k == key => {
                        self.ctx.absorb_sync(&msg.sync);
                        trace.bandwidth.add_cross_edge_control(msg.wire_size());
                        if *being_written {
                            if self.wait_finish_block(key)?.is_none() {
                                return Ok(None);
                            }
                            continue 'resend;
                        }
                        trace.events.add(
                            "edge_lookup_directory",
                            started.elapsed().as_micros() as u32,
                        );
                        return Ok(Some(LookupView {
                            dirinfo: *dirinfo,
                            is_global_cached: dirinfo.is_some(),
                        }));
                    }
                    MsgKind::FinishBlockRequest { key: k } => {
                        let k = k.clone();
                        self.ack_finish_block(&k, &msg)?;
                        if k == *key {
                            // The wake overtook the lookup response; a
                            // pending response would only carry stale
                            // being-written state, so look up afresh.
                            continue 'resend;
                        }
                    }
                    other => {
                        warn!(tag = other.tag(), "dropping unexpected message while awaiting lookup");
                    }
                }
            }
        }
    }

    /// Suspend until the beacon delivers the finish-block wake for `key`.
    /// After enough quiet timeouts the caller retries its request anyway;
    /// a wake lost to a rare interleaving must not strand the worker.
    fn wait_finish_block(&mut self, key: &Key) -> Result<Option<()>, EdgeError> {
        let mut quiet = 0u32;
        loop {
            let Some((msg, _)) = self.sock.recv_msg()? else {
                if !self.ctx.running.is_running() {
                    return Ok(None);
                }
                quiet += 1;
                if quiet >= 16 {
                    warn!(?key, "no finish-block wake; retrying the request");
                    return Ok(Some(()));
                }
                continue;
            };
            quiet = 0;
            match &msg.kind {
                MsgKind::FinishBlockRequest { key: k } => {
                    let k = k.clone();
                    self.ack_finish_block(&k, &msg)?;
                    if k == *key {
                        return Ok(Some(()));
                    }
                    warn!(waiting = ?key, woken = ?k, "finish-block for a different key");
                }
                other => {
                    warn!(tag = other.tag(), "dropping unexpected message while blocked");
                }
            }
        }
    }

    /// A finish-block ack only means "wake received"; the woken edge then
    /// reissues its original request.
    fn ack_finish_block(&mut self, key: &Key, request: &Message) -> Result<(), EdgeError> {
        let rsp = Message::new(
            MsgKind::FinishBlockResponse { key: key.clone() },
            self.ctx.edge_id,
            self.sock.local_addr(),
        );
        self.ctx.to_edge.push_wait(rsp, request.source_addr).ok();
        Ok(())
    }

    /// Fetch from the peer named by the directory. Never forwarded further.
    fn redirect_get(
        &mut self,
        target: &DirectoryInfo,
        key: &Key,
        trace: &mut Trace,
    ) -> Result<Option<(Value, Hitflag)>, EdgeError> {
        let dst = self.ctx.fleet.cache_server_addr(target.edge);
        let started = Instant::now();
        'resend: loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let req = Message::new(
                MsgKind::RedirectedGetRequest { key: key.clone() },
                self.ctx.edge_id,
                self.sock.local_addr(),
            );
            trace.bandwidth.add_cross_edge_data(req.wire_size());
            self.ctx.to_edge.push_wait(req, dst).ok();

            loop {
                let Some((msg, _)) = self.sock.recv_msg()? else {
                    if !self.ctx.running.is_running() {
                        return Ok(None);
                    }
                    warn!(edge = self.ctx.edge_id, "timeout waiting for RedirectedGetResponse");
                    continue 'resend;
                };
                match msg.kind.clone() {
                    MsgKind::RedirectedGetResponse {
                        key: k,
                        value,
                        hitflag,
                    } if k == *key => {
                        self.ctx.absorb_sync(&msg.sync);
                        trace.events.extend(&msg.events);
                        trace.bandwidth.add_cross_edge_data(msg.wire_size());
                        trace
                            .events
                            .add("edge_redirect_get", started.elapsed().as_micros() as u32);
                        if hitflag == Hitflag::GlobalMiss {
                            warn!(?key, target = target.edge, "target edge no longer caches the key");
                        }
                        return Ok(Some((value, hitflag)));
                    }
                    MsgKind::FinishBlockRequest { key: k } => {
                        self.ack_finish_block(&k, &msg)?;
                    }
                    other => {
                        warn!(tag = other.tag(), "dropping unexpected message while awaiting redirect");
                    }
                }
            }
        }
    }

    fn fetch_cloud(&mut self, key: &Key, trace: &mut Trace) -> Result<Option<Value>, EdgeError> {
        let dst = self.ctx.fleet.cloud_addr();
        let started = Instant::now();
        'resend: loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let req = Message::new(
                MsgKind::GlobalGetRequest { key: key.clone() },
                self.ctx.edge_id,
                self.sock.local_addr(),
            );
            trace.bandwidth.add_edge_cloud(req.wire_size());
            self.ctx.to_cloud.push_wait(req, dst).ok();

            loop {
                let Some((msg, _)) = self.sock.recv_msg()? else {
                    if !self.ctx.running.is_running() {
                        return Ok(None);
                    }
                    warn!(edge = self.ctx.edge_id, "timeout waiting for GlobalGetResponse");
                    continue 'resend;
                };
                match msg.kind.clone() {
                    MsgKind::GlobalGetResponse { key: k, value } if k == *key => {
                        trace.bandwidth.add_edge_cloud(msg.wire_size());
                        trace
                            .events
                            .add("edge_global_get", started.elapsed().as_micros() as u32);
                        return Ok(Some(value));
                    }
                    MsgKind::FinishBlockRequest { key: k } => {
                        self.ack_finish_block(&k, &msg)?;
                    }
                    other => {
                        warn!(tag = other.tag(), "dropping unexpected message while awaiting origin");
                    }
                }
            }
        }
    }

    // Write pipeline.

    fn process_local_write(
        &mut self,
        key: &Key,
        value: Option<Value>,
        request: &Message,
    ) -> Result<bool, EdgeError> {
        let mut trace = Trace::default();
        let is_put = value.is_some();

        let Some(lock_result) = self.acquire_writelock(key, &mut trace)? else {
            return Ok(true);
        };

        // Write through to the origin before touching the local copy.
        if self.write_cloud(key, value.clone(), &mut trace)?.is_none() {
            return Ok(true);
        }

        match &value {
            Some(value) => {
                self.ctx.cache.update(key, value.clone());
            }
            None => {
                self.ctx.cache.remove(key);
            }
        }
        for (victim, _) in self.ctx.cache.evict_until_fits() {
            if self.update_directory(&victim, false)?.is_none() {
                return Ok(true);
            }
        }

        // Baseline write-miss admission.
        if let Some(value) = &value {
            if !self.ctx.cache.is_cached(key) && self.ctx.cache.need_independent_admit(key) {
                if self.admit_locally(key, value.clone())?.is_none() {
                    return Ok(true);
                }
            }
        }

        if lock_result == LockResult::Success {
            if self.release_writelock(key, &mut trace)?.is_none() {
                return Ok(true);
            }
        }

        let kind = if is_put {
            MsgKind::LocalPutResponse {
                key: key.clone(),
                hitflag: Hitflag::GlobalMiss,
            }
        } else {
            MsgKind::LocalDelResponse {
                key: key.clone(),
                hitflag: Hitflag::GlobalMiss,
            }
        };
        let mut rsp = Message::new(kind, self.ctx.edge_id, self.sock.local_addr());
        rsp.events = trace.events;
        trace.bandwidth.add_client_edge(rsp.wire_size());
        rsp.bandwidth = trace.bandwidth;
        self.ctx.to_client.push_wait(rsp, request.source_addr).ok();
        Ok(false)
    }

    /// Acquire the per-key write lock, waiting out a concurrent writer.
    /// Returns `Success` or `NoNeed`; `Failure` is waited out internally.
    fn acquire_writelock(
        &mut self,
        key: &Key,
        trace: &mut Trace,
    ) -> Result<Option<LockResult>, EdgeError> {
        let started = Instant::now();
        if self.ctx.is_local_beacon(key) {
            loop {
                if !self.ctx.running.is_running() {
                    return Ok(None);
                }
                let outcome = beacon_server::handle_acquire_local(
                    &self.ctx,
                    key,
                    self.ctx.edge_id,
                    None,
                    &self.ctx.covered_sync_for(key),
                );
                match outcome.result {
                    LockResult::Failure => {
                        std::thread::yield_now();
                        continue;
                    }
                    LockResult::Success => {
                        if broadcast_invalidation(
                            &self.ctx,
                            &mut self.sock,
                            key,
                            &outcome.replicas,
                            None,
                        )? {
                            return Ok(None);
                        }
                        trace.events.add(
                            "edge_acquire_writelock",
                            started.elapsed().as_micros() as u32,
                        );
                        return Ok(Some(LockResult::Success));
                    }
                    LockResult::NoNeed => return Ok(Some(LockResult::NoNeed)),
                }
            }
        }

        let beacon = self.ctx.fleet.beacon_of(key);
        let dst = self.ctx.fleet.beacon_server_addr(beacon);
        'resend: loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let mut req = Message::new(
                MsgKind::AcquireWritelockRequest { key: key.clone() },
                self.ctx.edge_id,
                self.sock.local_addr(),
            );
            req.sync = self.ctx.covered_sync_for(key);
            trace.bandwidth.add_cross_edge_control(req.wire_size());
            self.ctx.to_edge.push_wait(req, dst).ok();

            loop {
                let Some((msg, _)) = self.sock.recv_msg()? else {
                    if !self.ctx.running.is_running() {
                        return Ok(None);
                    }
                    // No reply also happens when the lock is contended: the
                    // beacon answers with a finish-block wake instead.
                    continue 'resend;
                };
                match &msg.kind {
                    MsgKind::AcquireWritelockResponse { key: k, result } if k == key => {
                        self.ctx.absorb_sync(&msg.sync);
                        trace.bandwidth.add_cross_edge_control(msg.wire_size());
                        match result {
                            LockResult::Success | LockResult::NoNeed => {
                                trace.events.add(
                                    "edge_acquire_writelock",
                                    started.elapsed().as_micros() as u32,
                                );
                                return Ok(Some(*result));
                            }
                            LockResult::Failure => {
                                if self.wait_finish_block(key)?.is_none() {
                                    return Ok(None);
                                }
                                continue 'resend;
                            }
                        }
                    }
                    MsgKind::FinishBlockRequest { key: k } => {
                        let k = k.clone();
                        self.ack_finish_block(&k, &msg)?;
                        if k == *key {
                            // Woken: the previous writer released; retry.
                            continue 'resend;
                        }
                    }
                    other => {
                        warn!(tag = other.tag(), "dropping unexpected message while acquiring lock");
                    }
                }
            }
        }
    }

    fn release_writelock(
        &mut self,
        key: &Key,
        trace: &mut Trace,
    ) -> Result<Option<()>, EdgeError> {
        let started = Instant::now();
        if self.ctx.is_local_beacon(key) {
            let blocked = beacon_server::handle_release_local(
                &self.ctx,
                key,
                self.ctx.edge_id,
                &self.ctx.covered_sync_for(key),
            );
            if super::broadcast_finish_block(&self.ctx, &mut self.sock, key, &blocked)? {
                return Ok(None);
            }
            trace
                .events
                .add("edge_release_writelock", started.elapsed().as_micros() as u32);
            return Ok(Some(()));
        }

        let beacon = self.ctx.fleet.beacon_of(key);
        let dst = self.ctx.fleet.beacon_server_addr(beacon);
        'resend: loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let mut req = Message::new(
                MsgKind::ReleaseWritelockRequest { key: key.clone() },
                self.ctx.edge_id,
                self.sock.local_addr(),
            );
            req.sync = self.ctx.covered_sync_for(key);
            trace.bandwidth.add_cross_edge_control(req.wire_size());
            self.ctx.to_edge.push_wait(req, dst).ok();

            loop {
                let Some((msg, _)) = self.sock.recv_msg()? else {
                    if !self.ctx.running.is_running() {
                        return Ok(None);
                    }
                    warn!(edge = self.ctx.edge_id, "timeout waiting for ReleaseWritelockResponse");
                    continue 'resend;
                };
                match &msg.kind {
                    MsgKind::ReleaseWritelockResponse { key: k } if k == key => {
                        self.ctx.absorb_sync(&msg.sync);
                        trace.bandwidth.add_cross_edge_control(msg.wire_size());
                        trace.events.add(
                            "edge_release_writelock",
                            started.elapsed().as_micros() as u32,
                        );
                        return Ok(Some(()));
                    }
                    MsgKind::FinishBlockRequest { key: k } => {
                        let k = k.clone();
                        self.ack_finish_block(&k, &msg)?;
                    }
                    other => {
                        warn!(tag = other.tag(), "dropping unexpected message while releasing lock");
                    }
                }
            }
        }
    }

    fn write_cloud(
        &mut self,
        key: &Key,
        value: Option<Value>,
        trace: &mut Trace,
    ) -> Result<Option<()>, EdgeError> {
        let dst = self.ctx.fleet.cloud_addr();
        let started = Instant::now();
        let req_kind = match value {
            Some(value) => MsgKind::GlobalPutRequest {
                key: key.clone(),
                value,
            },
            None => MsgKind::GlobalDelRequest { key: key.clone() },
        };
        'resend: loop {
            if !self.ctx.running.is_running() {
                return Ok(None);
            }
            let req = Message::new(req_kind.clone(), self.ctx.edge_id, self.sock.local_addr());
            trace.bandwidth.add_edge_cloud(req.wire_size());
            self.ctx.to_cloud.push_wait(req, dst).ok();

            loop {
                let Some((msg, _)) = self.sock.recv_msg()? else {
                    if !self.ctx.running.is_running() {
                        return Ok(None);
                    }
                    warn!(edge = self.ctx.edge_id, "timeout waiting for global write response");
                    continue 'resend;
                };
                match &msg.kind {
                    MsgKind::GlobalPutResponse { key: k } | MsgKind::GlobalDelResponse { key: k }
                        if k == key =>
                    {
                        trace.bandwidth.add_edge_cloud(msg.wire_size());
                        trace
                            .events
                            .add("edge_global_write", started.elapsed().as_micros() as u32);
                        return Ok(Some(()));
                    }
                    MsgKind::FinishBlockRequest { key: k } => {
                        let k = k.clone();
                        self.ack_finish_block(&k, &msg)?;
                    }
                    other => {
                        warn!(tag = other.tag(), "dropping unexpected message while writing origin");
                    }
                }
            }
        }
    }

    // Redirected requests: answered from the local cache only,
    // never forwarded further.

    fn process_redirected_get(&mut self, key: &Key, request: &Message) -> Result<bool, EdgeError> {
        self.ctx.absorb_sync(&request.sync);
        let (value, hitflag) = match self.ctx.cache.get_redirected(key) {
            GetResult::Hit(value) => (value, Hitflag::CooperativeHit),
            GetResult::Invalid => (Value::default(), Hitflag::CooperativeInvalid),
            GetResult::Miss => (Value::default(), Hitflag::GlobalMiss),
        };
        let mut rsp = Message::new(
            MsgKind::RedirectedGetResponse {
                key: key.clone(),
                value,
                hitflag,
            },
            self.ctx.edge_id,
            self.sock.local_addr(),
        );
        rsp.sync = self.ctx.covered_sync_for(key);
        self.ctx.to_edge.push_wait(rsp, request.source_addr).ok();
        Ok(false)
    }

    // Admission and directory maintenance; shared with the background
    // processors.

    fn admit_locally(&mut self, key: &Key, value: Value) -> Result<Option<()>, EdgeError> {
        let admitted = super::admit_with_directory(&self.ctx, &mut self.sock, key, value, false)?;
        Ok(admitted.map(|_| ()))
    }

    fn update_directory(&mut self, key: &Key, is_admit: bool) -> Result<Option<()>, EdgeError> {
        super::update_directory(&self.ctx, &mut self.sock, key, is_admit)
    }
}
