// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Per-link propagation queues. Every outbound message crosses a bounded
//! FIFO whose consumer thread holds it for the configured link latency
//! before handing it to the real transport. This is the only place in the
//! system where wall-clock sleeping happens; with zero latency the thread is
//! a plain send pump. A real deployment replaces the queue with a socket.

use std::net::Ipv4Addr;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use super::{MsgSocket, NetError, NetworkAddr};
use crate::message::Message;
use crate::node::Running;

struct QueuedMsg {
    msg: Message,
    dst: NetworkAddr,
    enqueued: Instant,
}

/// Producer handle to one link's FIFO. FIFO order among messages pushed on
/// the same link is preserved by the single consumer thread.
#[derive(Clone)]
pub struct PropagationHandle {
    tx: flume::Sender<QueuedMsg>,
}

impl PropagationHandle {
    /// Enqueue one message without waiting. Fails when the link buffer is
    /// full or the consumer has shut down.
    pub fn push(&self, msg: Message, dst: NetworkAddr) -> Result<(), NetError> {
        self.tx
            .try_send(QueuedMsg {
                msg,
                dst,
                enqueued: Instant::now(),
            })
            .map_err(|err| match err {
                flume::TrySendError::Full(_) => NetError::QueueFull,
                flume::TrySendError::Disconnected(_) => NetError::QueueClosed,
            })
    }

    /// Enqueue one message, blocking while the bounded buffer is full. The
    /// consumer never stops draining before shutdown, so producers cannot
    /// starve it.
    pub fn push_wait(&self, msg: Message, dst: NetworkAddr) -> Result<(), NetError> {
        self.tx
            .send(QueuedMsg {
                msg,
                dst,
                enqueued: Instant::now(),
            })
            .map_err(|_| NetError::QueueClosed)
    }
}

pub struct PropagationQueue {
    rx: flume::Receiver<QueuedMsg>,
    latency: Duration,
    running: Running,
}

impl PropagationQueue {
    pub fn new(latency_us: u64, capacity: usize, running: Running) -> (PropagationHandle, Self) {
        let (tx, rx) = flume::bounded(capacity);
        (
            PropagationHandle { tx },
            PropagationQueue {
                rx,
                latency: Duration::from_micros(latency_us),
                running,
            },
        )
    }

    fn run(mut self, mut socket: MsgSocket, name: &str) {
        debug!(link = name, latency = ?self.latency, "propagation queue up");
        while self.running.is_running() {
            let item = match self.rx.recv_timeout(Duration::from_millis(50)) {
                Ok(item) => item,
                Err(flume::RecvTimeoutError::Timeout) => continue,
                Err(flume::RecvTimeoutError::Disconnected) => break,
            };
            // Hold the message until the programmed link delay has elapsed.
            let elapsed = item.enqueued.elapsed();
            if elapsed < self.latency {
                std::thread::sleep(self.latency - elapsed);
            }
            if let Err(err) = socket.send_msg(&item.msg, item.dst) {
                error!(link = name, dst = %item.dst, %err, "propagation send failed");
            }
        }
        self.drain(&mut socket, name);
    }

    /// Flush whatever is still queued so shutdown does not strand acks.
    fn drain(&mut self, socket: &mut MsgSocket, name: &str) {
        while let Ok(item) = self.rx.try_recv() {
            if let Err(err) = socket.send_msg(&item.msg, item.dst) {
                error!(link = name, dst = %item.dst, %err, "drain send failed");
            }
        }
    }
}

/// Spawn the consumer thread for one link class.
pub fn spawn_propagation_thread(
    queue: PropagationQueue,
    name: &'static str,
) -> Result<JoinHandle<()>, NetError> {
    let socket = MsgSocket::bind_ephemeral(Ipv4Addr::UNSPECIFIED, Duration::from_millis(50))?;
    let handle = std::thread::Builder::new()
        .name(format!("propagation-{name}"))
        .spawn(move || queue.run(socket, name))
        .map_err(NetError::Io)?;
    Ok(handle)
}
