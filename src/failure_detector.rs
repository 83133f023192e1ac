//! src/failure_detector.rs
//!
//! The SWIM failure detector: a periodic direct probe with indirect fan-out
//! on timeout. Runs as its own tokio task, ticking once per `probe_interval`
//! against a round-robin-shuffled permutation of the member list so that
//! every member is probed roughly once per sweep.

use crate::codec::{self, MessageType};
use crate::config::Config;
use crate::membership::Membership;
use crate::node::NodeName;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outbound UDP datagrams the prober wants sent, handed to the transport
/// task over a channel rather than owning a socket directly.
pub struct Outbound {
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

type AckWaiters = Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>;

/// Drives periodic probing. Holds no socket itself — `send_tx` delivers
/// outbound datagrams to the UDP transport task, and `deliver_ack` is
/// called by the transport's receive loop when an `ack`/`nack` for one of
/// our in-flight probes arrives.
pub struct Prober {
    membership: Arc<Membership>,
    send_tx: tokio::sync::mpsc::Sender<Outbound>,
    seq_no: AtomicU32,
    waiters: AckWaiters,
    probe_interval: Duration,
    probe_timeout: Duration,
    indirect_checks: usize,
}

impl Prober {
    pub fn new(
        membership: Arc<Membership>,
        send_tx: tokio::sync::mpsc::Sender<Outbound>,
        config: &Config,
    ) -> Self {
        Self {
            membership,
            send_tx,
            seq_no: AtomicU32::new(0),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            probe_interval: config.probe_interval(),
            probe_timeout: config.probe_timeout(),
            indirect_checks: config.indirect_checks,
        }
    }

    fn next_seq_no(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::Relaxed)
    }

    /// Called by the transport's UDP receive loop when an `ack` arrives,
    /// matching it to a waiting probe by sequence number.
    pub fn deliver_ack(&self, seq_no: u32, payload: Vec<u8>) {
        if let Some(tx) = self.waiters.lock().unwrap().remove(&seq_no) {
            let _ = tx.send(payload);
        }
    }

    /// Runs the probe loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.probe_interval);
        let mut order: Vec<NodeName> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("prober shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if order.is_empty() {
                        order = self.membership.probe_candidates();
                        order.shuffle(&mut rand::thread_rng());
                    }
                    let Some(target) = order.pop() else { continue };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.probe_one(target).await });
                }
            }
        }
    }

    async fn probe_one(self: Arc<Self>, target: NodeName) {
        let Some((addr, port)) = self.membership.node_addr(&target) else {
            return;
        };
        let dest = SocketAddr::new(addr, port);
        let seq_no = self.next_seq_no();

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(seq_no, tx);

        if self.send_ping(dest, seq_no).await.is_err() {
            self.waiters.lock().unwrap().remove(&seq_no);
            return;
        }

        if tokio::time::timeout(self.probe_timeout, rx).await.is_ok() {
            return;
        }

        warn!(node = %target, "direct probe timed out, trying indirect");
        if self.indirect_probe(&target, dest, seq_no).await {
            return;
        }

        warn!(node = %target, "indirect probe also timed out, marking suspect");
        self.waiters.lock().unwrap().remove(&seq_no);
        let incarnation = self.membership.incarnation_of(&target).unwrap_or(0);
        self.membership.handle_suspect(target, incarnation);
    }

    async fn send_ping(&self, dest: SocketAddr, seq_no: u32) -> Result<(), ()> {
        let record = codec::Ping {
            seq_no,
            node: self.membership.local_name().clone(),
            source_addr: dest.ip(),
            source_port: dest.port(),
        };
        let Ok(payload) = codec::encode_message(MessageType::Ping, &record) else {
            return Err(());
        };
        let payload = self.membership.piggyback(payload);
        self.send_tx
            .send(Outbound { addr: dest, payload })
            .await
            .map_err(|_| ())
    }

    /// Used by the UDP dispatch loop to relay an `indirectPing` request: we
    /// ping `target` ourselves and report back whether it acked in time.
    pub async fn relay_probe(&self, target: SocketAddr) -> bool {
        let seq_no = self.next_seq_no();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(seq_no, tx);
        if self.send_ping(target, seq_no).await.is_err() {
            self.waiters.lock().unwrap().remove(&seq_no);
            return false;
        }
        tokio::time::timeout(self.probe_timeout, rx).await.is_ok()
    }

    async fn indirect_probe(&self, target: &NodeName, dest: SocketAddr, seq_no: u32) -> bool {
        let mut helpers = self.membership.probe_candidates();
        helpers.retain(|n| n != target);
        helpers.shuffle(&mut rand::thread_rng());
        helpers.truncate(self.indirect_checks);

        if helpers.is_empty() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(seq_no, tx);

        for helper in helpers {
            let Some((addr, port)) = self.membership.node_addr(&helper) else {
                continue;
            };
            let record = codec::IndirectPing {
                seq_no,
                target: target.clone(),
                target_addr: dest.ip(),
                target_port: dest.port(),
                node: self.membership.local_name().clone(),
            };
            if let Ok(payload) = codec::encode_message(MessageType::IndirectPing, &record) {
                let _ = self
                    .send_tx
                    .send(Outbound {
                        addr: SocketAddr::new(addr, port),
                        payload,
                    })
                    .await;
            }
        }

        let remaining = self.probe_timeout;
        let deadline = Instant::now() + remaining;
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::timeout(remaining, rx).await.is_ok()
    }
}
