//! src/membership/mod.rs
//!
//! The membership state machine. Owns the single `RwLock<MemberList>` for
//! this instance — every mutation goes through `Membership`, so a reader
//! never observes a state transition half applied. Suspicion timeouts and
//! dead-node reaping run as detached tokio tasks that call back into
//! `Membership` once their deadline elapses.

pub mod state;

use crate::broadcast::{Broadcast, BroadcastQueue, UDP_SAFE_PAYLOAD};
use crate::codec::{self, MessageType};
use crate::delegate::{ConflictDelegate, EventDelegate};
use crate::node::{MemberList, Node, NodeName, NodeState, NodeStateKind, VersionVector};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Membership {
    local_name: NodeName,
    list: RwLock<MemberList>,
    incarnation: AtomicU32,
    broadcasts: Mutex<BroadcastQueue>,
    event_delegate: Arc<dyn EventDelegate>,
    conflict_delegate: Arc<dyn ConflictDelegate>,
    suspicion_mult: u32,
    retransmit_mult: u32,
    probe_interval: Duration,
    dead_node_reclaim: Duration,
}

impl Membership {
    pub fn new(
        local_name: NodeName,
        event_delegate: Arc<dyn EventDelegate>,
        conflict_delegate: Arc<dyn ConflictDelegate>,
        suspicion_mult: u32,
        retransmit_mult: u32,
        probe_interval: Duration,
        dead_node_reclaim: Duration,
    ) -> Self {
        Self {
            local_name,
            list: RwLock::new(MemberList::new()),
            incarnation: AtomicU32::new(0),
            broadcasts: Mutex::new(BroadcastQueue::new()),
            event_delegate,
            conflict_delegate,
            suspicion_mult,
            retransmit_mult,
            probe_interval,
            dead_node_reclaim,
        }
    }

    pub fn local_name(&self) -> &NodeName {
        &self.local_name
    }

    pub fn local_incarnation(&self) -> u32 {
        self.incarnation.load(Ordering::SeqCst)
    }

    /// Registers the local node itself as alive at incarnation 0, seeding
    /// the member list with exactly the local node.
    pub fn join_local(&self, node: Node) {
        let mut list = self.list.write().unwrap();
        list.insert(NodeState::new(node));
    }

    pub fn members(&self) -> Vec<Node> {
        self.list.read().unwrap().live_nodes()
    }

    pub fn num_members(&self) -> usize {
        self.list.read().unwrap().num_live().max(1)
    }

    pub fn probe_candidates(&self) -> Vec<NodeName> {
        self.list.read().unwrap().probe_candidates(&self.local_name)
    }

    pub fn node_addr(&self, name: &NodeName) -> Option<(std::net::IpAddr, u16)> {
        self.list
            .read()
            .unwrap()
            .get(name)
            .map(|s| (s.node.addr, s.node.port))
    }

    /// The incarnation a node was last known at, if it is still tracked.
    /// Used by the failure detector so a locally-raised suspicion carries
    /// the target's real incarnation rather than a stale guess.
    pub fn incarnation_of(&self, name: &NodeName) -> Option<u32> {
        self.list.read().unwrap().get(name).map(|s| s.incarnation)
    }

    /// The local node's own version vector, for push/pull protocol
    /// negotiation.
    pub fn local_vsn(&self) -> VersionVector {
        self.local_node().vsn
    }

    /// Suspicion/dead-node timeouts scale with cluster size: `SuspicionMult
    /// · log10(max(1,N)) · ProbeInterval`.
    fn suspicion_timeout(&self) -> Duration {
        let n = self.num_members() as f64;
        let factor = (self.suspicion_mult as f64) * n.max(1.0).log10().max(0.0);
        self.probe_interval.mul_f64(factor.max(1.0))
    }

    fn retransmit_limit(&self) -> u32 {
        BroadcastQueue::retransmit_limit(self.retransmit_mult, self.num_members())
    }

    /// Pulls up to `UDP_SAFE_PAYLOAD` bytes of pending broadcasts to
    /// piggyback on an outgoing probe, ack, or gossip message.
    pub fn take_broadcasts(&self, budget: usize) -> Vec<Broadcast> {
        let limit = self.retransmit_limit();
        self.broadcasts.lock().unwrap().dequeue(budget, limit)
    }

    /// Whether there is anything left in the broadcast queue, without
    /// mutating transmit counts. `Leave` polls this to know when its own
    /// departure notice has finished propagating.
    pub fn broadcast_queue_is_empty(&self) -> bool {
        self.broadcasts.lock().unwrap().is_empty()
    }

    /// Wraps `message` together with any pending broadcasts into a
    /// `compound` envelope: every outgoing UDP datagram is an opportunity to
    /// disseminate gossip, not just the periodic gossip tick. Returns
    /// `message` unchanged if there is nothing to piggyback or the budget is
    /// already spent.
    pub fn piggyback(&self, message: Vec<u8>) -> Vec<u8> {
        if message.len() >= UDP_SAFE_PAYLOAD {
            return message;
        }
        let extras = self.take_broadcasts(UDP_SAFE_PAYLOAD - message.len());
        if extras.is_empty() {
            return message;
        }
        let mut all = vec![message];
        all.extend(extras.into_iter().map(|b| b.payload));
        codec::wrap_compound(&all).unwrap_or_else(|_| all.remove(0))
    }

    fn queue_broadcast(&self, key: NodeName, payload: Vec<u8>) {
        self.broadcasts
            .lock()
            .unwrap()
            .queue_broadcast(Broadcast::new(key.as_str().to_string(), payload));
    }

    /// Bumps the local incarnation strictly past `incoming` and returns the
    /// fresh value to broadcast as an `alive` record. Called whenever the
    /// local node must refute a `suspect`/`dead`/conflicting `alive` rumor
    /// about itself — the result must exceed the rumor's own incarnation,
    /// not just whatever the local node was previously at.
    fn refute(&self, incoming: u32) -> u32 {
        let mut current = self.incarnation.load(Ordering::SeqCst);
        loop {
            let next = current.max(incoming) + 1;
            match self.incarnation.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    info!(incarnation = next, "refuting rumor about local node");
                    return next;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Applies a voluntary local metadata change: mutates the member-list
    /// entry directly and bumps the incarnation, then broadcasts the
    /// result. Distinct from `handle_alive`, which treats any record about
    /// the local node as an external rumor to refute rather than a trusted
    /// update — routing a local change through it would discard the new
    /// metadata.
    pub fn update_local_meta(&self, meta: Vec<u8>) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let node = {
            let mut list = self.list.write().unwrap();
            let entry = list
                .get_mut(&self.local_name)
                .expect("local node must be present after join_local");
            entry.node.meta = meta;
            entry.incarnation = incarnation;
            entry.state_change = std::time::Instant::now();
            entry.node.clone()
        };
        self.broadcast_alive(&node, incarnation);
    }

    fn local_node(&self) -> Node {
        self.list
            .read()
            .unwrap()
            .get(&self.local_name)
            .expect("local node must be present after join_local")
            .node
            .clone()
    }

    fn broadcast_alive(&self, node: &Node, incarnation: u32) {
        let record = codec::Alive {
            incarnation,
            node: node.name.clone(),
            addr: node.addr,
            port: node.port,
            meta: node.meta.clone(),
            vsn: node.vsn,
        };
        if let Ok(payload) = codec::encode_message(MessageType::Alive, &record) {
            self.queue_broadcast(node.name.clone(), payload);
        }
    }

    fn broadcast_suspect(&self, target: &NodeName, incarnation: u32) {
        let record = codec::Suspect {
            incarnation,
            node: target.clone(),
            from: self.local_name.clone(),
        };
        if let Ok(payload) = codec::encode_message(MessageType::Suspect, &record) {
            self.queue_broadcast(target.clone(), payload);
        }
    }

    fn broadcast_dead(&self, target: &NodeName, incarnation: u32) {
        let record = codec::Dead {
            incarnation,
            node: target.clone(),
            from: self.local_name.clone(),
        };
        if let Ok(payload) = codec::encode_message(MessageType::Dead, &record) {
            self.queue_broadcast(target.clone(), payload);
        }
    }

    /// Applies an incoming `alive` record.
    pub fn handle_alive(self: &Arc<Self>, node: Node, incarnation: u32) {
        let local_incarnation = self.local_incarnation();
        let outcome = {
            let mut list = self.list.write().unwrap();
            state::apply_alive(&mut list, &self.local_name, local_incarnation, node.clone(), incarnation)
        };
        match outcome {
            state::Outcome::Joined => {
                self.broadcast_alive(&node, incarnation);
                self.event_delegate.notify_join(&node);
            }
            state::Outcome::Updated => {
                self.broadcast_alive(&node, incarnation);
                self.event_delegate.notify_update(&node);
            }
            state::Outcome::Conflict(old) => {
                self.broadcast_alive(&node, incarnation);
                self.event_delegate.notify_update(&node);
                self.conflict_delegate.notify_conflict(&old, &node);
            }
            state::Outcome::Refute => {
                let new_incarnation = self.refute(incarnation);
                let local = self.local_node();
                self.broadcast_alive(&local, new_incarnation);
            }
            state::Outcome::Ignored => {}
        }
    }

    /// Applies an incoming `suspect` record, starting a suspicion timer on
    /// a real transition.
    pub fn handle_suspect(self: &Arc<Self>, target: NodeName, incarnation: u32) {
        let local_incarnation = self.local_incarnation();
        let outcome = {
            let mut list = self.list.write().unwrap();
            state::apply_suspect(&mut list, &self.local_name, local_incarnation, &target, incarnation)
        };
        match outcome {
            state::Outcome::Updated => {
                self.broadcast_suspect(&target, incarnation);
                warn!(node = %target, incarnation, "node is now suspect");
                self.spawn_suspicion_timer(target, incarnation);
            }
            state::Outcome::Refute => {
                let new_incarnation = self.refute(incarnation);
                let local = self.local_node();
                self.broadcast_alive(&local, new_incarnation);
            }
            state::Outcome::Ignored | state::Outcome::Joined | state::Outcome::Conflict(_) => {}
        }
    }

    fn spawn_suspicion_timer(self: &Arc<Self>, target: NodeName, incarnation: u32) {
        let timeout = self.suspicion_timeout();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_suspect = this
                .list
                .read()
                .unwrap()
                .get(&target)
                .map(|s| s.state == NodeStateKind::Suspect && s.incarnation == incarnation)
                .unwrap_or(false);
            if still_suspect {
                debug!(node = %target, "suspicion timer elapsed, declaring dead");
                this.handle_dead(target, incarnation);
            }
        });
    }

    /// Applies an incoming (or locally-generated) `dead` record, scheduling
    /// eventual reap of the entry.
    pub fn handle_dead(self: &Arc<Self>, target: NodeName, incarnation: u32) {
        let local_incarnation = self.local_incarnation();
        let outcome = {
            let mut list = self.list.write().unwrap();
            state::apply_dead(&mut list, &self.local_name, local_incarnation, &target, incarnation)
        };
        match outcome {
            state::Outcome::Updated => {
                self.broadcast_dead(&target, incarnation);
                let node = self.list.read().unwrap().get(&target).map(|s| s.node.clone());
                if let Some(node) = node {
                    self.event_delegate.notify_leave(&node);
                }
                info!(node = %target, "node is now dead");
                self.spawn_reap_timer(target);
            }
            state::Outcome::Refute => {
                let new_incarnation = self.refute(incarnation);
                let local = self.local_node();
                self.broadcast_alive(&local, new_incarnation);
            }
            state::Outcome::Ignored | state::Outcome::Joined | state::Outcome::Conflict(_) => {}
        }
    }

    fn spawn_reap_timer(self: &Arc<Self>, target: NodeName) {
        let delay = self.dead_node_reclaim;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut list = this.list.write().unwrap();
            if let Some(state) = list.get(&target) {
                if state.state == NodeStateKind::Dead {
                    list.remove(&target);
                    debug!(node = %target, "reaped dead node from member list");
                }
            }
        });
    }

    /// Applies the local node's own voluntary departure: broadcasts a
    /// `dead` record about itself with a bumped incarnation so it can't be
    /// refuted as a false rumor.
    pub fn leave(self: &Arc<Self>) {
        let incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
        let name = self.local_name.clone();
        {
            let mut list = self.list.write().unwrap();
            if let Some(entry) = list.get_mut(&name) {
                entry.state = NodeStateKind::Dead;
                entry.incarnation = incarnation;
            }
        }
        self.broadcast_dead(&name, incarnation);
    }

    /// Merges the node list received during TCP push/pull anti-entropy.
    /// Each remote entry is applied exactly as if it had arrived as an
    /// individual `alive`/`suspect`/`dead` gossip record.
    pub fn merge_remote_state(self: &Arc<Self>, states: Vec<codec::PushNodeState>) {
        for remote in states {
            if remote.name == self.local_name {
                continue;
            }
            let node = Node {
                name: remote.name.clone(),
                addr: remote.addr,
                port: remote.port,
                meta: remote.meta,
                vsn: remote.vsn,
            };
            match remote.state {
                s if s == NodeStateKind::Dead as u8 => {
                    self.handle_dead(remote.name, remote.incarnation)
                }
                s if s == NodeStateKind::Suspect as u8 => {
                    self.handle_alive(node.clone(), remote.incarnation);
                    self.handle_suspect(remote.name, remote.incarnation);
                }
                _ => self.handle_alive(node, remote.incarnation),
            }
        }
    }

    /// Snapshots the full member list as `PushNodeState` records for an
    /// outgoing push/pull exchange.
    pub fn snapshot(&self) -> Vec<codec::PushNodeState> {
        self.list
            .read()
            .unwrap()
            .iter()
            .map(|s| codec::PushNodeState {
                name: s.node.name.clone(),
                addr: s.node.addr,
                port: s.node.port,
                meta: s.node.meta.clone(),
                incarnation: s.incarnation,
                state: s.state as u8,
                vsn: s.node.vsn,
            })
            .collect()
    }
}
