//! src/node.rs
//!
//! Core node/member data model: `Node`, `NodeState`, `MemberList`, and the
//! sequence-number scheme used to correlate probes with acks.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

/// A node's unique name. Cheaply clonable (`Arc<str>`-backed) since every
/// broadcast, probe, and membership record carries one around.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(Arc<str>);

impl NodeName {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeName {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Protocol negotiation vector carried by `alive` and `pushNodeState`
/// records: (pmin, pmax, pcur, dmin, dmax, dcur).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    pub protocol_min: u8,
    pub protocol_max: u8,
    pub protocol_cur: u8,
    pub delegate_min: u8,
    pub delegate_max: u8,
    pub delegate_cur: u8,
}

impl VersionVector {
    /// Whether `self` (local) and `other` (remote) share at least one
    /// pairwise-compatible protocol version.
    pub fn compatible_with(&self, other: &VersionVector) -> bool {
        let lo = self.protocol_min.max(other.protocol_min);
        let hi = self.protocol_max.min(other.protocol_max);
        lo <= hi
    }
}

/// A cluster member's identity and network location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: NodeName,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: VersionVector,
}

/// The three logical states a member can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeStateKind {
    Alive = 0,
    Suspect = 1,
    Dead = 2,
}

/// A node plus its membership bookkeeping: state, incarnation, and the time
/// of the last state change (used to drive suspicion timers and reaping).
#[derive(Clone, Debug)]
pub struct NodeState {
    pub node: Node,
    pub state: NodeStateKind,
    pub incarnation: u32,
    pub state_change: Instant,
}

impl NodeState {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            state: NodeStateKind::Alive,
            incarnation: 0,
            state_change: Instant::now(),
        }
    }
}

/// The ordered member list plus a name→position index. Lives behind a
/// single `RwLock` in `Membership` so that a state transition never
/// observes a torn list.
#[derive(Default)]
pub struct MemberList {
    nodes: Vec<NodeState>,
    index: HashMap<NodeName, usize>,
}

impl MemberList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &NodeName) -> Option<&NodeState> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, name: &NodeName) -> Option<&mut NodeState> {
        let i = *self.index.get(name)?;
        Some(&mut self.nodes[i])
    }

    pub fn contains(&self, name: &NodeName) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.iter()
    }

    /// Inserts a brand-new member. Panics if the name already exists — call
    /// sites must check `contains` first, matching the invariant that every
    /// name appears at most once.
    pub fn insert(&mut self, state: NodeState) {
        debug_assert!(!self.index.contains_key(&state.node.name));
        self.index.insert(state.node.name.clone(), self.nodes.len());
        self.nodes.push(state);
    }

    /// Removes a member by name, preserving the index for all others via a
    /// swap-remove-and-fix-up.
    pub fn remove(&mut self, name: &NodeName) -> Option<NodeState> {
        let i = self.index.remove(name)?;
        let removed = self.nodes.swap_remove(i);
        if i < self.nodes.len() {
            let moved_name = self.nodes[i].node.name.clone();
            self.index.insert(moved_name, i);
        }
        Some(removed)
    }

    /// All members that are not `dead`.
    pub fn live_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|s| s.state != NodeStateKind::Dead)
            .map(|s| s.node.clone())
            .collect()
    }

    pub fn num_live(&self) -> usize {
        self.nodes
            .iter()
            .filter(|s| s.state != NodeStateKind::Dead)
            .count()
    }

    /// Names eligible as probe/gossip targets: not `local_name`, and not
    /// `dead` (dead nodes awaiting reap and locally-left nodes are skipped).
    pub fn probe_candidates(&self, local_name: &NodeName) -> Vec<NodeName> {
        self.nodes
            .iter()
            .filter(|s| &s.node.name != local_name && s.state != NodeStateKind::Dead)
            .map(|s| s.node.name.clone())
            .collect()
    }
}

impl PartialEq for NodeStateKind {
    fn eq(&self, other: &Self) -> bool {
        *self as u8 == *other as u8
    }
}
impl Eq for NodeStateKind {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(name: &str) -> Node {
        Node {
            name: NodeName::new(name),
            addr: "127.0.0.1".parse().unwrap(),
            port: 7946,
            meta: Vec::new(),
            vsn: VersionVector {
                protocol_min: 1,
                protocol_max: 2,
                protocol_cur: 2,
                delegate_min: 0,
                delegate_max: 1,
                delegate_cur: 1,
            },
        }
    }

    #[test]
    fn insert_then_lookup_by_name() {
        let mut list = MemberList::new();
        list.insert(NodeState::new(make_node("a")));
        assert!(list.contains(&NodeName::new("a")));
        assert_eq!(list.get(&NodeName::new("a")).unwrap().node.name.as_str(), "a");
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_fixes_up_index_for_swapped_element() {
        let mut list = MemberList::new();
        list.insert(NodeState::new(make_node("a")));
        list.insert(NodeState::new(make_node("b")));
        list.insert(NodeState::new(make_node("c")));

        list.remove(&NodeName::new("a"));

        assert!(!list.contains(&NodeName::new("a")));
        assert!(list.contains(&NodeName::new("b")));
        assert!(list.contains(&NodeName::new("c")));
        assert_eq!(list.len(), 2);
        // The swapped-in element's index must still resolve correctly.
        assert_eq!(list.get(&NodeName::new("c")).unwrap().node.name.as_str(), "c");
    }

    #[test]
    fn live_nodes_excludes_dead() {
        let mut list = MemberList::new();
        list.insert(NodeState::new(make_node("a")));
        let mut dead = NodeState::new(make_node("b"));
        dead.state = NodeStateKind::Dead;
        list.insert(dead);

        assert_eq!(list.live_nodes().len(), 1);
        assert_eq!(list.num_live(), 1);
    }

    #[test]
    fn probe_candidates_excludes_self_and_dead() {
        let mut list = MemberList::new();
        list.insert(NodeState::new(make_node("self")));
        list.insert(NodeState::new(make_node("alive-peer")));
        let mut dead = NodeState::new(make_node("dead-peer"));
        dead.state = NodeStateKind::Dead;
        list.insert(dead);

        let candidates = list.probe_candidates(&NodeName::new("self"));
        assert_eq!(candidates, vec![NodeName::new("alive-peer")]);
    }

    #[test]
    fn version_vector_compatibility() {
        let a = VersionVector {
            protocol_min: 1,
            protocol_max: 2,
            protocol_cur: 2,
            delegate_min: 0,
            delegate_max: 1,
            delegate_cur: 1,
        };
        let b = VersionVector {
            protocol_min: 2,
            protocol_max: 2,
            protocol_cur: 2,
            delegate_min: 0,
            delegate_max: 1,
            delegate_cur: 1,
        };
        assert!(a.compatible_with(&b));

        let c = VersionVector {
            protocol_min: 3,
            protocol_max: 4,
            ..b
        };
        assert!(!a.compatible_with(&c));
    }
}
