//! src/membership/state.rs
//!
//! Pure incarnation-conflict-resolution logic for the three record types
//! that drive the state machine: `alive`, `suspect`, `dead`. Kept free of
//! I/O and locking so the transition rules can be unit tested directly
//! against a `MemberList`.

use crate::node::{MemberList, Node, NodeState, NodeStateKind};

/// What happened as a result of applying an incoming record. The caller
/// (`Membership`) uses this to decide whether to queue a broadcast, fire a
/// delegate notification, or refute on the local node's behalf.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The record was for an unknown node, who has been added.
    Joined,
    /// An existing node's state or incarnation changed.
    Updated,
    /// Two `alive` records for the same node at the same incarnation
    /// disagreed on metadata; the incoming one won and `Node` carries the
    /// node's value *before* this update, for `ConflictDelegate::notify_conflict`.
    Conflict(Node),
    /// The incoming record targeted the local node and must be refuted by
    /// incrementing the local incarnation and broadcasting a fresh `alive`.
    Refute,
    /// The record was stale (incarnation too low) or otherwise a no-op.
    Ignored,
}

/// Applies an incoming `alive` record: alive always wins over suspect/dead
/// at a lower incarnation, and ties prefer alive.
pub fn apply_alive(
    list: &mut MemberList,
    local_name: &crate::node::NodeName,
    local_incarnation: u32,
    incoming: Node,
    incarnation: u32,
) -> Outcome {
    if &incoming.name == local_name {
        // Someone is gossiping about us. Only refute if the claimed
        // incarnation is not behind our own — an old, looping copy of our
        // own `alive` record isn't a real conflict.
        return if incarnation >= local_incarnation {
            Outcome::Refute
        } else {
            Outcome::Ignored
        };
    }

    match list.get(&incoming.name) {
        None => {
            list.insert(NodeState {
                node: incoming,
                state: NodeStateKind::Alive,
                incarnation,
                state_change: std::time::Instant::now(),
            });
            Outcome::Joined
        }
        Some(existing) => {
            if incarnation < existing.incarnation {
                return Outcome::Ignored;
            }
            if incarnation == existing.incarnation && existing.state == NodeStateKind::Alive {
                if existing.node.meta == incoming.meta {
                    return Outcome::Ignored;
                }
                let old = existing.node.clone();
                let entry = list.get_mut(&incoming.name).unwrap();
                entry.node = incoming;
                entry.state_change = std::time::Instant::now();
                return Outcome::Conflict(old);
            }
            let entry = list.get_mut(&incoming.name).unwrap();
            entry.node = incoming;
            entry.state = NodeStateKind::Alive;
            entry.incarnation = incarnation;
            entry.state_change = std::time::Instant::now();
            Outcome::Updated
        }
    }
}

/// Applies an incoming `suspect` record: only applies to a currently-alive
/// node at the same or higher incarnation; a dead node is immune.
pub fn apply_suspect(
    list: &mut MemberList,
    local_name: &crate::node::NodeName,
    local_incarnation: u32,
    target: &crate::node::NodeName,
    incarnation: u32,
) -> Outcome {
    if target == local_name {
        return if incarnation >= local_incarnation {
            Outcome::Refute
        } else {
            Outcome::Ignored
        };
    }

    let Some(existing) = list.get(target) else {
        return Outcome::Ignored;
    };
    if existing.state == NodeStateKind::Dead || incarnation < existing.incarnation {
        return Outcome::Ignored;
    }
    if existing.state == NodeStateKind::Suspect && incarnation == existing.incarnation {
        return Outcome::Ignored;
    }

    let entry = list.get_mut(target).unwrap();
    entry.state = NodeStateKind::Suspect;
    entry.incarnation = incarnation;
    entry.state_change = std::time::Instant::now();
    Outcome::Updated
}

/// Applies an incoming `dead` record: terminal unless refuted — a dead node
/// can still be resurrected by a later, higher-incarnation `alive`.
pub fn apply_dead(
    list: &mut MemberList,
    local_name: &crate::node::NodeName,
    local_incarnation: u32,
    target: &crate::node::NodeName,
    incarnation: u32,
) -> Outcome {
    if target == local_name {
        return if incarnation >= local_incarnation {
            Outcome::Refute
        } else {
            Outcome::Ignored
        };
    }

    let Some(existing) = list.get(target) else {
        return Outcome::Ignored;
    };
    if existing.state == NodeStateKind::Dead || incarnation < existing.incarnation {
        return Outcome::Ignored;
    }

    let entry = list.get_mut(target).unwrap();
    entry.state = NodeStateKind::Dead;
    entry.incarnation = incarnation;
    entry.state_change = std::time::Instant::now();
    Outcome::Updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeName, VersionVector};

    fn node(name: &str) -> Node {
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
    fn alive_adds_unknown_node() {
        let mut list = MemberList::new();
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 0);
        assert_eq!(outcome, Outcome::Joined);
        assert!(list.contains(&NodeName::new("peer")));
    }

    #[test]
    fn alive_ignores_stale_incarnation() {
        let mut list = MemberList::new();
        apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 5);
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 3);
        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(list.get(&NodeName::new("peer")).unwrap().incarnation, 5);
    }

    #[test]
    fn alive_about_self_triggers_refute_when_not_stale() {
        let mut list = MemberList::new();
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 3, node("self"), 3);
        assert_eq!(outcome, Outcome::Refute);
    }

    #[test]
    fn alive_about_self_ignored_when_stale() {
        let mut list = MemberList::new();
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 5, node("self"), 2);
        assert_eq!(outcome, Outcome::Ignored);
    }

    #[test]
    fn alive_same_incarnation_updates_differing_metadata() {
        let mut list = MemberList::new();
        apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 4);

        let mut changed = node("peer");
        changed.meta = vec![9, 9];
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 0, changed.clone(), 4);
        match outcome {
            Outcome::Conflict(old) => assert!(old.meta.is_empty()),
            other => panic!("expected Conflict, got {other:?}"),
        }
        let entry = list.get(&NodeName::new("peer")).unwrap();
        assert_eq!(entry.node.meta, vec![9, 9]);
        assert_eq!(entry.incarnation, 4);
    }

    #[test]
    fn alive_same_incarnation_same_metadata_is_ignored() {
        let mut list = MemberList::new();
        apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 4);
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 4);
        assert_eq!(outcome, Outcome::Ignored);
    }

    #[test]
    fn suspect_marks_alive_node_suspect() {
        let mut list = MemberList::new();
        apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 1);
        let outcome = apply_suspect(&mut list, &NodeName::new("self"), 0, &NodeName::new("peer"), 1);
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(
            list.get(&NodeName::new("peer")).unwrap().state,
            NodeStateKind::Suspect
        );
    }

    #[test]
    fn suspect_is_immune_once_dead() {
        let mut list = MemberList::new();
        apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 1);
        apply_dead(&mut list, &NodeName::new("self"), 0, &NodeName::new("peer"), 1);
        let outcome = apply_suspect(&mut list, &NodeName::new("self"), 0, &NodeName::new("peer"), 2);
        assert_eq!(outcome, Outcome::Ignored);
    }

    #[test]
    fn suspect_about_self_triggers_refute() {
        let mut list = MemberList::new();
        let outcome = apply_suspect(&mut list, &NodeName::new("self"), 2, &NodeName::new("self"), 2);
        assert_eq!(outcome, Outcome::Refute);
    }

    #[test]
    fn dead_resurrection_via_higher_incarnation_alive() {
        let mut list = MemberList::new();
        apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 1);
        apply_dead(&mut list, &NodeName::new("self"), 0, &NodeName::new("peer"), 1);
        let outcome = apply_alive(&mut list, &NodeName::new("self"), 0, node("peer"), 2);
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(
            list.get(&NodeName::new("peer")).unwrap().state,
            NodeStateKind::Alive
        );
    }
}
