//! src/delegate.rs
//!
//! The embedder-facing delegate contract. An embedder implements whichever
//! traits it needs; everything defaults to a no-op so a minimal integration
//! only has to implement `Delegate::node_meta`.

use crate::node::Node;

/// Core hooks every instance consults: local metadata to advertise, and an
/// opportunity to piggyback application messages onto outgoing gossip.
pub trait Delegate: Send + Sync {
    /// Metadata to attach to this node's own `Node` record (capped at
    /// `NODE_META_LIMIT` bytes by the caller, not by the delegate).
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// Called when a `user` message arrives via gossip or direct send.
    fn notify_msg(&self, _msg: &[u8]) {}

    /// Application-level broadcasts to piggyback on the next outgoing
    /// gossip message, up to `limit` total bytes. Each returned buffer is
    /// a complete, already-tagged wire message spliced directly into the
    /// outgoing compound envelope.
    fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
        Vec::new()
    }
}

/// State transfer hooks used during TCP push/pull anti-entropy.
pub trait MergeDelegate: Send + Sync {
    /// Application state to include in the push/pull exchange.
    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    /// Application state received from a peer during push/pull.
    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}

/// Veto hook: an embedder can reject an incoming push/pull merge outright.
pub trait ConflictDelegate: Send + Sync {
    /// Returning `Some(reason)` vetoes the merge.
    fn notify_merge(&self, _peers: &[Node]) -> Option<String> {
        None
    }

    /// Called when two conflicting `alive` records for the same name are
    /// seen at the same incarnation with different metadata.
    fn notify_conflict(&self, _existing: &Node, _other: &Node) {}
}

/// Membership-change observer hooks.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, _node: &Node) {}
    fn notify_leave(&self, _node: &Node) {}
    fn notify_update(&self, _node: &Node) {}
}

/// A `Delegate` that advertises no metadata and ignores every notification.
/// The default for `Core` when an embedder only cares about membership,
/// not application-level messaging.
pub struct NoopDelegate;

impl Delegate for NoopDelegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }
}

impl MergeDelegate for NoopDelegate {}
impl ConflictDelegate for NoopDelegate {}

/// An `EventDelegate` that drops every notification. Useful when an
/// embedder wants `Members()`/`NumMembers()` polling instead of push
/// notifications.
pub struct NoopEventDelegate;

impl EventDelegate for NoopEventDelegate {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_delegate_reports_no_metadata() {
        let d = NoopDelegate;
        assert!(d.node_meta(512).is_empty());
        assert!(d.get_broadcasts(0, 512).is_empty());
    }
}
