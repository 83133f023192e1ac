//! src/broadcast.rs
//!
//! The gossip broadcast queue. Every state change (alive, suspect, dead,
//! user message) becomes a `Broadcast` keyed by an "invalidation key":
//! queuing a broadcast whose key matches one already queued replaces the
//! older entry outright rather than sending both. Dequeue prefers
//! broadcasts that have been sent the fewest times, so gossip fans out
//! evenly instead of always describing the same entry.

use indexmap::IndexMap;

/// The largest single-datagram payload this queue will pack: conservative
/// relative to the common 1500-byte link MTU, after subtracting IP/UDP
/// headers.
pub const UDP_SAFE_PAYLOAD: usize = 1400;

/// One queued broadcast: its invalidation key, serialized contents, and how
/// many times it has gone out so far.
#[derive(Clone, Debug)]
pub struct Broadcast {
    pub key: String,
    pub payload: Vec<u8>,
    transmits: u32,
}

impl Broadcast {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            transmits: 0,
        }
    }

    pub fn transmits(&self) -> u32 {
        self.transmits
    }
}

/// Insertion-ordered, invalidation-key-deduplicated broadcast queue.
#[derive(Default)]
pub struct BroadcastQueue {
    entries: IndexMap<String, Broadcast>,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues a broadcast, superseding any existing entry under the same
    /// invalidation key: the old entry is dropped and its transmit count
    /// reset to zero. The new entry's insertion slot is explicitly NOT the
    /// old one's — it moves to the back, matching the observable behavior
    /// that a refreshed fact gossips as newly arrived.
    pub fn queue_broadcast(&mut self, broadcast: Broadcast) {
        self.entries.shift_remove(&broadcast.key);
        self.entries.insert(broadcast.key.clone(), broadcast);
    }

    /// Computes the retransmit ceiling for a cluster of `num_nodes` members.
    pub fn retransmit_limit(retransmit_mult: u32, num_nodes: usize) -> u32 {
        let n = num_nodes.max(1) as f64;
        let factor = ((n + 1.0).log10()).ceil().max(0.0) as u32;
        retransmit_mult * factor.max(1)
    }

    /// Selects broadcasts to piggyback on an outgoing message, filling up
    /// to `budget` bytes. Entries are chosen lowest-transmit-count first
    /// (ties broken by insertion/queue order) so that every fact gets an
    /// even number of airings. Selected entries have their transmit count
    /// incremented; any entry whose transmit count reaches `retransmit_limit`
    /// is dropped from the queue entirely.
    pub fn dequeue(&mut self, budget: usize, retransmit_limit: u32) -> Vec<Broadcast> {
        let mut candidates: Vec<String> = self.entries.keys().cloned().collect();
        candidates.sort_by_key(|k| self.entries[k].transmits);

        let mut selected = Vec::new();
        let mut used = 0usize;
        let mut exhausted = Vec::new();

        for key in candidates {
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if used + entry.payload.len() > budget && used > 0 {
                continue;
            }
            used += entry.payload.len();
            entry.transmits += 1;
            selected.push(entry.clone());
            if entry.transmits >= retransmit_limit {
                exhausted.push(key);
            }
            if used >= budget {
                break;
            }
        }

        for key in exhausted {
            self.entries.shift_remove(&key);
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_dedupes_by_invalidation_key() {
        let mut q = BroadcastQueue::new();
        q.queue_broadcast(Broadcast::new("node-a", vec![1]));
        q.queue_broadcast(Broadcast::new("node-a", vec![2]));
        assert_eq!(q.len(), 1);
        let selected = q.dequeue(1024, 10);
        assert_eq!(selected[0].payload, vec![2]);
    }

    #[test]
    fn dequeue_prefers_fewest_transmits() {
        let mut q = BroadcastQueue::new();
        q.queue_broadcast(Broadcast::new("a", vec![0; 10]));
        q.queue_broadcast(Broadcast::new("b", vec![0; 10]));

        // Send "a" once already.
        let first = q.dequeue(10, 100);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].key, "a");

        // "b" has fewer transmits now (0 vs 1), so it goes first on a
        // budget that can only fit one entry.
        let second = q.dequeue(10, 100);
        assert_eq!(second[0].key, "b");
    }

    #[test]
    fn dequeue_respects_byte_budget() {
        let mut q = BroadcastQueue::new();
        q.queue_broadcast(Broadcast::new("a", vec![0; 100]));
        q.queue_broadcast(Broadcast::new("b", vec![0; 100]));
        let selected = q.dequeue(150, 100);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn dequeue_drops_entry_once_it_reaches_the_retransmit_limit() {
        let mut q = BroadcastQueue::new();
        q.queue_broadcast(Broadcast::new("a", vec![0; 10]));
        for _ in 0..2 {
            q.dequeue(10, 2);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn retransmit_limit_scales_with_cluster_size() {
        assert_eq!(BroadcastQueue::retransmit_limit(4, 1), 4);
        assert!(BroadcastQueue::retransmit_limit(4, 100) > BroadcastQueue::retransmit_limit(4, 1));
    }
}
