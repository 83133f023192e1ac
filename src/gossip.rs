//! src/gossip.rs
//!
//! The gossip dissemination loop. On each tick, picks `gossip_nodes` random
//! live peers and sends each a `compound` message built from whatever
//! broadcasts are pending in the queue, plus anything the delegate wants
//! to piggyback.

use crate::broadcast::UDP_SAFE_PAYLOAD;
use crate::codec;
use crate::config::Config;
use crate::delegate::Delegate;
use crate::failure_detector::Outbound;
use crate::membership::Membership;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Gossiper {
    membership: Arc<Membership>,
    delegate: Arc<dyn Delegate>,
    send_tx: tokio::sync::mpsc::Sender<Outbound>,
    interval: std::time::Duration,
    gossip_nodes: usize,
}

impl Gossiper {
    pub fn new(
        membership: Arc<Membership>,
        delegate: Arc<dyn Delegate>,
        send_tx: tokio::sync::mpsc::Sender<Outbound>,
        config: &Config,
    ) -> Self {
        Self {
            membership,
            delegate,
            send_tx,
            interval: config.gossip_interval(),
            gossip_nodes: config.gossip_nodes,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("gossiper shutting down");
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let broadcasts = self.membership.take_broadcasts(UDP_SAFE_PAYLOAD);
        let mut used: usize = broadcasts.iter().map(|b| b.payload.len()).sum();
        let mut messages: Vec<Vec<u8>> = broadcasts.into_iter().map(|b| b.payload).collect();

        if used < UDP_SAFE_PAYLOAD {
            // Each sub-message in a `compound` envelope costs 4 bytes for its
            // length prefix on top of its own encoded size.
            const COMPOUND_MESSAGE_OVERHEAD: usize = 4;
            let extra = self
                .delegate
                .get_broadcasts(COMPOUND_MESSAGE_OVERHEAD, UDP_SAFE_PAYLOAD - used);
            for msg in extra {
                used += msg.len();
                messages.push(msg);
            }
        }

        if messages.is_empty() {
            return;
        }

        let Ok(compound) = codec::wrap_compound(&messages) else {
            return;
        };

        let mut targets = self.membership.probe_candidates();
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(self.gossip_nodes);

        for target in targets {
            let Some((addr, port)) = self.membership.node_addr(&target) else {
                continue;
            };
            let dest = SocketAddr::new(addr, port);
            let _ = self
                .send_tx
                .send(Outbound {
                    addr: dest,
                    payload: compound.clone(),
                })
                .await;
        }
    }
}
