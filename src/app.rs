//! src/app.rs
//!
//! `Core`: the public entry point. Orchestrates the UDP transport, prober,
//! gossiper, and anti-entropy loop as a set of `CancellationToken`-joined
//! tokio tasks.

use crate::anti_entropy::AntiEntropy;
use crate::codec::{self, MessageType};
use crate::config::{Config, NODE_META_LIMIT};
use crate::delegate::{ConflictDelegate, Delegate, EventDelegate, MergeDelegate};
use crate::error::{Error, Result};
use crate::failure_detector::{Outbound, Prober};
use crate::gossip::Gossiper;
use crate::keyring::Keyring;
use crate::membership::Membership;
use crate::node::{Node, NodeName, VersionVector};
use crate::transport::{bind_tcp, resolve_addr, UdpTransport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The running instance. Construct with `Core::create`, then `join` against
/// a seed list, and `shutdown`/`leave` when done.
pub struct Core {
    config: Config,
    membership: Arc<Membership>,
    keyring: Arc<Keyring>,
    delegate: Arc<dyn Delegate>,
    anti_entropy: Arc<AntiEntropy>,
    send_tx: mpsc::Sender<Outbound>,
    shutdown_token: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Creates a standalone instance seeded with only the local node. Binds
    /// the UDP and TCP sockets and spawns the prober, gossiper, and
    /// anti-entropy background tasks immediately.
    pub async fn create(
        config: Config,
        delegate: Arc<dyn Delegate>,
        merge_delegate: Arc<dyn MergeDelegate>,
        conflict_delegate: Arc<dyn ConflictDelegate>,
        event_delegate: Arc<dyn EventDelegate>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        // A `bind_port` of 0 asks the OS for an ephemeral port (tests,
        // co-located nodes on one host). Bind UDP first so the TCP
        // listener can be pinned to that same concrete port.
        let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);
        let udp = UdpTransport::bind(bind_addr)?;
        let bound_port = udp.local_addr()?.port();
        let tcp_listener = bind_tcp(SocketAddr::new(config.bind_addr, bound_port))?;

        let keyring = Arc::new(match &config.secret_key {
            Some(encoded) => {
                let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
                    .map_err(|e| Error::InvalidConfig(format!("secret_key: {e}")))?;
                let key: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| Error::InvalidConfig("secret_key must be 16 bytes".into()))?;
                Keyring::new(Some(key))
            }
            None => Keyring::new(None),
        });

        let mut meta = delegate.node_meta(NODE_META_LIMIT);
        meta.truncate(NODE_META_LIMIT);

        let advertise_port = if config.advertise_port.is_none() && config.bind_port == 0 {
            bound_port
        } else {
            config.advertise_port()
        };
        let local_node = Node {
            name: config.name.clone(),
            addr: config.advertise_addr(),
            port: advertise_port,
            meta,
            vsn: VersionVector {
                protocol_min: crate::config::PROTOCOL_VERSION_MIN,
                protocol_max: crate::config::PROTOCOL_VERSION_MAX,
                protocol_cur: config.protocol_version,
                delegate_min: config.delegate_protocol_min,
                delegate_max: config.delegate_protocol_max,
                delegate_cur: config.delegate_protocol_current,
            },
        };

        let membership = Arc::new(Membership::new(
            config.name.clone(),
            event_delegate,
            Arc::clone(&conflict_delegate),
            config.suspicion_mult,
            config.retransmit_mult,
            config.probe_interval(),
            config.dead_node_reclaim(),
        ));
        membership.join_local(local_node);

        let shutdown_token = CancellationToken::new();
        let (send_tx, send_rx) = mpsc::channel::<Outbound>(1024);

        let prober = Arc::new(Prober::new(Arc::clone(&membership), send_tx.clone(), &config));
        let gossiper = Arc::new(Gossiper::new(
            Arc::clone(&membership),
            Arc::clone(&delegate),
            send_tx.clone(),
            &config,
        ));
        let anti_entropy = Arc::new(AntiEntropy::new(
            Arc::clone(&membership),
            Arc::clone(&keyring),
            merge_delegate,
            conflict_delegate,
            &config,
        ));

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(udp.run(
            Arc::clone(&membership),
            Arc::clone(&prober),
            Arc::clone(&keyring),
            Arc::clone(&delegate),
            send_tx.clone(),
            send_rx,
            shutdown_token.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&prober).run(shutdown_token.clone())));
        tasks.push(tokio::spawn(Arc::clone(&gossiper).run(shutdown_token.clone())));
        tasks.push(tokio::spawn(
            Arc::clone(&anti_entropy).run(shutdown_token.clone()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&anti_entropy).serve(tcp_listener, shutdown_token.clone()),
        ));

        info!(
            node = %config.name,
            addr = %bind_addr,
            key_fingerprint = ?keyring.primary_fingerprint(),
            "instance created"
        );

        Ok(Arc::new(Self {
            config,
            membership,
            keyring,
            delegate,
            anti_entropy,
            send_tx,
            shutdown_token,
            tasks: std::sync::Mutex::new(tasks),
        }))
    }

    /// Contacts every seed in turn via TCP push/pull, merging whatever
    /// member lists they return. Succeeds as long as at least one seed
    /// responds; `JoinFailed` otherwise.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut successes = 0usize;
        let mut last_error = None;
        for seed in seeds {
            let addr = match resolve_addr(seed, self.config.bind_port) {
                Ok(addr) => addr,
                Err(e) => {
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            match self.anti_entropy.push_pull(addr, true).await {
                Ok(()) => successes += 1,
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        if successes == 0 {
            return Err(Error::JoinFailed(
                last_error.unwrap_or_else(|| "no seeds configured".into()),
            ));
        }
        Ok(successes)
    }

    /// All non-dead members, including the local node.
    pub fn members(&self) -> Vec<Node> {
        self.membership.members()
    }

    pub fn num_members(&self) -> usize {
        self.membership.num_members()
    }

    pub fn local_name(&self) -> &NodeName {
        self.membership.local_name()
    }

    pub fn protocol_version(&self) -> u8 {
        self.config.protocol_version
    }

    /// Sends a user message directly to `dest`, bypassing gossip.
    pub async fn send_to(&self, dest: SocketAddr, data: Vec<u8>) -> Result<()> {
        let mut buf = vec![MessageType::User as u8];
        buf.extend_from_slice(&data);
        let buf = codec::wrap_encrypt(&self.keyring, &buf)?;
        self.send_tx
            .send(Outbound { addr: dest, payload: buf })
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Refreshes the local node's metadata and re-broadcasts an `alive`
    /// record with a bumped incarnation. This is a voluntary local change,
    /// not a rumor about the local node arriving from elsewhere, so it
    /// writes the member-list entry directly rather than going through
    /// `handle_alive`'s external-refutation path.
    pub fn update_node(self: &Arc<Self>) -> Result<()> {
        let mut meta = self.delegate.node_meta(NODE_META_LIMIT);
        meta.truncate(NODE_META_LIMIT);
        self.membership.update_local_meta(meta);
        Ok(())
    }

    /// Voluntarily leaves the cluster: broadcasts a `dead` record about the
    /// local node and waits up to `timeout` for it to propagate before
    /// returning.
    pub async fn leave(self: &Arc<Self>, timeout: Duration) -> Result<()> {
        self.membership.leave();
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.membership.broadcast_queue_is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }

    /// Cancels every background task and waits for them to finish.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_token.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
        info!("instance shut down");
        Ok(())
    }
}
