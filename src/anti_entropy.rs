//! src/anti_entropy.rs
//!
//! TCP push/pull anti-entropy. Every `push_pull_interval`, the local node
//! opens a TCP connection to a random peer, exchanges full member-list
//! snapshots, and merges the result — catching any state the UDP gossip
//! layer dropped or never reached. Also used synchronously during `Join`
//! against each seed.
//!
//! The exchange is a single length-prefixed frame in each direction, passed
//! through the same keyring `encrypt` envelope as UDP traffic — two nodes
//! with different keys can open a TCP connection just fine, but neither
//! will ever produce bytes the other can decrypt, so the exchange fails
//! harmlessly rather than leaking state. The header also carries the
//! sender's version vector, so a pairwise-incompatible peer is rejected
//! before any member-list state is merged.

use crate::codec::{self, PushNodeState, PushPullHeader};
use crate::config::Config;
use crate::delegate::{ConflictDelegate, MergeDelegate};
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::membership::Membership;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 10 MiB cap on a push/pull payload: a malicious or buggy peer cannot
/// force an unbounded allocation.
pub const MAX_PUSH_PULL_BYTES: usize = 10 * 1024 * 1024;

pub struct AntiEntropy {
    membership: Arc<Membership>,
    keyring: Arc<Keyring>,
    merge_delegate: Arc<dyn MergeDelegate>,
    conflict_delegate: Arc<dyn ConflictDelegate>,
    interval: Duration,
    tcp_timeout: Duration,
}

impl AntiEntropy {
    pub fn new(
        membership: Arc<Membership>,
        keyring: Arc<Keyring>,
        merge_delegate: Arc<dyn MergeDelegate>,
        conflict_delegate: Arc<dyn ConflictDelegate>,
        config: &Config,
    ) -> Self {
        Self {
            membership,
            keyring,
            merge_delegate,
            conflict_delegate,
            interval: config.push_pull_interval(),
            tcp_timeout: config.tcp_timeout(),
        }
    }

    /// Periodically initiates a push/pull exchange against a random peer.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("anti-entropy loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    let mut candidates = self.membership.probe_candidates();
                    candidates.shuffle(&mut rand::thread_rng());
                    if let Some(target) = candidates.into_iter().next() {
                        if let Some((addr, port)) = self.membership.node_addr(&target) {
                            let dest = SocketAddr::new(addr, port);
                            if let Err(e) = self.push_pull(dest, false).await {
                                warn!(peer = %dest, error = %e, "push/pull exchange failed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Serves the responder side of the TCP push/pull protocol for every
    /// inbound connection accepted by the transport's TCP listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("anti-entropy TCP listener shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else { continue };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_inbound(stream).await {
                            warn!(%peer, error = %e, "push/pull responder failed");
                        }
                    });
                }
            }
        }
    }

    /// Initiates a push/pull exchange as the client. `join` marks this as
    /// part of a `Join` call so the responder knows to apply a veto check.
    pub async fn push_pull(&self, dest: SocketAddr, join: bool) -> Result<()> {
        let mut stream = tokio::time::timeout(self.tcp_timeout, TcpStream::connect(dest))
            .await
            .map_err(|_| Error::Timeout(dest))??;

        self.send_snapshot(&mut stream, join).await?;
        let (remote_vsn, remote_nodes, remote_user_state) = self.recv_snapshot(&mut stream).await?;
        self.check_version(&remote_vsn)?;

        if let Some(reason) = self.conflict_delegate.notify_merge(
            &remote_nodes
                .iter()
                .map(|s| crate::node::Node {
                    name: s.name.clone(),
                    addr: s.addr,
                    port: s.port,
                    meta: s.meta.clone(),
                    vsn: s.vsn,
                })
                .collect::<Vec<_>>(),
        ) {
            warn!(reason, "peer merge vetoed");
            return Err(Error::MergeCanceled);
        }

        self.membership.merge_remote_state(remote_nodes);
        self.merge_delegate.merge_remote_state(&remote_user_state, join);
        Ok(())
    }

    async fn handle_inbound(&self, mut stream: TcpStream) -> Result<()> {
        let (remote_vsn, remote_nodes, remote_user_state) = self.recv_snapshot(&mut stream).await?;
        self.check_version(&remote_vsn)?;
        self.membership.merge_remote_state(remote_nodes);
        self.merge_delegate.merge_remote_state(&remote_user_state, false);
        self.send_snapshot(&mut stream, false).await?;
        Ok(())
    }

    /// Rejects the exchange if the peer's version vector is pairwise
    /// incompatible with ours, before any state is merged.
    fn check_version(&self, remote: &crate::node::VersionVector) -> Result<()> {
        let local = self.membership.local_vsn();
        if local.compatible_with(remote) {
            Ok(())
        } else {
            Err(Error::VersionMismatch(format!(
                "local vsn {local:?} incompatible with remote vsn {remote:?}"
            )))
        }
    }

    async fn send_snapshot(&self, stream: &mut TcpStream, join: bool) -> Result<()> {
        let nodes = self.membership.snapshot();
        let user_state = self.merge_delegate.local_state(join);

        let header = PushPullHeader {
            nodes: nodes.len(),
            user_state_len: user_state.len(),
            join,
            vsn: self.membership.local_vsn(),
        };
        let header_bytes = rmp_serde::to_vec_named(&header)?;

        let mut frame = Vec::new();
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        for node in &nodes {
            let encoded = rmp_serde::to_vec_named(node)?;
            frame.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            frame.extend_from_slice(&encoded);
        }
        frame.extend_from_slice(&user_state);

        let frame = codec::wrap_encrypt(&self.keyring, &frame)?;
        if frame.len() > MAX_PUSH_PULL_BYTES {
            return Err(Error::SizeLimitExceeded(frame.len(), MAX_PUSH_PULL_BYTES));
        }

        stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv_snapshot(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(crate::node::VersionVector, Vec<PushNodeState>, Vec<u8>)> {
        let frame_len = read_u32(stream).await? as usize;
        if frame_len > MAX_PUSH_PULL_BYTES {
            return Err(Error::SizeLimitExceeded(frame_len, MAX_PUSH_PULL_BYTES));
        }
        let mut frame = vec![0u8; frame_len];
        stream.read_exact(&mut frame).await?;

        // `wrap_encrypt` returns plaintext unchanged when the keyring is
        // empty, and `unwrap_encrypt` needs the one-byte envelope tag this
        // frame was sent without — both sides only ever wrap with a
        // non-empty keyring together, so peek at whether this looks like
        // an `encrypt` envelope before trying to decrypt it.
        let plain = if self.keyring.is_empty() {
            frame
        } else {
            unwrap_encrypted_frame(&self.keyring, &frame)?
        };

        let mut rest = &plain[..];
        if rest.len() < 4 {
            return Err(Error::Codec("truncated push/pull header length".into()));
        }
        let (len_bytes, tail) = rest.split_at(4);
        let header_len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        if tail.len() < header_len {
            return Err(Error::Codec("truncated push/pull header".into()));
        }
        let (header_bytes, tail) = tail.split_at(header_len);
        let header: PushPullHeader = rmp_serde::from_slice(header_bytes)?;
        rest = tail;

        let mut nodes = Vec::with_capacity(header.nodes);
        for _ in 0..header.nodes {
            if rest.len() < 4 {
                return Err(Error::Codec("truncated push/pull node entry".into()));
            }
            let (len_bytes, tail) = rest.split_at(4);
            let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
            if tail.len() < len {
                return Err(Error::Codec("truncated push/pull node body".into()));
            }
            let (entry, tail) = tail.split_at(len);
            nodes.push(rmp_serde::from_slice(entry)?);
            rest = tail;
        }

        if rest.len() != header.user_state_len {
            return Err(Error::Codec(
                "push/pull user state length mismatch".into(),
            ));
        }
        Ok((header.vsn, nodes, rest.to_vec()))
    }
}

/// `codec::unwrap_encrypt` expects the bytes *after* the envelope's own
/// type tag; a push/pull frame carries that tag as its first byte just
/// like a UDP `encrypt` envelope would.
fn unwrap_encrypted_frame(keyring: &Keyring, frame: &[u8]) -> Result<Vec<u8>> {
    if codec::peek_type(frame)? != codec::MessageType::Encrypt {
        return Err(Error::Codec(
            "expected an encrypted push/pull frame but got plaintext".into(),
        ));
    }
    codec::unwrap_encrypt(keyring, &frame[1..])
}

async fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}
