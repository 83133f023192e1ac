//! src/transport/udp.rs
//!
//! The UDP socket: one task drains `send_rx` and writes datagrams out, the
//! other reads inbound datagrams, resolves their envelope (decrypt →
//! decompress → un-compound), and dispatches each leaf message to the
//! membership state machine or the prober.

use crate::codec::{self, MessageType};
use crate::delegate::Delegate;
use crate::error::Result;
use crate::failure_detector::{Outbound, Prober};
use crate::keyring::Keyring;
use crate::membership::Membership;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Largest datagram this transport will ever read; anything bigger is
/// truncated by the kernel first, so this is just a generously-sized
/// buffer, not a protocol limit.
const RECV_BUFFER_SIZE: usize = 65536;

/// If nothing has been received for this long, log a single stall warning:
/// on most platforms a dead socket reads as silence, not an error, so a
/// read loop gone quiet for an unusually long time should say so.
const STALL_WARNING_AFTER: Duration = Duration::from_secs(30);

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(SockProtocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Runs both the send and receive halves until `shutdown` fires.
    /// `send_rx` carries outbound datagrams from the prober/gossiper;
    /// replies generated here (acks, relayed indirect acks) are sent back
    /// out over the same socket via a cloned `send_tx`.
    pub async fn run(
        self,
        membership: Arc<Membership>,
        prober: Arc<Prober>,
        keyring: Arc<Keyring>,
        delegate: Arc<dyn Delegate>,
        send_tx: mpsc::Sender<Outbound>,
        mut send_rx: mpsc::Receiver<Outbound>,
        shutdown: CancellationToken,
    ) {
        let send_socket = Arc::clone(&self.socket);
        let send_shutdown = shutdown.clone();
        let sender = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = send_shutdown.cancelled() => return,
                    Some(out) = send_rx.recv() => {
                        if let Err(e) = send_socket.send_to(&out.payload, out.addr).await {
                            warn!(peer = %out.addr, error = %e, "UDP send failed");
                        }
                    }
                }
            }
        });

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut last_recv = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("UDP receive loop shutting down");
                    break;
                }
                _ = tokio::time::sleep(STALL_WARNING_AFTER) => {
                    if last_recv.elapsed() >= STALL_WARNING_AFTER {
                        warn!(elapsed = ?last_recv.elapsed(), "UDP read loop has received nothing in a while");
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let Ok((len, src)) = received else { continue };
                    last_recv = tokio::time::Instant::now();
                    let datagram = buf[..len].to_vec();
                    let membership = Arc::clone(&membership);
                    let prober = Arc::clone(&prober);
                    let keyring = Arc::clone(&keyring);
                    let delegate = Arc::clone(&delegate);
                    let reply_tx = send_tx.clone();
                    tokio::spawn(async move {
                        dispatch(membership, prober, keyring, delegate, reply_tx, datagram, src).await;
                    });
                }
            }
        }
        sender.abort();
    }
}

async fn dispatch(
    membership: Arc<Membership>,
    prober: Arc<Prober>,
    keyring: Arc<Keyring>,
    delegate: Arc<dyn Delegate>,
    reply_tx: mpsc::Sender<Outbound>,
    datagram: Vec<u8>,
    src: SocketAddr,
) {
    let leaves = match codec::resolve_envelope(&keyring, &datagram) {
        Ok(leaves) => leaves,
        Err(e) => {
            trace!(%src, error = %e, "dropping malformed datagram");
            return;
        }
    };

    for leaf in leaves {
        if let Err(e) =
            dispatch_leaf(&membership, &prober, &delegate, &reply_tx, &leaf, src).await
        {
            trace!(%src, error = %e, "dropping malformed message");
        }
    }
}

async fn dispatch_leaf(
    membership: &Arc<Membership>,
    prober: &Arc<Prober>,
    delegate: &Arc<dyn Delegate>,
    reply_tx: &mpsc::Sender<Outbound>,
    leaf: &[u8],
    src: SocketAddr,
) -> Result<()> {
    let kind = codec::peek_type(leaf)?;
    let body = &leaf[1..];
    match kind {
        MessageType::Ping => {
            let ping: codec::Ping = codec::decode_body(body)?;
            let ack = codec::Ack {
                seq_no: ping.seq_no,
                payload: Vec::new(),
            };
            let encoded = codec::encode_message(MessageType::Ack, &ack)?;
            let encoded = membership.piggyback(encoded);
            let _ = reply_tx
                .send(Outbound {
                    addr: src,
                    payload: encoded,
                })
                .await;
        }
        MessageType::IndirectPing => {
            let req: codec::IndirectPing = codec::decode_body(body)?;
            let target = SocketAddr::new(req.target_addr, req.target_port);
            let prober = Arc::clone(prober);
            let reply_tx = reply_tx.clone();
            let requester = src;
            let original_seq = req.seq_no;
            tokio::spawn(async move {
                if prober.relay_probe(target).await {
                    let ack = codec::Ack {
                        seq_no: original_seq,
                        payload: Vec::new(),
                    };
                    if let Ok(encoded) = codec::encode_message(MessageType::Ack, &ack) {
                        let _ = reply_tx
                            .send(Outbound {
                                addr: requester,
                                payload: encoded,
                            })
                            .await;
                    }
                }
            });
        }
        MessageType::Ack => {
            let ack: codec::Ack = codec::decode_body(body)?;
            prober.deliver_ack(ack.seq_no, ack.payload);
        }
        MessageType::Nack => {
            let _nack: codec::Nack = codec::decode_body(body)?;
        }
        MessageType::Alive => {
            let alive: codec::Alive = codec::decode_body(body)?;
            let node = crate::node::Node {
                name: alive.node,
                addr: alive.addr,
                port: alive.port,
                meta: alive.meta,
                vsn: alive.vsn,
            };
            membership.handle_alive(node, alive.incarnation);
        }
        MessageType::Suspect => {
            let suspect: codec::Suspect = codec::decode_body(body)?;
            membership.handle_suspect(suspect.node, suspect.incarnation);
        }
        MessageType::Dead => {
            let dead: codec::Dead = codec::decode_body(body)?;
            membership.handle_dead(dead.node, dead.incarnation);
        }
        MessageType::User => {
            delegate.notify_msg(body);
        }
        MessageType::PushPull
        | MessageType::Compound
        | MessageType::Compress
        | MessageType::Encrypt => {
            // Envelopes are fully resolved before reaching this dispatcher
            // (`resolve_envelope`); `PushPull` only ever travels over TCP.
        }
    }
    Ok(())
}
