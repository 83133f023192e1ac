//! src/transport/tcp.rs
//!
//! The TCP listener backing push/pull anti-entropy. Binding is the only
//! transport concern here; the protocol itself lives in `anti_entropy.rs`.

use crate::error::Result;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
