//! src/transport/resolve.rs
//!
//! Resolves the address strings an embedder supplies for seeds/bootstrap
//! peers: a bare hostname or IP (default port applies), a `host:port` pair,
//! or a bracketed IPv6 literal (`[::1]:7946`).

use crate::error::{Error, Result};
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolves `input` to a `SocketAddr`, applying `default_port` when `input`
/// carries no port of its own.
pub fn resolve_addr(input: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // Bracketed IPv6 with a port, e.g. "[::1]:7946", is handled by the
    // `SocketAddr` parse above; a bracketed literal with no port needs its
    // brackets stripped before falling through to bare-host resolution.
    let bare = input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(input);

    if let Ok(ip) = bare.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // host:port or bare hostname, resolved via the system resolver.
    let candidate = if input.contains(':') && !input.starts_with('[') {
        input.to_string()
    } else {
        format!("{bare}:{default_port}")
    };

    candidate
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(input.to_string(), e.to_string()))?
        .next()
        .ok_or_else(|| Error::Resolve(input.to_string(), "no addresses returned".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bare_ip_with_default_port() {
        let addr = resolve_addr("127.0.0.1", 7946).unwrap();
        assert_eq!(addr.port(), 7946);
    }

    #[test]
    fn resolves_ip_with_explicit_port() {
        let addr = resolve_addr("127.0.0.1:8000", 7946).unwrap();
        assert_eq!(addr.port(), 8000);
    }

    #[test]
    fn resolves_bracketed_ipv6_with_port() {
        let addr = resolve_addr("[::1]:8000", 7946).unwrap();
        assert_eq!(addr.port(), 8000);
        assert!(addr.is_ipv6());
    }

    #[test]
    fn resolves_bare_bracketed_ipv6_with_default_port() {
        let addr = resolve_addr("[::1]", 7946).unwrap();
        assert_eq!(addr.port(), 7946);
    }

    #[test]
    fn resolves_localhost_hostname() {
        let addr = resolve_addr("localhost", 7946).unwrap();
        assert_eq!(addr.port(), 7946);
    }
}
