//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.
//!
//! Per the error taxonomy in the design: the state machine and wire codec
//! never surface these to a caller (malformed or hostile input is logged and
//! dropped, not propagated). `Error` is reserved for conditions a caller of
//! the public surface (`Core::create`, `Core::join`, `Core::leave`, ...) can
//! actually act on.

use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("malformed wire message: {0}")]
    Codec(String),

    #[error("cryptography error: {0}")]
    Crypto(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("could not resolve address {0}: {1}")]
    Resolve(String, String),

    #[error("push/pull payload of {0} bytes exceeds the {1} byte safety limit")]
    SizeLimitExceeded(usize, usize),

    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),

    #[error("remote peer vetoed the merge")]
    MergeCanceled,

    #[error("failed to contact any seed: {0}")]
    JoinFailed(String),

    #[error("timed out waiting for {0} to respond")]
    Timeout(SocketAddr),

    #[error("leave timed out before the broadcast was fully propagated")]
    LeaveTimeout,

    #[error("tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("the instance is shutting down")]
    ShuttingDown,
}
