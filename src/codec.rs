//! src/codec.rs
//!
//! The wire format: every message starts with a one-byte type tag.
//! `compound`, `compress`, and `encrypt` are recursive envelopes whose
//! payload is itself a tagged message (or another envelope); every other
//! tag is a leaf record encoded with `rmp-serde`'s self-describing,
//! field-tagged MessagePack encoding.
//!
//! Malformed input is never propagated as an `Error` past this module's
//! boundary in the places that matter for liveness: callers on the hot path
//! log a decode failure and drop the packet rather than unwrap these
//! `Result`s.

use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::node::{NodeName, VersionVector};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One-byte tag identifying the record (or envelope) that follows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    Ack = 2,
    Nack = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    PushPull = 7,
    User = 8,
    Compound = 9,
    Compress = 10,
    Encrypt = 11,
}

impl MessageType {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            0 => Self::Ping,
            1 => Self::IndirectPing,
            2 => Self::Ack,
            3 => Self::Nack,
            4 => Self::Suspect,
            5 => Self::Alive,
            6 => Self::Dead,
            7 => Self::PushPull,
            8 => Self::User,
            9 => Self::Compound,
            10 => Self::Compress,
            11 => Self::Encrypt,
            other => return Err(Error::Codec(format!("unknown message type tag {other}"))),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
    pub node: NodeName,
    pub source_addr: IpAddr,
    pub source_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndirectPing {
    pub seq_no: u32,
    pub target: NodeName,
    pub target_addr: IpAddr,
    pub target_port: u16,
    pub node: NodeName,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ack {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Nack {
    pub seq_no: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: NodeName,
    pub from: NodeName,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: NodeName,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: VersionVector,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: NodeName,
    pub from: NodeName,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushNodeState {
    pub name: NodeName,
    pub addr: IpAddr,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: u8,
    pub vsn: VersionVector,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PushPullHeader {
    pub nodes: usize,
    pub user_state_len: usize,
    pub join: bool,
    pub vsn: VersionVector,
}

/// Encodes a leaf record: one type-tag byte followed by its MessagePack
/// encoding.
pub fn encode_message<T: Serialize>(kind: MessageType, record: &T) -> Result<Vec<u8>> {
    let mut buf = vec![kind as u8];
    rmp_serde::encode::write_named(&mut buf, record)?;
    Ok(buf)
}

/// Peels the type tag off a leaf or envelope message without decoding the
/// body, for dispatch.
pub fn peek_type(buf: &[u8]) -> Result<MessageType> {
    let byte = *buf
        .first()
        .ok_or_else(|| Error::Codec("empty message".into()))?;
    MessageType::from_u8(byte)
}

/// Decodes a leaf record's body (the bytes after the type tag).
pub fn decode_body<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(body)?)
}

/// Wraps multiple already-encoded messages into a single `compound`
/// envelope: a count byte, then each sub-message length-prefixed with a
/// u32 big-endian length.
pub fn wrap_compound(messages: &[Vec<u8>]) -> Result<Vec<u8>> {
    if messages.len() > u8::MAX as usize {
        return Err(Error::Codec(format!(
            "compound message has {} sub-messages, max is {}",
            messages.len(),
            u8::MAX
        )));
    }
    let mut buf = vec![MessageType::Compound as u8, messages.len() as u8];
    for msg in messages {
        buf.extend_from_slice(&(msg.len() as u32).to_be_bytes());
        buf.extend_from_slice(msg);
    }
    Ok(buf)
}

/// Unwraps a `compound` envelope's body into its individual sub-messages.
/// `body` is everything after the `Compound` type tag.
pub fn unwrap_compound(body: &[u8]) -> Result<Vec<Vec<u8>>> {
    let &count = body
        .first()
        .ok_or_else(|| Error::Codec("truncated compound header".into()))?;
    let mut rest = &body[1..];
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < 4 {
            return Err(Error::Codec("truncated compound length prefix".into()));
        }
        let (len_bytes, tail) = rest.split_at(4);
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
        if tail.len() < len {
            return Err(Error::Codec("truncated compound sub-message".into()));
        }
        let (msg, tail) = tail.split_at(len);
        out.push(msg.to_vec());
        rest = tail;
    }
    Ok(out)
}

/// Algorithm byte for the `compress` envelope. 0 = LZW.
const COMPRESS_ALGO_LZW: u8 = 0;

/// Wraps an already-encoded message in a `compress` envelope.
pub fn wrap_compress(inner: &[u8]) -> Vec<u8> {
    let compressed = weezl::encode::Encoder::new(weezl::BitOrder::Msb, 8).encode(inner).unwrap_or_else(|_| inner.to_vec());
    let mut buf = vec![MessageType::Compress as u8, COMPRESS_ALGO_LZW];
    buf.extend_from_slice(&compressed);
    buf
}

/// Unwraps a `compress` envelope's body (everything after the type tag,
/// i.e. algorithm byte + payload) back into the inner message bytes.
pub fn unwrap_compress(body: &[u8]) -> Result<Vec<u8>> {
    let &algo = body
        .first()
        .ok_or_else(|| Error::Codec("truncated compress header".into()))?;
    if algo != COMPRESS_ALGO_LZW {
        return Err(Error::Codec(format!("unsupported compress algorithm {algo}")));
    }
    weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8)
        .decode(&body[1..])
        .map_err(|e| Error::Codec(format!("LZW decompress failed: {e}")))
}

/// Current supported encrypt envelope version: AEAD over the whole payload
/// with the 5-byte envelope prefix (tag + version + 4-byte length) as
/// additional authenticated data, binding the ciphertext to its own framing.
const ENCRYPT_VERSION_AAD: u8 = 1;
/// Legacy version kept for backward compatibility: same AES-128-GCM
/// construction, but without AAD.
const ENCRYPT_VERSION_LEGACY: u8 = 0;

/// Encrypts `inner` with the keyring's primary key, producing an `encrypt`
/// envelope. Returns the plaintext bytes unchanged if the keyring is empty
/// (encryption disabled).
pub fn wrap_encrypt(keyring: &Keyring, inner: &[u8]) -> Result<Vec<u8>> {
    let Some(key) = keyring.primary_key() else {
        return Ok(inner.to_vec());
    };
    let cipher = Aes128Gcm::new_from_slice(&key)
        .map_err(|e| Error::Crypto(format!("invalid key length: {e}")))?;
    let nonce_bytes = rand_nonce();
    let version = ENCRYPT_VERSION_AAD;

    let prefix_len = (inner.len() as u32).to_be_bytes();
    let mut prefix = [0u8; 5];
    prefix[0] = MessageType::Encrypt as u8;
    prefix[1] = version;
    prefix[2..].copy_from_slice(&prefix_len);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: inner,
                aad: &prefix,
            },
        )
        .map_err(|e| Error::Crypto(format!("encrypt failed: {e}")))?;

    let mut buf = Vec::with_capacity(5 + 12 + ciphertext.len());
    buf.push(MessageType::Encrypt as u8);
    buf.push(version);
    buf.extend_from_slice(&prefix_len);
    buf.extend_from_slice(&nonce_bytes);
    buf.extend_from_slice(&ciphertext);
    Ok(buf)
}

/// Decrypts an `encrypt` envelope's body (everything after the type tag),
/// trying every key in the ring in turn so a key rotation can roll out
/// without a flag day.
pub fn unwrap_encrypt(keyring: &Keyring, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 5 {
        return Err(Error::Codec("truncated encrypt header".into()));
    }
    let version = body[0];
    let plaintext_len = u32::from_be_bytes(body[1..5].try_into().unwrap());
    let rest = &body[5..];
    if rest.len() < 12 {
        return Err(Error::Codec("truncated encrypt nonce".into()));
    }
    let (nonce_bytes, ciphertext) = rest.split_at(12);

    let aad: Vec<u8> = match version {
        ENCRYPT_VERSION_AAD => {
            let mut prefix = vec![MessageType::Encrypt as u8, version];
            prefix.extend_from_slice(&body[1..5]);
            prefix
        }
        ENCRYPT_VERSION_LEGACY => Vec::new(),
        other => return Err(Error::Codec(format!("unsupported encrypt version {other}"))),
    };

    for key in keyring.keys() {
        let Ok(cipher) = Aes128Gcm::new_from_slice(&key) else {
            continue;
        };
        if let Ok(plaintext) = cipher.decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        ) {
            if plaintext.len() as u32 != plaintext_len {
                return Err(Error::Codec("encrypt length prefix mismatch".into()));
            }
            return Ok(plaintext);
        }
    }
    Err(Error::Crypto("no keyring key could decrypt this message".into()))
}

fn rand_nonce() -> [u8; 12] {
    use rand::RngCore;
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Fully resolves an on-the-wire message — recursively unwrapping
/// `encrypt`, `compress`, and `compound` envelopes — into a flat list of
/// leaf messages (each still carrying its own type tag), ready for
/// dispatch to the state machine. The state machine never sees an
/// envelope, only resolved leaves.
pub fn resolve_envelope(keyring: &Keyring, buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let kind = peek_type(buf)?;
    let body = &buf[1..];
    match kind {
        MessageType::Encrypt => {
            let inner = unwrap_encrypt(keyring, body)?;
            resolve_envelope(keyring, &inner)
        }
        MessageType::Compress => {
            let inner = unwrap_compress(body)?;
            resolve_envelope(keyring, &inner)
        }
        MessageType::Compound => {
            let subs = unwrap_compound(body)?;
            let mut out = Vec::with_capacity(subs.len());
            for sub in subs {
                out.extend(resolve_envelope(keyring, &sub)?);
            }
            Ok(out)
        }
        _ => Ok(vec![buf.to_vec()]),
    }
}
