//! src/keyring.rs
//!
//! Symmetric keyring for the `encrypt` wire envelope. Holds an
//! ordered list of AES-128-GCM keys with one designated primary: the primary
//! encrypts outgoing traffic, and incoming traffic is tried against every
//! key in the ring so that a key rotation can roll out cluster-wide without
//! a flag day.

use crate::error::{Error, Result};
use std::sync::RwLock;

/// Required key length for AES-128-GCM.
pub const KEY_SIZE: usize = 16;

/// An ordered set of symmetric keys with one primary. Interior-mutable so
/// it can be shared across the prober, gossiper, and transport without each
/// holding its own copy.
pub struct Keyring {
    inner: RwLock<KeyringInner>,
}

struct KeyringInner {
    keys: Vec<[u8; KEY_SIZE]>,
}

impl Keyring {
    /// Builds a keyring from an optional primary key. An empty keyring
    /// disables encryption entirely: the codec sends/accepts plaintext.
    pub fn new(primary: Option<[u8; KEY_SIZE]>) -> Self {
        let keys = primary.into_iter().collect();
        Self {
            inner: RwLock::new(KeyringInner { keys }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().keys.is_empty()
    }

    /// The key new outgoing messages are encrypted with: index 0.
    pub fn primary_key(&self) -> Option<[u8; KEY_SIZE]> {
        self.inner.read().unwrap().keys.first().copied()
    }

    /// All keys, primary first, for trying an incoming ciphertext against
    /// each in turn.
    pub fn keys(&self) -> Vec<[u8; KEY_SIZE]> {
        self.inner.read().unwrap().keys.clone()
    }

    /// Installs a new key at the back of the ring (not primary) unless it's
    /// already present, in which case this is a no-op.
    pub fn add_key(&self, key: [u8; KEY_SIZE]) {
        let mut inner = self.inner.write().unwrap();
        if !inner.keys.contains(&key) {
            inner.keys.push(key);
        }
    }

    /// Removes a key from the ring. Refuses to remove the current primary,
    /// since that would silently stop outgoing encryption.
    pub fn remove_key(&self, key: &[u8; KEY_SIZE]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.keys.first() == Some(key) {
            return Err(Error::Keyring(
                "cannot remove the current primary key".into(),
            ));
        }
        inner.keys.retain(|k| k != key);
        Ok(())
    }

    /// Promotes an existing key to primary. The key must already be in the
    /// ring.
    pub fn use_key(&self, key: &[u8; KEY_SIZE]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let pos = inner
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or_else(|| Error::Keyring("UseKey: key is not in the ring".into()))?;
        inner.keys.swap(0, pos);
        Ok(())
    }

    /// A short hex fingerprint for logging, never the key itself.
    pub fn primary_fingerprint(&self) -> Option<String> {
        self.primary_key().map(|k| hex::encode(&k[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> [u8; KEY_SIZE] {
        [b; KEY_SIZE]
    }

    #[test]
    fn empty_keyring_disables_encryption() {
        let ring = Keyring::new(None);
        assert!(ring.is_empty());
        assert_eq!(ring.primary_key(), None);
    }

    #[test]
    fn add_key_appends_without_changing_primary() {
        let ring = Keyring::new(Some(key(1)));
        ring.add_key(key(2));
        assert_eq!(ring.primary_key(), Some(key(1)));
        assert_eq!(ring.keys(), vec![key(1), key(2)]);
    }

    #[test]
    fn add_key_is_idempotent() {
        let ring = Keyring::new(Some(key(1)));
        ring.add_key(key(1));
        assert_eq!(ring.keys(), vec![key(1)]);
    }

    #[test]
    fn remove_key_refuses_primary() {
        let ring = Keyring::new(Some(key(1)));
        ring.add_key(key(2));
        assert!(ring.remove_key(&key(1)).is_err());
        assert_eq!(ring.keys(), vec![key(1), key(2)]);
    }

    #[test]
    fn remove_key_allows_non_primary() {
        let ring = Keyring::new(Some(key(1)));
        ring.add_key(key(2));
        ring.remove_key(&key(2)).unwrap();
        assert_eq!(ring.keys(), vec![key(1)]);
    }

    #[test]
    fn use_key_promotes_existing_key() {
        let ring = Keyring::new(Some(key(1)));
        ring.add_key(key(2));
        ring.use_key(&key(2)).unwrap();
        assert_eq!(ring.primary_key(), Some(key(2)));
        assert_eq!(ring.keys(), vec![key(2), key(1)]);
    }

    #[test]
    fn use_key_rejects_unknown_key() {
        let ring = Keyring::new(Some(key(1)));
        assert!(ring.use_key(&key(9)).is_err());
    }
}
