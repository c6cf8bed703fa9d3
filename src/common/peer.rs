//! Peer identities, lookup keys and connectivity states.
use std::fmt::{self, Debug, Display, Formatter};

use bytes::Bytes;
use rand::RngCore;

use crate::common::Id;

/// Opaque identity of a node in the overlay.
///
/// Used as the key of the [crate::Peerstore] and, hashed with [Id::hash],
/// as the node's coordinate in the XOR metric space.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Bytes);

impl PeerId {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        PeerId(bytes.into())
    }

    /// A random 32 bytes identity.
    pub fn random() -> Self {
        let mut bytes = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        PeerId(Bytes::copy_from_slice(&bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Coordinate of this peer in the XOR metric space.
    pub fn id(&self) -> Id {
        Id::hash(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for PeerId {
    fn from(bytes: Vec<u8>) -> Self {
        PeerId(bytes.into())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => write!(f, "{}", s),
            _ => {
                for byte in self.0.iter() {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Opaque lookup key.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Key(Bytes);

impl Key {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Key(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Coordinate of this key in the XOR metric space.
    pub fn id(&self) -> Id {
        Id::hash(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key(bytes.into())
    }
}

impl From<&PeerId> for Key {
    fn from(peer: &PeerId) -> Self {
        Key(peer.0.clone())
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Connectivity of a peer relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectedness {
    /// No connection, but none was tried either.
    #[default]
    NotConnected,
    /// A connection is open.
    Connected,
    /// Recently connected or known to be dialable.
    CanConnect,
    /// Recently failed to connect.
    CannotConnect,
}
