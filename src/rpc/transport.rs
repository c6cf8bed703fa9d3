//! The seam between the DHT and whatever moves bytes between peers.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::common::{Connectedness, Multiaddr, PeerId};
use crate::Peerstore;

use super::Context;

/// Protocol id of DHT messages.
pub const PROTOCOL_ID: &str = "/ipfs/dht/1.0.0";

/// Answers inbound payloads of a protocol.
pub trait Handler: Debug + Send + Sync {
    /// Handle one inbound payload from `from`.
    ///
    /// Returns the reply payload, or `None` to stay silent.
    ///
    /// This is called from the transport's receiving loop, thus it needs to be
    /// fast and must not block on outbound requests.
    fn handle(&self, from: &PeerId, payload: &[u8]) -> Option<Bytes>;
}

/// Request/response messaging with other peers.
///
/// Every outbound call takes a [Context] and must return once the context is
/// cancelled or its deadline passes.
pub trait Transport: Debug + Send + Sync {
    /// Identity of this node.
    fn local_peer(&self) -> &PeerId;

    /// Addresses this node can be reached at.
    fn listen_addresses(&self) -> Vec<Multiaddr>;

    /// The [Peerstore] used to resolve peer addresses.
    fn peerstore(&self) -> &Arc<Peerstore>;

    fn dial_peer(&self, peer: &PeerId) -> Result<(), TransportError>;

    fn close_peer(&self, peer: &PeerId);

    fn connectedness(&self, peer: &PeerId) -> Connectedness;

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connectedness(peer) == Connectedness::Connected
    }

    /// Register the [Handler] of inbound payloads for `protocol`, replacing any previous one.
    fn set_handler(&self, protocol: &str, handler: Arc<dyn Handler>);

    fn remove_handler(&self, protocol: &str);

    /// Send `payload` to `peer` and wait for the correlated reply.
    fn request(
        &self,
        ctx: &Context,
        peer: &PeerId,
        protocol: &str,
        payload: Bytes,
    ) -> Result<Bytes, TransportError>;

    /// Send `payload` to `peer` without waiting for a reply.
    fn send(
        &self,
        ctx: &Context,
        peer: &PeerId,
        protocol: &str,
        payload: Bytes,
    ) -> Result<(), TransportError>;
}

#[derive(thiserror::Error, Debug)]
/// Errors of a single exchange with a peer.
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("No usable address for peer {0}")]
    NoAddress(PeerId),

    #[error("Peer doesn't handle protocol {0}")]
    NoHandler(String),

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    /// The transport was shut down.
    #[error("Transport is closed")]
    Closed,

    /// Errors related to encoding transport envelopes.
    #[error("Failed to encode or decode packet: {0}")]
    Encoding(#[from] serde_bencode::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

impl TransportError {
    /// Returns `true` if the exchange was cut short by its [Context], rather
    /// than failing on its own.
    pub fn is_cut_off(&self) -> bool {
        matches!(
            self,
            TransportError::Cancelled | TransportError::DeadlineExceeded
        )
    }
}
