//! Serialize and deserialize DHT protocol messages.

mod internal;

use std::fmt::{self, Display, Formatter};

use bytes::Bytes;
use tracing::debug;

use crate::common::{parse_multiaddr, Connectedness, Key, Multiaddr, PeerId};
use crate::{Error, Peerstore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    PutValue,
    GetValue,
    AddProvider,
    GetProviders,
    FindNode,
    Ping,
}

impl MessageType {
    fn code(self) -> i32 {
        match self {
            MessageType::PutValue => 0,
            MessageType::GetValue => 1,
            MessageType::AddProvider => 2,
            MessageType::GetProviders => 3,
            MessageType::FindNode => 4,
            MessageType::Ping => 5,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => MessageType::PutValue,
            1 => MessageType::GetValue,
            2 => MessageType::AddProvider,
            3 => MessageType::GetProviders,
            4 => MessageType::FindNode,
            5 => MessageType::Ping,
            _ => return None,
        })
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MessageType::PutValue => "PUT_VALUE",
            MessageType::GetValue => "GET_VALUE",
            MessageType::AddProvider => "ADD_PROVIDER",
            MessageType::GetProviders => "GET_PROVIDERS",
            MessageType::FindNode => "FIND_NODE",
            MessageType::Ping => "PING",
        })
    }
}

fn connection_code(connectedness: Connectedness) -> i32 {
    match connectedness {
        Connectedness::NotConnected => 0,
        Connectedness::Connected => 1,
        Connectedness::CanConnect => 2,
        Connectedness::CannotConnect => 3,
    }
}

fn connectedness_from_code(code: i32) -> Connectedness {
    match code {
        1 => Connectedness::Connected,
        2 => Connectedness::CanConnect,
        3 => Connectedness::CannotConnect,
        _ => Connectedness::NotConnected,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Peer descriptor as carried in `closerPeers`.
pub struct WirePeer {
    pub id: PeerId,
    pub addrs: Vec<String>,
    /// Connectivity of this peer as seen by the sender of the message.
    pub connection: Connectedness,
}

impl WirePeer {
    /// Parse all addresses, failing on the first one that doesn't parse.
    pub fn addresses(&self) -> Result<Vec<Multiaddr>, Error> {
        self.addrs.iter().map(|address| parse_multiaddr(address)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub key: Key,
    /// The value, if the sender has one. Absence and empty bytes mean the same.
    pub value: Option<Bytes>,
    pub closer_peers: Vec<WirePeer>,
    cluster_level: Option<u32>,
}

impl Message {
    /// Construct a new message with given type, key, and cluster level.
    pub fn new(message_type: MessageType, key: Key, level: u32) -> Self {
        Message {
            message_type,
            key,
            value: None,
            closer_peers: Vec::new(),
            cluster_level: Some(level),
        }
    }

    /// Empty reply to this message: same type, key and cluster level.
    pub fn reply(&self) -> Self {
        Message {
            message_type: self.message_type,
            key: self.key.clone(),
            value: None,
            closer_peers: Vec::new(),
            cluster_level: self.cluster_level,
        }
    }

    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_closer_peers(mut self, closer_peers: Vec<WirePeer>) -> Self {
        self.closer_peers = closer_peers;
        self
    }

    // === Getters ===

    /// Returns the cluster level, 0 if it was never set.
    pub fn cluster_level(&self) -> u32 {
        self.cluster_level.unwrap_or(0)
    }

    pub fn set_cluster_level(&mut self, level: u32) {
        self.cluster_level = Some(level);
    }

    /// Returns the value if it is present and not empty.
    pub fn found_value(&self) -> Option<&Bytes> {
        self.value.as_ref().filter(|value| !value.is_empty())
    }

    // === Codec ===

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.to_serde_message()?.to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message, Error> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    fn to_serde_message(&self) -> Result<internal::DHTMessage, Error> {
        // The wire format can't tell a zero from an absent field, hence the bias.
        let cluster_level_raw = match self.cluster_level {
            Some(level) => Some(
                i32::try_from(level)
                    .ok()
                    .and_then(|level| level.checked_add(1))
                    .ok_or(Error::ClusterLevelOutOfRange(level))?,
            ),
            None => None,
        };

        Ok(internal::DHTMessage {
            message_type: self.message_type.code(),
            key: self.key.as_bytes().to_vec(),
            value: self.value.as_ref().map(|value| value.to_vec()),
            closer_peers: self
                .closer_peers
                .iter()
                .map(|peer| internal::DHTPeer {
                    id: peer.id.as_bytes().to_vec(),
                    addrs: peer.addrs.clone(),
                    connection: Some(connection_code(peer.connection)),
                })
                .collect(),
            cluster_level_raw,
        })
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message, Error> {
        let message_type = MessageType::from_code(msg.message_type).ok_or_else(|| {
            Error::MalformedMessage(format!("unknown message type {}", msg.message_type))
        })?;

        Ok(Message {
            message_type,
            key: Key::from(msg.key),
            value: msg.value.map(Bytes::from),
            closer_peers: msg
                .closer_peers
                .into_iter()
                .map(|peer| WirePeer {
                    id: PeerId::from(peer.id),
                    addrs: peer.addrs,
                    connection: connectedness_from_code(peer.connection.unwrap_or(0)),
                })
                .collect(),
            cluster_level: match msg.cluster_level_raw {
                Some(raw) if raw > 0 => Some((raw - 1) as u32),
                _ => None,
            },
        })
    }
}

/// Describe `peers` for the wire, annotating each with its current
/// connectivity according to `connectedness`.
pub fn to_wire_peers<F>(peers: &[PeerId], peerstore: &Peerstore, connectedness: F) -> Vec<WirePeer>
where
    F: Fn(&PeerId) -> Connectedness,
{
    peers
        .iter()
        .map(|peer| WirePeer {
            id: peer.clone(),
            addrs: peerstore
                .addresses(peer)
                .iter()
                .map(|address| address.to_string())
                .collect(),
            connection: connectedness(peer),
        })
        .collect()
}

#[derive(Debug, Default)]
/// Outcome of [from_wire_peers].
pub struct ResolvedPeers {
    /// Successfully resolved peers, in input order.
    pub peers: Vec<PeerId>,
    /// Index of each rejected descriptor and why it was rejected.
    pub errors: Vec<(usize, Error)>,
}

/// Resolve peer descriptors through the [Peerstore], registering their addresses.
///
/// A descriptor with an empty id, no addresses or an unparsable address is
/// rejected on its own; the rest of the batch is still resolved.
pub fn from_wire_peers(peerstore: &Peerstore, descriptors: &[WirePeer]) -> ResolvedPeers {
    let mut resolved = ResolvedPeers {
        peers: Vec::with_capacity(descriptors.len()),
        errors: Vec::new(),
    };

    for (index, descriptor) in descriptors.iter().enumerate() {
        match from_wire_peer(peerstore, descriptor) {
            Ok(peer) => resolved.peers.push(peer),
            Err(error) => {
                debug!(?index, ?error, "Rejected closer peer descriptor");
                resolved.errors.push((index, error))
            }
        }
    }

    resolved
}

fn from_wire_peer(peerstore: &Peerstore, descriptor: &WirePeer) -> Result<PeerId, Error> {
    if descriptor.id.is_empty() {
        return Err(Error::BadPeerDescriptor("empty peer id".to_string()));
    }

    let addresses = descriptor
        .addresses()
        .map_err(|_| Error::BadPeerDescriptor(format!("{:?}", descriptor.addrs)))?;

    if addresses.is_empty() {
        return Err(Error::BadPeerDescriptor(format!("{:?}", descriptor.addrs)));
    }

    let record = peerstore.find_or_create(&descriptor.id);
    peerstore.add_addresses(record.id(), addresses);

    Ok(record.id().clone())
}
