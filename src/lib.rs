#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod common;
mod dht;
mod error;
mod peerstore;

// Public modules
#[cfg(feature = "async")]
pub mod async_dht;
pub mod rpc;
pub mod server;

pub use crate::common::{
    memory_multiaddr, memory_port, messages, parse_multiaddr, udp_multiaddr, udp_socket_addr,
    ClosestPeers, Connectedness, Id, Key, Message, MessageType, Multiaddr, PeerEntry, PeerId,
    Protocol, RoutingTable, WirePeer, ID_SIZE, MAX_BUCKET_SIZE_K, MAX_DISTANCE,
};
pub use bytes::Bytes;
pub use dht::{Dht, DhtBuilder, QueryError, Testnet};
pub use error::Error;
pub use peerstore::{PeerRecord, Peerstore};
