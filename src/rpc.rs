//! Messaging with other peers, and the lookups built on it.

mod client;
mod config;
mod context;
mod info;
mod iterative_query;
mod memory;
mod socket;
mod transport;

pub use client::{RpcClient, RpcError};
pub use config::{Config, DEFAULT_ALPHA, DEFAULT_REQUEST_TIMEOUT};
pub use context::{Canceller, Context};
pub use info::Info;
pub use iterative_query::FoundValue;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use socket::UdpTransport;
pub use transport::{Handler, Transport, TransportError, PROTOCOL_ID};

pub(crate) use iterative_query::{IterativeQuery, QueryOutcome};
