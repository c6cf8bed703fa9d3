//! Miscellaneous common structs used throughout the library.

mod address;
mod closest_peers;
mod id;
pub mod messages;
mod peer;
mod routing_table;

pub use address::*;
pub use closest_peers::*;
pub use id::*;
pub use messages::{Message, MessageType, WirePeer};
pub use peer::*;
pub use routing_table::*;
