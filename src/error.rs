//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Kadlookup crate error enum.
pub enum Error {
    /// Id bytes are not exactly [ID_SIZE](crate::common::ID_SIZE) long.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// The identity this node was constructed with can't be used.
    #[error("Invalid local identity: {0}")]
    InvalidLocalIdentity(&'static str),

    #[error("Invalid multiaddr {0:?}: {1}")]
    /// An address string that doesn't parse as a [crate::Multiaddr].
    InvalidMultiaddr(String, #[source] multiaddr::Error),

    /// Bytes that do not conform to the DHT message schema.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A closer peer descriptor that can't be turned into a peer.
    #[error("Received peer with bad or missing addresses: {0}")]
    BadPeerDescriptor(String),

    #[error("Cluster level {0} doesn't fit the wire encoding")]
    ClusterLevelOutOfRange(u32),

    /// Empty values are indistinguishable from absence on the wire.
    #[error("Refusing to store an empty value")]
    EmptyValue,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

impl From<serde_bencode::Error> for Error {
    fn from(error: serde_bencode::Error) -> Self {
        Error::MalformedMessage(error.to_string())
    }
}
