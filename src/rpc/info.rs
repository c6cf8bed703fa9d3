use crate::common::{Id, Multiaddr, PeerId};

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    pub(crate) local: PeerId,
    pub(crate) id: Id,
    pub(crate) listen_addresses: Vec<Multiaddr>,
    pub(crate) routing_table_size: usize,
    pub(crate) known_peers: usize,
    pub(crate) running: bool,
}

impl Info {
    /// This node's [PeerId]
    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// This node's [Id], where distances are measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Addresses the transport of this node listens on.
    pub fn listen_addresses(&self) -> &[Multiaddr] {
        &self.listen_addresses
    }

    /// Number of peers in the routing table.
    pub fn routing_table_size(&self) -> usize {
        self.routing_table_size
    }

    /// Number of peers in the [crate::Peerstore], reachable or not.
    pub fn known_peers(&self) -> usize {
        self.known_peers
    }

    /// Returns `true` if this node is serving requests.
    pub fn running(&self) -> bool {
        self.running
    }
}
