//! Directory of known peers: their addresses and connectivity.
//!
//! The [Peerstore] is the only owner of peer records. Everything else refers
//! to peers by [PeerId] and reports observations back here.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::common::{Connectedness, Multiaddr, PeerId};

#[derive(Debug, Clone, PartialEq)]
/// Snapshot of what is known about a peer.
pub struct PeerRecord {
    id: PeerId,
    addresses: Vec<Multiaddr>,
    connectedness: Connectedness,
}

impl PeerRecord {
    fn new(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
            connectedness: Connectedness::NotConnected,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn addresses(&self) -> &[Multiaddr] {
        &self.addresses
    }

    pub fn connectedness(&self) -> Connectedness {
        self.connectedness
    }
}

#[derive(Debug, Default)]
/// Thread safe map of [PeerId] to [PeerRecord].
pub struct Peerstore {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
}

impl Peerstore {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Returns a snapshot of the record of this peer, if any.
    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn addresses(&self, id: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|record| record.addresses.clone())
            .unwrap_or_default()
    }

    pub fn connectedness(&self, id: &PeerId) -> Connectedness {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|record| record.connectedness)
            .unwrap_or_default()
    }

    // === Public Methods ===

    /// Returns the existing record of this peer, or creates an empty one.
    ///
    /// Creation happens under the write lock, so concurrent callers can never
    /// create two records for the same identity.
    pub fn find_or_create(&self, id: &PeerId) -> PeerRecord {
        if let Some(record) = self.get(id) {
            return record;
        }

        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone()))
            .clone()
    }

    /// Add new addresses to a peer's record, creating the record if needed.
    pub fn add_addresses<I>(&self, id: &PeerId, addresses: I)
    where
        I: IntoIterator<Item = Multiaddr>,
    {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        let record = peers
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone()));

        for address in addresses {
            if !record.addresses.contains(&address) {
                record.addresses.push(address);
            }
        }
    }

    pub fn set_connectedness(&self, id: &PeerId, connectedness: Connectedness) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);

        peers
            .entry(id.clone())
            .or_insert_with(|| PeerRecord::new(id.clone()))
            .connectedness = connectedness;
    }

    pub fn remove(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn find_or_create() {
        let peerstore = Peerstore::new();
        let id = PeerId::from("other_peer");

        assert!(!peerstore.contains(&id));

        let record = peerstore.find_or_create(&id);
        assert_eq!(record.id(), &id);
        assert!(record.addresses().is_empty());
        assert_eq!(record.connectedness(), Connectedness::NotConnected);

        peerstore.find_or_create(&id);
        assert_eq!(peerstore.len(), 1);
    }

    #[test]
    fn addresses_are_a_set() {
        let peerstore = Peerstore::new();
        let id = PeerId::random();

        let address: Multiaddr = "/ip4/127.0.0.1/udp/4001".parse().unwrap();

        peerstore.add_addresses(&id, [address.clone()]);
        peerstore.add_addresses(&id, [address.clone()]);

        assert_eq!(peerstore.addresses(&id), vec![address]);
    }

    #[test]
    fn connectedness() {
        let peerstore = Peerstore::new();
        let id = PeerId::random();

        assert_eq!(peerstore.connectedness(&id), Connectedness::NotConnected);

        peerstore.set_connectedness(&id, Connectedness::Connected);
        assert_eq!(peerstore.connectedness(&id), Connectedness::Connected);
    }

    #[test]
    fn concurrent_creation() {
        let peerstore = Arc::new(Peerstore::new());
        let id = PeerId::random();

        let handles = (0..8)
            .map(|i| {
                let peerstore = peerstore.clone();
                let id = id.clone();
                thread::spawn(move || {
                    let address: Multiaddr = format!("/ip4/10.0.0.{i}/udp/1").parse().unwrap();
                    peerstore.find_or_create(&id);
                    peerstore.add_addresses(&id, [address]);
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(peerstore.len(), 1);
        assert_eq!(peerstore.addresses(&id).len(), 8);
    }
}
