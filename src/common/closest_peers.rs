use std::vec::IntoIter;

use crate::common::{Id, PeerId};

#[derive(Debug, Clone)]
struct Candidate {
    peer: PeerId,
    distance: Id,
}

/// Peers sorted by XOR distance to a target, optionally capped in size.
///
/// Insertion is stable: a peer at the same distance as existing ones goes
/// after them, so equal distances keep discovery order.
#[derive(Debug, Clone)]
pub struct ClosestPeers {
    target: Id,
    capacity: Option<usize>,
    candidates: Vec<Candidate>,
}

impl ClosestPeers {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            capacity: None,
            candidates: Vec::with_capacity(200),
        }
    }

    /// Keep only the `capacity` closest peers, dropping further ones.
    pub fn with_capacity(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity: Some(capacity),
            candidates: Vec::with_capacity(capacity),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.candidates.iter().any(|c| &c.peer == peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.candidates.iter().map(|c| &c.peer)
    }

    pub fn to_vec(&self) -> Vec<PeerId> {
        self.iter().cloned().collect()
    }

    // === Public Methods ===

    /// Insert a peer in distance order, returns `true` if it was kept.
    pub fn add(&mut self, peer: PeerId) -> bool {
        if self.contains(&peer) {
            return false;
        }

        let distance = peer.id().xor(&self.target);
        let index = self
            .candidates
            .partition_point(|probe| probe.distance <= distance);

        if let Some(capacity) = self.capacity {
            if index >= capacity {
                return false;
            }
        }

        self.candidates.insert(index, Candidate { peer, distance });

        if let Some(capacity) = self.capacity {
            self.candidates.truncate(capacity);
        }

        true
    }

    /// Drop a peer, freeing its slot. Returns `true` if it was present.
    pub fn remove(&mut self, peer: &PeerId) -> bool {
        match self.candidates.iter().position(|c| &c.peer == peer) {
            Some(index) => {
                self.candidates.remove(index);
                true
            }
            None => false,
        }
    }
}

impl IntoIterator for ClosestPeers {
    type Item = PeerId;
    type IntoIter = IntoIter<PeerId>;

    fn into_iter(self) -> Self::IntoIter {
        self.candidates
            .into_iter()
            .map(|c| c.peer)
            .collect::<Vec<_>>()
            .into_iter()
    }
}
