//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{Id, PeerId, MAX_DISTANCE};

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// The age of an entry's last contact at which a full bucket may evict it.
pub const STALE_TIME: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
/// A peer observed to be reachable.
pub struct PeerEntry {
    peer: PeerId,
    id: Id,
    last_seen: Instant,
}

impl PeerEntry {
    pub fn new(peer: PeerId) -> Self {
        Self {
            id: peer.id(),
            peer,
            last_seen: Instant::now(),
        }
    }

    // === Getters ===

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Node is last seen more than [STALE_TIME] ago.
    pub fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }
}

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    id: Id,
    local: PeerId,
    k: usize,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] around the local peer identity.
    pub fn new(local: PeerId) -> Self {
        RoutingTable {
            id: local.id(),
            local,
            k: MAX_BUCKET_SIZE_K,
            buckets: BTreeMap::new(),
        }
    }

    // === Options ===

    /// Set the k-bucket size, defaults to [MAX_BUCKET_SIZE_K].
    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.k = k.max(1);
        self
    }

    // === Getters ===

    /// Returns the [Id] of this node, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    // === Public Methods ===

    /// Record `peer` as reachable, refreshing it if it is already known.
    ///
    /// Returns `false` if the peer is this node, or if its bucket is full of
    /// fresh entries.
    pub fn update(&mut self, peer: &PeerId) -> bool {
        if peer == &self.local {
            return false;
        }

        let entry = PeerEntry::new(peer.clone());
        let distance = self.id.distance(&entry.id);

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        let k = self.k;
        let bucket = self
            .buckets
            .entry(distance)
            .or_insert_with(|| KBucket::new(k));

        bucket.update(entry)
    }

    /// Remove a peer from this routing table.
    pub fn remove(&mut self, peer: &PeerId) {
        let distance = self.id.distance(&peer.id());

        if let Some(bucket) = self.buckets.get_mut(&distance) {
            bucket.remove(peer)
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.find(peer).is_some()
    }

    pub fn find(&self, peer: &PeerId) -> Option<&PeerEntry> {
        let distance = self.id.distance(&peer.id());

        self.buckets
            .get(&distance)
            .and_then(|bucket| bucket.iter().find(|entry| entry.peer() == peer))
    }

    /// Return up to `count` peers in ascending XOR distance to `target`,
    /// ties broken by identity byte order.
    pub fn closest_peers(&self, target: &Id, count: usize) -> Vec<PeerId> {
        let mut entries = self.entries().collect::<Vec<_>>();

        entries.sort_by(|a, b| {
            a.id.xor(target)
                .cmp(&b.id.xor(target))
                .then_with(|| a.peer.as_bytes().cmp(b.peer.as_bytes()))
        });

        entries
            .into_iter()
            .take(count)
            .map(|entry| entry.peer.clone())
            .collect()
    }

    /// Return the [Self::bucket_size] closest peers to the target.
    pub fn closest(&self, target: &Id) -> Vec<PeerId> {
        self.closest_peers(target, self.k)
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.entries.len())
    }

    /// Returns an iterator over the peers in this routing table.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries().map(|entry| &entry.peer)
    }

    /// Returns an iterator over the entries in this routing table, closest
    /// buckets first.
    pub fn entries(&self) -> RoutingTableIterator<'_> {
        RoutingTableIterator {
            bucket_index: 1,
            entry_index: 0,
            table: self,
        }
    }
}

pub struct RoutingTableIterator<'a> {
    bucket_index: u8,
    entry_index: usize,
    table: &'a RoutingTable,
}

impl<'a> Iterator for RoutingTableIterator<'a> {
    type Item = &'a PeerEntry;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket_index <= MAX_DISTANCE {
            if let Some(current_bucket) = self.table.buckets.get(&self.bucket_index) {
                if let Some(current) = current_bucket.entries.get(self.entry_index) {
                    self.entry_index += 1;
                    return Some(current);
                }
            };

            self.entry_index = 0;
            self.bucket_index += 1;
        }

        None
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive nodes,
/// without dropping any responsive nodes in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    k: usize,
    /// Entries in the k-bucket, sorted by the least recently seen.
    entries: Vec<PeerEntry>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        KBucket {
            k,
            entries: Vec::with_capacity(k),
        }
    }

    // === Public Methods ===

    pub fn update(&mut self, incoming: PeerEntry) -> bool {
        if let Some(index) = self.iter().position(|e| e.peer == incoming.peer) {
            // Move to the tail, as the most recently seen.
            self.entries.remove(index);
            self.entries.push(incoming);

            true
        } else if self.entries.len() < self.k {
            self.entries.push(incoming);
            true
        } else if self.entries.first().is_some_and(PeerEntry::is_stale) {
            // Remove the least recently seen entry and add the new one
            self.entries.remove(0);
            self.entries.push(incoming);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.entries.retain(|entry| &entry.peer != peer);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> Iter<'_, PeerEntry> {
        self.entries.iter()
    }
}
