//! In-process network, for tests and simulations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::trace;

use crate::common::{memory_multiaddr, memory_port, Connectedness, Multiaddr, PeerId};
use crate::Peerstore;

use super::{Context, Handler, Transport, TransportError};

type Handlers = Arc<RwLock<HashMap<String, Arc<dyn Handler>>>>;

#[derive(Debug)]
struct Endpoint {
    peer: PeerId,
    address: Multiaddr,
    peerstore: Arc<Peerstore>,
    handlers: Handlers,
}

#[derive(Debug, Clone, Default)]
/// A set of [MemoryTransport]s that can reach each other by their `/memory/..` addresses.
pub struct MemoryNetwork {
    next_port: Arc<AtomicU64>,
    endpoints: Arc<RwLock<HashMap<u64, Arc<Endpoint>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint with the given identity to this network.
    pub fn transport(&self, local: PeerId) -> Arc<MemoryTransport> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) + 1;

        let endpoint = Arc::new(Endpoint {
            peer: local,
            address: memory_multiaddr(port),
            peerstore: Arc::new(Peerstore::new()),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        });

        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port, endpoint.clone());

        Arc::new(MemoryTransport {
            endpoint,
            port,
            network: self.clone(),
            connections: RwLock::new(HashMap::new()),
        })
    }

    /// Detach the endpoint at `port`, making it unreachable.
    pub fn disconnect(&self, port: u64) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&port);
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn endpoint(&self, port: u64) -> Option<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&port)
            .cloned()
    }
}

#[derive(Debug)]
/// [Transport] over a [MemoryNetwork].
///
/// Handlers run on the requesting thread.
pub struct MemoryTransport {
    endpoint: Arc<Endpoint>,
    port: u64,
    network: MemoryNetwork,
    connections: RwLock<HashMap<PeerId, Connectedness>>,
}

impl MemoryTransport {
    // === Getters ===

    pub fn address(&self) -> &Multiaddr {
        &self.endpoint.address
    }

    pub fn port(&self) -> u64 {
        self.port
    }

    // === Private Methods ===

    fn resolve(&self, peer: &PeerId) -> Result<Arc<Endpoint>, TransportError> {
        let port = self
            .endpoint
            .peerstore
            .addresses(peer)
            .iter()
            .find_map(memory_port)
            .ok_or_else(|| TransportError::NoAddress(peer.clone()))?;

        match self.network.endpoint(port) {
            Some(endpoint) if &endpoint.peer == peer => Ok(endpoint),
            _ => Err(TransportError::Unreachable(peer.clone())),
        }
    }

    fn set_connectedness(&self, peer: &PeerId, connectedness: Connectedness) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone(), connectedness);
    }

    /// Deliver `payload` to the handler of `peer`, returning its reply.
    fn deliver(
        &self,
        ctx: &Context,
        peer: &PeerId,
        protocol: &str,
        payload: &[u8],
    ) -> Result<Option<Bytes>, TransportError> {
        if let Some(error) = ctx.err() {
            return Err(error);
        }

        let remote = match self.resolve(peer) {
            Ok(remote) => remote,
            Err(error) => {
                self.set_connectedness(peer, Connectedness::CannotConnect);
                return Err(error);
            }
        };

        let handler = remote
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
            .ok_or_else(|| TransportError::NoHandler(protocol.to_string()))?;

        self.set_connectedness(peer, Connectedness::Connected);

        // The remote learns our address from the exchange.
        remote
            .peerstore
            .add_addresses(&self.endpoint.peer, [self.endpoint.address.clone()]);

        trace!(context = "memory_transport", from = ?self.endpoint.peer, to = ?peer, protocol, "Delivering payload");

        Ok(handler.handle(&self.endpoint.peer, payload))
    }
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> &PeerId {
        &self.endpoint.peer
    }

    fn listen_addresses(&self) -> Vec<Multiaddr> {
        vec![self.endpoint.address.clone()]
    }

    fn peerstore(&self) -> &Arc<Peerstore> {
        &self.endpoint.peerstore
    }

    fn dial_peer(&self, peer: &PeerId) -> Result<(), TransportError> {
        match self.resolve(peer) {
            Ok(_) => {
                self.set_connectedness(peer, Connectedness::Connected);
                Ok(())
            }
            Err(error) => {
                self.set_connectedness(peer, Connectedness::CannotConnect);
                Err(error)
            }
        }
    }

    fn close_peer(&self, peer: &PeerId) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
            .unwrap_or_default()
    }

    fn set_handler(&self, protocol: &str, handler: Arc<dyn Handler>) {
        self.endpoint
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler);
    }

    fn remove_handler(&self, protocol: &str) {
        self.endpoint
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(protocol);
    }

    fn request(
        &self,
        ctx: &Context,
        peer: &PeerId,
        protocol: &str,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        match self.deliver(ctx, peer, protocol, &payload)? {
            Some(reply) => Ok(reply),
            // A silent peer, wait for the caller to give up.
            None => Err(ctx.done()),
        }
    }

    fn send(
        &self,
        ctx: &Context,
        peer: &PeerId,
        protocol: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.deliver(ctx, peer, protocol, &payload)?;

        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.disconnect(self.port);
    }
}
