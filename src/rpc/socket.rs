//! UDP transport, correlating requests and replies by transaction id.

mod inflight_requests;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::common::{udp_multiaddr, udp_socket_addr, Connectedness, Multiaddr, PeerId};
use crate::Peerstore;

use super::{Context, Handler, Transport, TransportError};

use inflight_requests::InflightRequests;

/// Largest UDP payload.
const MTU: usize = 65_507;
/// How long the receiving loop blocks on an empty socket before checking for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Inflight requests nobody collected after this long are dropped.
const ABANDONED_REQUEST_TTL: Duration = Duration::from_secs(5 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

const REQUEST: &str = "q";
const RESPONSE: &str = "r";
const NOTIFICATION: &str = "n";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct Envelope {
    #[serde(rename = "t")]
    transaction_id: u32,

    #[serde(rename = "y")]
    kind: String,

    #[serde(rename = "f")]
    #[serde(with = "serde_bytes")]
    from: Vec<u8>,

    #[serde(rename = "p")]
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,

    #[serde(rename = "m")]
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Shared {
    local: PeerId,
    socket: UdpSocket,
    local_addr: SocketAddr,
    peerstore: Arc<Peerstore>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    inflight: Mutex<InflightRequests>,
    connections: RwLock<HashMap<PeerId, Connectedness>>,
    next_tid: AtomicU32,
    running: AtomicBool,
}

/// A [Transport] that exchanges bencoded envelopes over a [UdpSocket].
///
/// Inbound payloads are handled on a dedicated thread, which runs until the
/// transport is dropped.
#[derive(Debug)]
pub struct UdpTransport {
    shared: Arc<Shared>,
}

impl UdpTransport {
    /// Bind a socket at `address` for the node `local`.
    pub fn bind<A: ToSocketAddrs>(local: PeerId, address: A) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(address)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let shared = Arc::new(Shared {
            local,
            local_addr: socket.local_addr()?,
            socket,
            peerstore: Arc::new(Peerstore::new()),
            handlers: RwLock::new(HashMap::new()),
            inflight: Mutex::new(InflightRequests::new()),
            connections: RwLock::new(HashMap::new()),
            next_tid: AtomicU32::new(0),
            running: AtomicBool::new(true),
        });

        let cloned = shared.clone();
        thread::Builder::new()
            .name("kadlookup-udp".to_string())
            .spawn(move || cloned.run())?;

        debug!(local_addr = ?shared.local_addr, "Listening on UDP");

        Ok(Self { shared })
    }

    // === Getters ===

    /// Returns the address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    // === Private Methods ===

    fn resolve(&self, peer: &PeerId) -> Result<SocketAddr, TransportError> {
        self.shared
            .peerstore
            .addresses(peer)
            .iter()
            .find_map(udp_socket_addr)
            .ok_or_else(|| TransportError::NoAddress(peer.clone()))
    }

    fn envelope(&self, transaction_id: u32, kind: &str, protocol: &str, payload: Bytes) -> Envelope {
        Envelope {
            transaction_id,
            kind: kind.to_string(),
            from: self.shared.local.as_bytes().to_vec(),
            protocol: Some(protocol.to_string()),
            payload: payload.to_vec(),
        }
    }
}

impl Shared {
    /// Receiving loop.
    fn run(&self) {
        let mut buf = vec![0_u8; MTU];
        let mut last_cleanup = Instant::now();

        while self.running.load(Ordering::Relaxed) {
            if last_cleanup.elapsed() > CLEANUP_INTERVAL {
                self.inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .cleanup(ABANDONED_REQUEST_TTL);
                last_cleanup = Instant::now();
            }

            match self.socket.recv_from(&mut buf) {
                Ok((amt, from)) => self.handle_packet(&buf[..amt], from),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(error) => {
                    trace!(
                        context = "socket_error",
                        ?error,
                        "recv_from failed unexpectedly"
                    );
                }
            }
        }

        trace!(context = "socket_shutdown", local_addr = ?self.local_addr);
    }

    fn handle_packet(&self, bytes: &[u8], from: SocketAddr) {
        if from.port() == 0 {
            trace!(context = "socket_validation", message = "Packet from port 0");
            return;
        }

        let envelope: Envelope = match serde_bencode::from_bytes(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                trace!(
                    context = "socket_error",
                    ?error,
                    ?from,
                    message = ?String::from_utf8_lossy(bytes),
                    "Received invalid Bencode message."
                );
                return;
            }
        };

        let peer = PeerId::from(envelope.from);

        if peer.is_empty() {
            trace!(context = "socket_validation", ?from, message = "Missing sender identity");
            return;
        }

        match envelope.kind.as_str() {
            REQUEST | NOTIFICATION => {
                trace!(context = "socket_message_receiving", ?peer, ?from, kind = %envelope.kind, "Received request message");

                self.peerstore.add_addresses(&peer, [udp_multiaddr(from)]);
                self.set_connectedness(&peer, Connectedness::Connected);

                let handler = envelope.protocol.as_deref().and_then(|protocol| {
                    self.handlers
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get(protocol)
                        .cloned()
                });

                let Some(handler) = handler else {
                    trace!(context = "socket_validation", protocol = ?envelope.protocol, "No handler for protocol");
                    return;
                };

                let reply = handler.handle(&peer, &envelope.payload);

                if let (REQUEST, Some(reply)) = (envelope.kind.as_str(), reply) {
                    let response = Envelope {
                        transaction_id: envelope.transaction_id,
                        kind: RESPONSE.to_string(),
                        from: self.local.as_bytes().to_vec(),
                        protocol: None,
                        payload: reply.to_vec(),
                    };

                    let _ = self.send(from, &response).map_err(|e| {
                        debug!(?e, "Error sending response message");
                    });
                }
            }
            RESPONSE => {
                trace!(context = "socket_message_receiving", ?peer, ?from, "Received response message");

                let request = self
                    .inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take(envelope.transaction_id, &from);

                match request {
                    Some(request) => {
                        let _ = request.reply.send(Bytes::from(envelope.payload));
                    }
                    None => {
                        trace!(
                            context = "socket_validation",
                            message = "Unexpected response id"
                        );
                    }
                }
            }
            kind => {
                trace!(context = "socket_validation", ?kind, "Unknown envelope kind");
            }
        }
    }

    fn send(&self, address: SocketAddr, envelope: &Envelope) -> Result<(), TransportError> {
        self.socket
            .send_to(&serde_bencode::to_bytes(envelope)?, address)?;
        trace!(context = "socket_message_sending", ?address, kind = %envelope.kind);
        Ok(())
    }

    /// Increments self.next_tid and returns the previous value.
    fn tid(&self) -> u32 {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn set_connectedness(&self, peer: &PeerId, connectedness: Connectedness) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone(), connectedness);
    }
}

impl Transport for UdpTransport {
    fn local_peer(&self) -> &PeerId {
        &self.shared.local
    }

    fn listen_addresses(&self) -> Vec<Multiaddr> {
        vec![udp_multiaddr(self.shared.local_addr)]
    }

    fn peerstore(&self) -> &Arc<Peerstore> {
        &self.shared.peerstore
    }

    /// UDP has no connections, dialing only checks that the peer has an address.
    fn dial_peer(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.resolve(peer)?;

        if self.connectedness(peer) != Connectedness::Connected {
            self.shared
                .set_connectedness(peer, Connectedness::CanConnect);
        }

        Ok(())
    }

    fn close_peer(&self, peer: &PeerId) {
        self.shared
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        self.shared
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
            .unwrap_or_default()
    }

    fn set_handler(&self, protocol: &str, handler: Arc<dyn Handler>) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol.to_string(), handler);
    }

    fn remove_handler(&self, protocol: &str) {
        self.shared
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
        if let Some(error) = ctx.err() {
            return Err(error);
        }

        let address = self.resolve(peer)?;
        let tid = self.shared.tid();

        let (sender, receiver) = flume::bounded(1);

        self.shared
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(tid, address, sender);

        let result = self
            .shared
            .send(address, &self.envelope(tid, REQUEST, protocol, payload))
            .and_then(|_| ctx.recv(&receiver));

        match result {
            Ok(reply) => {
                self.shared.set_connectedness(peer, Connectedness::Connected);
                Ok(reply)
            }
            Err(error) => {
                self.shared
                    .inflight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .cancel(tid);

                if !error.is_cut_off() {
                    self.shared
                        .set_connectedness(peer, Connectedness::CannotConnect);
                }

                Err(error)
            }
        }
    }

    fn send(
        &self,
        ctx: &Context,
        peer: &PeerId,
        protocol: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        if let Some(error) = ctx.err() {
            return Err(error);
        }

        let address = self.resolve(peer)?;
        let tid = self.shared.tid();

        self.shared
            .send(address, &self.envelope(tid, NOTIFICATION, protocol, payload))
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
    }
}
