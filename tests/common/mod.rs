#![allow(dead_code)]

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use kadlookup::rpc::{Context, Handler, Transport, TransportError};
use kadlookup::{Bytes, Connectedness, Message, Multiaddr, PeerId, Peerstore, WirePeer};

type Responder = Box<dyn Fn(&PeerId, &Message) -> Option<Message> + Send + Sync>;

/// A network where every peer answers with the same responder.
///
/// Without a responder, or when it returns `None`, peers never reply.
pub struct FakeTransport {
    local: PeerId,
    peerstore: Arc<Peerstore>,
    responder: RwLock<Option<Responder>>,
    requests: AtomicUsize,
}

impl FakeTransport {
    pub fn new(local: PeerId) -> Arc<Self> {
        Arc::new(Self {
            local,
            peerstore: Arc::new(Peerstore::new()),
            responder: RwLock::new(None),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&PeerId, &Message) -> Option<Message> + Send + Sync + 'static,
    {
        *self
            .responder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(responder));
    }

    /// Number of requests and notifications sent so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    fn respond(&self, peer: &PeerId, payload: &[u8]) -> Option<Bytes> {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let request = Message::from_bytes(payload).expect("valid request");

        let guard = self
            .responder
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let responder = guard.as_ref()?;

        responder(peer, &request).map(|reply| reply.to_bytes().expect("valid reply").into())
    }
}

impl Debug for FakeTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTransport")
            .field("local", &self.local)
            .field("requests", &self.requests())
            .finish()
    }
}

impl Transport for FakeTransport {
    fn local_peer(&self) -> &PeerId {
        &self.local
    }

    fn listen_addresses(&self) -> Vec<Multiaddr> {
        Vec::new()
    }

    fn peerstore(&self) -> &Arc<Peerstore> {
        &self.peerstore
    }

    fn dial_peer(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.peerstore
            .set_connectedness(peer, Connectedness::Connected);

        Ok(())
    }

    fn close_peer(&self, peer: &PeerId) {
        self.peerstore
            .set_connectedness(peer, Connectedness::NotConnected);
    }

    fn connectedness(&self, peer: &PeerId) -> Connectedness {
        self.peerstore.connectedness(peer)
    }

    fn set_handler(&self, _protocol: &str, _handler: Arc<dyn Handler>) {}

    fn remove_handler(&self, _protocol: &str) {}

    fn request(
        &self,
        ctx: &Context,
        peer: &PeerId,
        _protocol: &str,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        if let Some(error) = ctx.err() {
            return Err(error);
        }

        match self.respond(peer, &payload) {
            Some(reply) => Ok(reply),
            None => Err(ctx.done()),
        }
    }

    fn send(
        &self,
        _ctx: &Context,
        peer: &PeerId,
        _protocol: &str,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        self.respond(peer, &payload);

        Ok(())
    }
}

pub fn random_address() -> Multiaddr {
    format!(
        "/ip4/10.{}.{}.{}/udp/{}",
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u16>().max(1)
    )
    .parse()
    .expect("valid multiaddr")
}

/// Descriptors of `count` fresh random peers.
pub fn random_wire_peers(count: usize) -> Vec<WirePeer> {
    (0..count)
        .map(|_| WirePeer {
            id: PeerId::random(),
            addrs: vec![random_address().to_string()],
            connection: Connectedness::NotConnected,
        })
        .collect()
}
