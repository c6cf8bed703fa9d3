//! Answering requests from other peers.

mod store;

use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::common::messages::to_wire_peers;
use crate::common::{Id, Message, MessageType, PeerId, RoutingTable, WirePeer};
use crate::rpc::{Handler, Transport};
use crate::Peerstore;

pub use store::{Datastore, MemoryStore, MAX_VALUES};

#[derive(Debug)]
/// [Handler] of DHT messages.
///
/// Serves GET_VALUE, PUT_VALUE, FIND_NODE and PING. Provider records are not
/// supported, such requests are left unanswered.
pub struct RequestHandler {
    local: PeerId,
    k: usize,
    routing_table: Arc<RwLock<RoutingTable>>,
    peerstore: Arc<Peerstore>,
    store: Arc<dyn Datastore>,
    /// Source of connectivity hints, weak since the transport owns this handler.
    transport: Weak<dyn Transport>,
}

impl RequestHandler {
    pub(crate) fn new(
        k: usize,
        routing_table: Arc<RwLock<RoutingTable>>,
        store: Arc<dyn Datastore>,
        transport: &Arc<dyn Transport>,
    ) -> Self {
        Self {
            local: transport.local_peer().clone(),
            k,
            routing_table,
            peerstore: transport.peerstore().clone(),
            store,
            transport: Arc::downgrade(transport),
        }
    }

    // === Private Methods ===

    fn handle_request(&self, from: &PeerId, request: &Message) -> Option<Message> {
        match request.message_type {
            MessageType::GetValue => self.handle_get_value(from, request),
            MessageType::PutValue => self.handle_put_value(from, request),
            MessageType::FindNode => Some(
                request
                    .reply()
                    .with_closer_peers(self.closer_peers(&request.key.id(), from)),
            ),
            MessageType::Ping => Some(request.reply()),
            MessageType::AddProvider | MessageType::GetProviders => {
                debug!(?from, message_type = %request.message_type, "Ignoring unsupported request");
                None
            }
        }
    }

    fn handle_get_value(&self, from: &PeerId, request: &Message) -> Option<Message> {
        if request.key.is_empty() {
            debug!(?from, "GET_VALUE without a key");
            return None;
        }

        let reply = request.reply();

        match self.store.get(&request.key).filter(|value| !value.is_empty()) {
            Some(value) => Some(reply.with_value(value)),
            None => Some(reply.with_closer_peers(self.closer_peers(&request.key.id(), from))),
        }
    }

    fn handle_put_value(&self, from: &PeerId, request: &Message) -> Option<Message> {
        match request.found_value() {
            Some(value) if !request.key.is_empty() => {
                trace!(?from, key = ?request.key, "Storing value");
                self.store.put(request.key.clone(), value.clone());

                Some(request.clone())
            }
            _ => {
                debug!(?from, key = ?request.key, "PUT_VALUE without a key or value");
                None
            }
        }
    }

    /// Up to `k` known peers closest to `target`, excluding the requester
    /// and peers whose addresses we don't know.
    fn closer_peers(&self, target: &Id, requester: &PeerId) -> Vec<WirePeer> {
        let table = self
            .routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let closest = table
            .closest_peers(target, table.size())
            .into_iter()
            .filter(|peer| peer != requester && !self.peerstore.addresses(peer).is_empty())
            .take(self.k)
            .collect::<Vec<_>>();

        drop(table);

        let transport = self.transport.upgrade();

        to_wire_peers(&closest, &self.peerstore, |peer| match &transport {
            Some(transport) => transport.connectedness(peer),
            None => self.peerstore.connectedness(peer),
        })
    }
}

impl Handler for RequestHandler {
    fn handle(&self, from: &PeerId, payload: &[u8]) -> Option<Bytes> {
        let request = match Message::from_bytes(payload) {
            Ok(request) => request,
            Err(error) => {
                debug!(?from, ?error, "Dropping undecodable request");
                return None;
            }
        };

        trace!(?from, message_type = %request.message_type, key = ?request.key, "Handling request");

        if from != &self.local {
            self.routing_table
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .update(from);
        }

        let reply = self.handle_request(from, &request)?;

        match reply.to_bytes() {
            Ok(bytes) => Some(bytes.into()),
            Err(error) => {
                debug!(?error, "Failed to encode reply");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::common::{Connectedness, Key, Multiaddr};
    use crate::rpc::MemoryNetwork;

    use super::*;

    struct Fixture {
        _network: MemoryNetwork,
        transport: Arc<dyn Transport>,
        table: Arc<RwLock<RoutingTable>>,
        store: Arc<MemoryStore>,
        handler: RequestHandler,
    }

    fn fixture(known: &[PeerId]) -> Fixture {
        let network = MemoryNetwork::new();
        let transport: Arc<dyn Transport> = network.transport(PeerId::from("server"));

        let mut table = RoutingTable::new(transport.local_peer().clone());
        for (i, peer) in known.iter().enumerate() {
            table.update(peer);

            let address: Multiaddr = format!("/ip4/10.0.0.{}/udp/4001", i % 250).parse().unwrap();
            transport.peerstore().add_addresses(peer, [address]);
        }

        let table = Arc::new(RwLock::new(table));
        let store = Arc::new(MemoryStore::default());

        let handler = RequestHandler::new(3, table.clone(), store.clone(), &transport);

        Fixture {
            _network: network,
            transport,
            table,
            store,
            handler,
        }
    }

    fn exchange(handler: &RequestHandler, from: &PeerId, request: &Message) -> Option<Message> {
        handler
            .handle(from, &request.to_bytes().unwrap())
            .map(|bytes| Message::from_bytes(bytes).unwrap())
    }

    #[test]
    fn get_value_present() {
        let fixture = fixture(&[]);
        let key = Key::from("key");

        fixture
            .store
            .put(key.clone(), Bytes::from_static(b"value"));

        let mut request = Message::new(MessageType::GetValue, key.clone(), 0);
        request.set_cluster_level(4);

        let reply = exchange(&fixture.handler, &PeerId::from("client"), &request).unwrap();

        assert_eq!(reply.message_type, MessageType::GetValue);
        assert_eq!(reply.key, key);
        assert_eq!(reply.value, Some(Bytes::from_static(b"value")));
        assert_eq!(reply.cluster_level(), 4);
    }

    #[test]
    fn get_value_absent_returns_closer_peers() {
        let requester = PeerId::from("client");

        let mut known = (0..10).map(|_| PeerId::random()).collect::<Vec<_>>();
        known.push(requester.clone());

        let fixture = fixture(&known);
        let key = Key::from("missing");

        let request = Message::new(MessageType::GetValue, key.clone(), 0);
        let reply = exchange(&fixture.handler, &requester, &request).unwrap();

        assert_eq!(reply.message_type, MessageType::GetValue);
        assert_eq!(reply.key, key);
        assert!(reply.found_value().is_none());
        assert_eq!(reply.closer_peers.len(), 3);

        let expected = fixture
            .table
            .read()
            .unwrap()
            .closest_peers(&key.id(), 20)
            .into_iter()
            .filter(|peer| peer != &requester)
            .take(3)
            .collect::<Vec<_>>();

        let returned = reply
            .closer_peers
            .iter()
            .map(|peer| peer.id.clone())
            .collect::<Vec<_>>();

        assert_eq!(returned, expected);
        assert!(reply
            .closer_peers
            .iter()
            .all(|peer| peer.addrs.len() == 1 && peer.connection == Connectedness::NotConnected));
    }

    #[test]
    fn put_then_get() {
        let fixture = fixture(&[]);
        let from = PeerId::from("client");
        let key = Key::from("key");

        let put = Message::new(MessageType::PutValue, key.clone(), 0)
            .with_value(Bytes::from_static(b"value"));
        assert_eq!(exchange(&fixture.handler, &from, &put), Some(put.clone()));

        let get = Message::new(MessageType::GetValue, key, 0);
        let reply = exchange(&fixture.handler, &from, &get).unwrap();

        assert_eq!(reply.found_value(), Some(&Bytes::from_static(b"value")));

        let empty = Message::new(MessageType::PutValue, Key::from("empty"), 0);
        assert!(exchange(&fixture.handler, &from, &empty).is_none());
        assert!(fixture.store.get(&Key::from("empty")).is_none());
    }

    #[test]
    fn requester_is_added_to_routing_table() {
        let fixture = fixture(&[]);
        let from = PeerId::from("client");

        let ping = Message::new(MessageType::Ping, Key::default(), 0);
        assert_eq!(exchange(&fixture.handler, &from, &ping), Some(ping.reply()));

        assert!(fixture.table.read().unwrap().contains(&from));
        assert!(!fixture
            .table
            .read()
            .unwrap()
            .contains(fixture.transport.local_peer()));
    }

    #[test]
    fn unsupported_and_undecodable() {
        let fixture = fixture(&[PeerId::random()]);
        let from = PeerId::from("client");

        for message_type in [MessageType::AddProvider, MessageType::GetProviders] {
            let request = Message::new(message_type, Key::from("key"), 0);
            assert!(exchange(&fixture.handler, &from, &request).is_none());
        }

        assert!(fixture.handler.handle(&from, b"garbage").is_none());
        assert!(!fixture.table.read().unwrap().contains(&from));
    }
}
