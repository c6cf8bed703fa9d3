//! Manage iterative queries and their corresponding request/response.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::common::messages::from_wire_peers;
use crate::common::{ClosestPeers, Connectedness, Id, Message, MessageType, PeerId, RoutingTable};
use crate::Peerstore;

use super::{Context, RpcClient, RpcError};

type Event = (PeerId, Result<Message, RpcError>);

#[derive(Debug, Clone, PartialEq)]
/// A value found by a lookup.
pub struct FoundValue {
    pub value: Bytes,
    /// The peer that returned the value.
    pub from: PeerId,
    /// Peers that replied without the value, closest first.
    pub near_misses: Vec<PeerId>,
}

#[derive(Debug)]
pub(crate) enum QueryOutcome {
    Found(FoundValue),
    /// Every candidate was queried, returns the closest responders.
    Exhausted(Vec<PeerId>),
    /// The deadline passed first, returns the closest responders so far.
    TimedOut(Vec<PeerId>),
}

/// An iterative process of concurrently sending a request to the closest known peers to
/// the target, adding closer peers discovered in the replies as candidates, and
/// repeating this process until no unqueried candidates are left.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    request: Message,
    target: Id,
    local: PeerId,
    k: usize,
    alpha: usize,
    /// The `k` closest candidates not known to be exhausted, queried or not.
    frontier: ClosestPeers,
    queried: HashSet<PeerId>,
    responders: ClosestPeers,
    /// Requests that ended because of the deadline, not because of the peer.
    cut_off: usize,
}

impl IterativeQuery {
    pub fn new(local: PeerId, request: Message, k: usize, alpha: usize) -> Self {
        let target = request.key.id();

        trace!(?target, message_type = %request.message_type, "New Query");

        Self {
            request,
            target,
            local,
            k,
            alpha: alpha.max(1),
            frontier: ClosestPeers::with_capacity(target, k),
            queried: HashSet::new(),
            responders: ClosestPeers::with_capacity(target, k),
            cut_off: 0,
        }
    }

    // === Getters ===

    fn wants_value(&self) -> bool {
        self.request.message_type == MessageType::GetValue
    }

    // === Public Methods ===

    /// Run the query to completion on the current thread.
    ///
    /// Requests are sent by at most `alpha` worker threads, and every outcome
    /// is processed here, in arrival order.
    pub fn run(
        mut self,
        client: &RpcClient,
        routing_table: &RwLock<RoutingTable>,
        peerstore: &Peerstore,
        deadline: Instant,
    ) -> QueryOutcome {
        self.seed(&routing_table.read().unwrap_or_else(PoisonError::into_inner));

        if self.frontier.is_empty() {
            debug!(target = ?self.target, "No peers to query");
            return QueryOutcome::Exhausted(Vec::new());
        }

        // Dropping the canceller on return abandons all outstanding requests.
        let (ctx, _canceller) = Context::with_deadline(deadline);
        let (jobs_tx, jobs_rx) = flume::unbounded::<PeerId>();
        let (events_tx, events_rx) = flume::unbounded::<Event>();

        let mut workers = 0;
        let mut inflight = 0;

        loop {
            while inflight < self.alpha {
                let Some(peer) = self.next_candidate() else {
                    break;
                };

                self.queried.insert(peer.clone());
                inflight += 1;

                if workers < inflight {
                    match spawn_worker(
                        client.clone(),
                        ctx.clone(),
                        self.request.clone(),
                        jobs_rx.clone(),
                        events_tx.clone(),
                    ) {
                        Ok(()) => workers += 1,
                        Err(error) => warn!(?error, "Failed to spawn query worker"),
                    }
                }

                if workers == 0 {
                    let result = client.send_request(&ctx, &peer, &self.request);
                    let _ = events_tx.send((peer, result));
                } else {
                    let _ = jobs_tx.send(peer);
                }
            }

            if inflight == 0 {
                break;
            }

            match events_rx.recv_deadline(deadline) {
                Ok((peer, result)) => {
                    inflight -= 1;

                    if let Some(found) = self.handle_event(peer, result, routing_table, peerstore)
                    {
                        return QueryOutcome::Found(found);
                    }
                }
                Err(_) => {
                    debug!(target = ?self.target, queried = self.queried.len(), ?inflight, "Query timed out");

                    return QueryOutcome::TimedOut(self.responders.to_vec());
                }
            }
        }

        debug!(
            target = ?self.target,
            queried = self.queried.len(),
            responders = self.responders.len(),
            cut_off = self.cut_off,
            "Done query"
        );

        if self.cut_off > 0 {
            QueryOutcome::TimedOut(self.responders.to_vec())
        } else {
            QueryOutcome::Exhausted(self.responders.to_vec())
        }
    }

    // === Private Methods ===

    fn seed(&mut self, routing_table: &RoutingTable) {
        for peer in routing_table.closest_peers(&self.target, self.k) {
            if peer != self.local {
                self.frontier.add(peer);
            }
        }
    }

    /// Closest candidate not queried yet.
    fn next_candidate(&self) -> Option<PeerId> {
        self.frontier
            .iter()
            .find(|peer| !self.queried.contains(*peer))
            .cloned()
    }

    fn handle_event(
        &mut self,
        peer: PeerId,
        result: Result<Message, RpcError>,
        routing_table: &RwLock<RoutingTable>,
        peerstore: &Peerstore,
    ) -> Option<FoundValue> {
        let reply = match result {
            Ok(reply) => reply,
            Err(error) => {
                if error.is_cut_off() {
                    self.cut_off += 1;
                } else {
                    // Exhausted, make room for candidates behind it.
                    self.frontier.remove(&peer);

                    if let RpcError::Transport(_) = error {
                        peerstore.set_connectedness(&peer, Connectedness::CannotConnect);
                    }
                }

                debug!(?peer, ?error, "Query request failed");
                return None;
            }
        };

        routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .update(&peer);
        peerstore.set_connectedness(&peer, Connectedness::Connected);

        if reply.message_type != self.request.message_type || reply.key != self.request.key {
            debug!(
                ?peer,
                message_type = %reply.message_type,
                key = ?reply.key,
                "Ignoring reply that doesn't match the request"
            );
            self.frontier.remove(&peer);
            return None;
        }

        if self.wants_value() {
            if let Some(value) = reply.found_value() {
                debug!(?peer, target = ?self.target, "Query found value");

                return Some(FoundValue {
                    value: value.clone(),
                    from: peer,
                    near_misses: self.responders.to_vec(),
                });
            }
        }

        let resolved = from_wire_peers(peerstore, &reply.closer_peers);

        for candidate in resolved.peers {
            if candidate != self.local && !self.queried.contains(&candidate) {
                self.frontier.add(candidate);
            }
        }

        self.responders.add(peer);

        None
    }
}

fn spawn_worker(
    client: RpcClient,
    ctx: Context,
    request: Message,
    jobs: Receiver<PeerId>,
    events: Sender<Event>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("kadlookup-query".to_string())
        .spawn(move || {
            while let Ok(peer) = jobs.recv() {
                let result = client.send_request(&ctx, &peer, &request);

                if events.send((peer, result)).is_err() {
                    break;
                }
            }
        })?;

    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::common::{messages::to_wire_peers, Key, Multiaddr, WirePeer};
    use crate::rpc::{Handler, Transport, TransportError};

    use super::*;

    /// Replies to every request from a fixed script, recording the order of requests.
    #[derive(Debug)]
    struct Scripted {
        local: PeerId,
        peerstore: Arc<Peerstore>,
        replies: HashMap<PeerId, Message>,
        /// Peers failing right away, instead of staying silent.
        unreachable: Vec<PeerId>,
        requested: Mutex<Vec<PeerId>>,
    }

    impl Transport for Scripted {
        fn local_peer(&self) -> &PeerId {
            &self.local
        }

        fn listen_addresses(&self) -> Vec<Multiaddr> {
            vec![]
        }

        fn peerstore(&self) -> &Arc<Peerstore> {
            &self.peerstore
        }

        fn dial_peer(&self, _peer: &PeerId) -> Result<(), TransportError> {
            Ok(())
        }

        fn close_peer(&self, _peer: &PeerId) {}

        fn connectedness(&self, _peer: &PeerId) -> Connectedness {
            Connectedness::NotConnected
        }

        fn set_handler(&self, _protocol: &str, _handler: Arc<dyn Handler>) {}

        fn remove_handler(&self, _protocol: &str) {}

        fn request(
            &self,
            ctx: &Context,
            peer: &PeerId,
            _protocol: &str,
            _payload: Bytes,
        ) -> Result<Bytes, TransportError> {
            self.requested.lock().unwrap().push(peer.clone());

            if self.unreachable.contains(peer) {
                return Err(TransportError::Unreachable(peer.clone()));
            }

            match self.replies.get(peer) {
                Some(reply) => Ok(reply.to_bytes().unwrap().into()),
                None => Err(ctx.done()),
            }
        }

        fn send(
            &self,
            _ctx: &Context,
            _peer: &PeerId,
            _protocol: &str,
            _payload: Bytes,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn address(i: usize) -> Multiaddr {
        format!("/ip4/10.0.0.{}/udp/4001", i % 250).parse().unwrap()
    }

    fn run(
        transport: Scripted,
        seed: &[PeerId],
        request: Message,
        alpha: usize,
        timeout: Duration,
    ) -> (QueryOutcome, Arc<Scripted>) {
        run_with_k(transport, seed, request, 20, alpha, timeout)
    }

    fn run_with_k(
        transport: Scripted,
        seed: &[PeerId],
        request: Message,
        k: usize,
        alpha: usize,
        timeout: Duration,
    ) -> (QueryOutcome, Arc<Scripted>) {
        let transport = Arc::new(transport);
        let client = RpcClient::new(transport.clone());

        let mut table = RoutingTable::new(transport.local.clone());
        for peer in seed {
            table.update(peer);
        }
        let table = RwLock::new(table);

        let query = IterativeQuery::new(transport.local.clone(), request, k, alpha);
        let outcome = query.run(
            &client,
            &table,
            &transport.peerstore,
            Instant::now() + timeout,
        );

        (outcome, transport)
    }

    #[test]
    fn dispatches_closest_first() {
        let local = PeerId::random();
        let key = Key::from("ordering");
        let target = key.id();

        let mut peers = (0..10).map(|_| PeerId::random()).collect::<Vec<_>>();

        let request = Message::new(MessageType::GetValue, key.clone(), 0);
        let replies = peers
            .iter()
            .map(|peer| (peer.clone(), request.reply()))
            .collect();

        let transport = Scripted {
            local,
            peerstore: Arc::new(Peerstore::new()),
            replies,
            unreachable: vec![],
            requested: Mutex::new(vec![]),
        };

        let (outcome, transport) = run(transport, &peers, request, 1, Duration::from_secs(5));

        assert!(matches!(outcome, QueryOutcome::Exhausted(ref responders) if responders.len() == 10));

        peers.sort_by_key(|peer| peer.id().xor(&target));
        assert_eq!(*transport.requested.lock().unwrap(), peers);
    }

    #[test]
    fn follows_closer_peers() {
        let local = PeerId::random();
        let key = Key::from("hops");
        let peerstore = Arc::new(Peerstore::new());

        let first = PeerId::random();
        let second = PeerId::random();
        let holder = PeerId::random();

        let request = Message::new(MessageType::GetValue, key.clone(), 0);

        let describe = |peer: &PeerId, i| {
            let store = Peerstore::new();
            store.add_addresses(peer, [address(i)]);
            to_wire_peers(&[peer.clone()], &store, |_| Connectedness::CanConnect)
        };

        let replies = HashMap::from([
            (
                first.clone(),
                request.reply().with_closer_peers(describe(&second, 2)),
            ),
            (
                second.clone(),
                request.reply().with_closer_peers(describe(&holder, 3)),
            ),
            (
                holder.clone(),
                request.reply().with_value(Bytes::from_static(b"value")),
            ),
        ]);

        let transport = Scripted {
            local,
            peerstore: peerstore.clone(),
            replies,
            unreachable: vec![],
            requested: Mutex::new(vec![]),
        };

        let (outcome, transport) = run(transport, &[first.clone()], request, 3, Duration::from_secs(5));

        match outcome {
            QueryOutcome::Found(found) => {
                assert_eq!(found.value, Bytes::from_static(b"value"));
                assert_eq!(found.from, holder);
                assert_eq!(found.near_misses.len(), 2);
                assert!(found.near_misses.contains(&first));
                assert!(found.near_misses.contains(&second));
            }
            outcome => panic!("expected a value, got {outcome:?}"),
        }

        assert_eq!(
            *transport.requested.lock().unwrap(),
            vec![first, second.clone(), holder]
        );
        assert_eq!(peerstore.addresses(&second), vec![address(2)]);
        assert_eq!(peerstore.connectedness(&second), Connectedness::Connected);
    }

    #[test]
    fn mismatched_replies_are_empty() {
        let local = PeerId::random();
        let key = Key::from("strict");
        let peer = PeerId::random();
        let ignored = PeerId::random();

        let request = Message::new(MessageType::GetValue, key, 0);

        // Right type, wrong key, carrying a value and closer peers.
        let wrong_key = Message::new(MessageType::GetValue, Key::from("other"), 0)
            .with_value(Bytes::from_static(b"value"))
            .with_closer_peers(vec![WirePeer {
                id: ignored.clone(),
                addrs: vec![address(1).to_string()],
                connection: Connectedness::Connected,
            }]);

        let transport = Scripted {
            local,
            peerstore: Arc::new(Peerstore::new()),
            replies: HashMap::from([(peer.clone(), wrong_key)]),
            unreachable: vec![],
            requested: Mutex::new(vec![]),
        };

        let (outcome, transport) = run(transport, &[peer.clone()], request, 3, Duration::from_secs(5));

        assert!(matches!(outcome, QueryOutcome::Exhausted(_)));
        assert_eq!(*transport.requested.lock().unwrap(), vec![peer]);
    }

    #[test]
    fn mismatched_type_is_empty() {
        let local = PeerId::random();
        let key = Key::from("strict");
        let peer = PeerId::random();

        let request = Message::new(MessageType::GetValue, key.clone(), 0);
        let ping = Message::new(MessageType::Ping, key, 0).with_value(Bytes::from_static(b"v"));

        let transport = Scripted {
            local,
            peerstore: Arc::new(Peerstore::new()),
            replies: HashMap::from([(peer.clone(), ping)]),
            unreachable: vec![],
            requested: Mutex::new(vec![]),
        };

        let (outcome, _) = run(transport, &[peer], request, 3, Duration::from_secs(5));

        assert!(matches!(outcome, QueryOutcome::Exhausted(_)));
    }

    #[test]
    fn silent_peers_time_out() {
        let transport = Scripted {
            local: PeerId::random(),
            peerstore: Arc::new(Peerstore::new()),
            replies: HashMap::new(),
            unreachable: vec![],
            requested: Mutex::new(vec![]),
        };

        let request = Message::new(MessageType::GetValue, Key::from("silent"), 0);

        let (outcome, _) = run(
            transport,
            &[PeerId::random()],
            request,
            3,
            Duration::from_millis(10),
        );

        assert!(matches!(outcome, QueryOutcome::TimedOut(_)));
    }

    #[test]
    fn find_node_collects_responders() {
        let local = PeerId::random();
        let peers = (0..5).map(|_| PeerId::random()).collect::<Vec<_>>();

        let request = Message::new(MessageType::FindNode, Key::from(&local), 0);

        let replies = peers
            .iter()
            .map(|peer| (peer.clone(), request.reply().with_value(Bytes::from_static(b"x"))))
            .collect();

        let transport = Scripted {
            local,
            peerstore: Arc::new(Peerstore::new()),
            replies,
            unreachable: vec![],
            requested: Mutex::new(vec![]),
        };

        let (outcome, _) = run(transport, &peers, request, 3, Duration::from_secs(5));

        match outcome {
            QueryOutcome::Exhausted(responders) => assert_eq!(responders.len(), 5),
            outcome => panic!("expected responders, got {outcome:?}"),
        }
    }

    #[test]
    fn unreachable_peers_free_their_slot() {
        let local = PeerId::random();
        let key = Key::from("crowded");
        let target = key.id();

        let mut peers = (0..3).map(|_| PeerId::random()).collect::<Vec<_>>();
        peers.sort_by_key(|peer| peer.id().xor(&target));
        let (unreachable, pointer, holder) = (peers[0].clone(), peers[1].clone(), peers[2].clone());

        let request = Message::new(MessageType::GetValue, key, 0);

        let store = Peerstore::new();
        store.add_addresses(&holder, [address(3)]);
        let describe_holder = to_wire_peers(&[holder.clone()], &store, |_| Connectedness::CanConnect);

        let transport = Scripted {
            local,
            peerstore: Arc::new(Peerstore::new()),
            replies: HashMap::from([
                (
                    pointer.clone(),
                    request.reply().with_closer_peers(describe_holder),
                ),
                (
                    holder.clone(),
                    request.reply().with_value(Bytes::from_static(b"value")),
                ),
            ]),
            unreachable: vec![unreachable.clone()],
            requested: Mutex::new(vec![]),
        };

        // Only two slots, the holder is farther than both seeds.
        let (outcome, transport) = run_with_k(
            transport,
            &[unreachable.clone(), pointer.clone()],
            request,
            2,
            1,
            Duration::from_secs(5),
        );

        match outcome {
            QueryOutcome::Found(found) => {
                assert_eq!(found.from, holder);
                assert_eq!(found.near_misses, vec![pointer.clone()]);
            }
            outcome => panic!("expected a value, got {outcome:?}"),
        }

        assert_eq!(
            *transport.requested.lock().unwrap(),
            vec![unreachable.clone(), pointer, holder]
        );
        assert_eq!(
            transport.peerstore.connectedness(&unreachable),
            Connectedness::CannotConnect
        );
    }
}
