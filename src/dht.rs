//! Dht node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::common::{Connectedness, Key, Message, MessageType, Multiaddr, PeerId, RoutingTable};
use crate::rpc::{
    Config, Context, FoundValue, Info, IterativeQuery, MemoryNetwork, QueryOutcome, RpcClient,
    RpcError, Transport, PROTOCOL_ID,
};
use crate::server::{Datastore, MemoryStore, RequestHandler};
use crate::{Error, Peerstore};

/// Longest timeout honored by queries, longer ones are capped.
const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
/// Kademlia DHT node.
///
/// Cheap to clone, all clones share the same state.
pub struct Dht(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    config: Config,
    routing_table: Arc<RwLock<RoutingTable>>,
    client: RpcClient,
    store: Arc<dyn Datastore>,
    handler: Arc<RequestHandler>,
    serving: AtomicBool,
    shut_down: AtomicBool,
}

#[derive(Debug, Default, Clone)]
/// Create a Dht node.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set the bucket size, and the number of closest peers a query keeps track of.
    pub fn k(mut self, k: usize) -> Self {
        self.0.k = k;

        self
    }

    /// Set the maximum number of outstanding requests of a single query.
    pub fn alpha(mut self, alpha: usize) -> Self {
        self.0.alpha = alpha;

        self
    }

    /// Set the cluster level of outgoing messages.
    pub fn cluster_level(mut self, level: u32) -> Self {
        self.0.cluster_level = level;

        self
    }

    /// Send found values to the closest peer that replied without it.
    pub fn cache_forward(mut self, cache_forward: bool) -> Self {
        self.0.cache_forward = cache_forward;

        self
    }

    /// Set the timeout of one-off requests outside of a caller-given deadline.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.0.request_timeout = request_timeout;

        self
    }

    /// Set the capacity of the default in-memory store.
    pub fn max_values(mut self, max_values: usize) -> Self {
        self.0.max_values = max_values;

        self
    }

    /// Use a custom [Datastore] for served values.
    pub fn store(mut self, store: Arc<dyn Datastore>) -> Self {
        self.0.store = Some(store);

        self
    }

    /// Create a Dht node over `transport`, see [Dht::new].
    pub fn build(self, transport: Arc<dyn Transport>) -> Result<Dht, Error> {
        Dht::new(transport, self.0)
    }
}

impl Dht {
    /// Create a new Dht node over `transport`.
    ///
    /// The node can query others right away, but only answers their requests
    /// after [Self::start].
    pub fn new(transport: Arc<dyn Transport>, mut config: Config) -> Result<Self, Error> {
        let local = transport.local_peer().clone();

        if local.is_empty() {
            return Err(Error::InvalidLocalIdentity("empty peer id"));
        }

        config.k = config.k.max(1);
        config.alpha = config.alpha.max(1);

        let routing_table = Arc::new(RwLock::new(
            RoutingTable::new(local).with_bucket_size(config.k),
        ));

        let store = config
            .store
            .take()
            .unwrap_or_else(|| Arc::new(MemoryStore::new(config.max_values)));

        let handler = Arc::new(RequestHandler::new(
            config.k,
            routing_table.clone(),
            store.clone(),
            &transport,
        ));

        Ok(Dht(Arc::new(Inner {
            config,
            routing_table,
            client: RpcClient::new(transport),
            store,
            handler,
            serving: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })))
    }

    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    /// This node's identity.
    pub fn local(&self) -> &PeerId {
        self.transport().local_peer()
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        self.0.client.transport()
    }

    pub fn peerstore(&self) -> &Arc<Peerstore> {
        self.transport().peerstore()
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.0.store
    }

    /// Returns a snapshot of the routing table.
    pub fn routing_table(&self) -> RoutingTable {
        self.0
            .routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Info {
        let routing_table_size = self
            .0
            .routing_table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .size();

        Info {
            local: self.local().clone(),
            id: self.local().id(),
            listen_addresses: self.transport().listen_addresses(),
            routing_table_size,
            known_peers: self.peerstore().len(),
            running: self.0.serving.load(Ordering::Relaxed),
        }
    }

    // === Public Methods ===

    /// Start answering requests from other peers.
    pub fn start(&self) {
        if self.0.shut_down.load(Ordering::Relaxed) {
            warn!(local = ?self.local(), "Can't start a Dht node that was shut down");
            return;
        }

        if !self.0.serving.swap(true, Ordering::Relaxed) {
            self.transport()
                .set_handler(PROTOCOL_ID, self.0.handler.clone());

            info!(local = ?self.local(), addresses = ?self.transport().listen_addresses(), "Dht node started");
        }
    }

    /// Stop answering requests, and fail every later query with [QueryError::Shutdown].
    pub fn shutdown(&self) {
        if self.0.shut_down.swap(true, Ordering::Relaxed) {
            return;
        }

        if self.0.serving.swap(false, Ordering::Relaxed) {
            self.transport().remove_handler(PROTOCOL_ID);
        }

        info!(local = ?self.local(), "Dht node shut down");
    }

    /// Record `peer` as reachable in the routing table.
    ///
    /// Returns `false` if it is this node, or if its bucket is full.
    pub fn update(&self, peer: &PeerId) -> bool {
        self.0
            .routing_table
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .update(peer)
    }

    /// Register addresses of `peer` and add it to the routing table.
    pub fn add_peer<I>(&self, peer: &PeerId, addresses: I) -> bool
    where
        I: IntoIterator<Item = Multiaddr>,
    {
        self.peerstore().add_addresses(peer, addresses);

        self.update(peer)
    }

    // === Values ===

    /// Look up the value stored under `key`.
    ///
    /// Returns [QueryError::NotFound] if every reachable peer close to the key
    /// answered without it, and [QueryError::Timeout] if `timeout` passed first.
    pub fn get_value(&self, key: &Key, timeout: Duration) -> Result<Bytes, QueryError> {
        self.lookup_value(key, timeout).map(|found| found.value)
    }

    /// Same as [Self::get_value], but also returns where the value came from.
    pub fn lookup_value(&self, key: &Key, timeout: Duration) -> Result<FoundValue, QueryError> {
        self.check_running()?;

        let request = self.message(MessageType::GetValue, key.clone());

        match self.run_query(request, deadline(timeout)) {
            QueryOutcome::Found(found) => {
                if self.0.config.cache_forward {
                    self.cache_forward(key, &found);
                }

                Ok(found)
            }
            QueryOutcome::Exhausted(_) => Err(QueryError::NotFound),
            QueryOutcome::TimedOut(_) => Err(QueryError::Timeout),
        }
    }

    /// Store a value locally and on the closest peers to `key`.
    ///
    /// Returns the peers that accepted the value.
    pub fn put_value(
        &self,
        key: Key,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, QueryError> {
        if value.is_empty() {
            return Err(Error::EmptyValue.into());
        }

        self.check_running()?;

        self.0.store.put(key.clone(), value.clone());

        let deadline = deadline(timeout);

        let closest = match self.run_query(self.message(MessageType::FindNode, key.clone()), deadline)
        {
            QueryOutcome::Exhausted(closest) | QueryOutcome::TimedOut(closest) => closest,
            QueryOutcome::Found(_) => Vec::new(),
        };

        let (ctx, _canceller) = if Instant::now() < deadline {
            Context::with_deadline(deadline)
        } else {
            Context::with_timeout(self.0.config.request_timeout)
        };

        let message = self
            .message(MessageType::PutValue, key)
            .with_value(value);

        let client = &self.0.client;

        let stored = thread::scope(|scope| {
            let (sender, receiver) = flume::unbounded();

            for peer in &closest {
                let sender = sender.clone();
                let (ctx, message) = (&ctx, &message);

                let spawned = thread::Builder::new()
                    .name("kadlookup-put".to_string())
                    .spawn_scoped(scope, move || {
                        let _ = sender.send((peer, client.send_request(ctx, peer, message)));
                    });

                if let Err(error) = spawned {
                    warn!(?error, "Failed to spawn put thread");
                }
            }

            drop(sender);

            receiver
                .iter()
                .filter_map(|(peer, result)| match result {
                    Ok(reply) if reply.message_type == MessageType::PutValue => Some(peer.clone()),
                    Ok(reply) => {
                        debug!(?peer, message_type = %reply.message_type, "Unexpected reply to PUT_VALUE");
                        None
                    }
                    Err(error) => {
                        debug!(?peer, ?error, "Failed to put value");
                        None
                    }
                })
                .collect::<Vec<_>>()
        });

        debug!(stored = stored.len(), closest = closest.len(), "Put value");

        Ok(stored)
    }

    // === Peers ===

    /// Find the closest responding peers to `key`.
    ///
    /// If `timeout` passes, returns the closest responders so far, or
    /// [QueryError::Timeout] if none responded.
    pub fn find_closest_peers(
        &self,
        key: &Key,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, QueryError> {
        self.check_running()?;

        let request = self.message(MessageType::FindNode, key.clone());

        match self.run_query(request, deadline(timeout)) {
            QueryOutcome::Exhausted(closest) => Ok(closest),
            QueryOutcome::TimedOut(closest) if !closest.is_empty() => Ok(closest),
            QueryOutcome::TimedOut(_) => Err(QueryError::Timeout),
            QueryOutcome::Found(_) => Ok(Vec::new()),
        }
    }

    /// Send a PING to `peer`, returning the round trip time.
    pub fn ping(&self, peer: &PeerId, timeout: Duration) -> Result<Duration, QueryError> {
        self.check_running()?;

        let (ctx, _canceller) = Context::with_deadline(deadline(timeout));
        let request = self.message(MessageType::Ping, Key::default());

        let start = Instant::now();

        match self.0.client.send_request(&ctx, peer, &request) {
            Ok(reply) if reply.message_type == MessageType::Ping => {
                self.update(peer);
                self.peerstore()
                    .set_connectedness(peer, Connectedness::Connected);

                Ok(start.elapsed())
            }
            Ok(reply) => Err(QueryError::Rpc(RpcError::Malformed(Error::MalformedMessage(
                format!("{} reply to PING", reply.message_type),
            )))),
            Err(error) if error.is_cut_off() => Err(QueryError::Timeout),
            Err(error) => {
                if let RpcError::Transport(_) = error {
                    self.peerstore()
                        .set_connectedness(peer, Connectedness::CannotConnect);
                }

                Err(error.into())
            }
        }
    }

    // === Private Methods ===

    fn check_running(&self) -> Result<(), QueryError> {
        if self.0.shut_down.load(Ordering::Relaxed) {
            return Err(QueryError::Shutdown);
        }

        Ok(())
    }

    fn message(&self, message_type: MessageType, key: Key) -> Message {
        Message::new(message_type, key, self.0.config.cluster_level)
    }

    fn run_query(&self, request: Message, deadline: Instant) -> QueryOutcome {
        IterativeQuery::new(
            self.local().clone(),
            request,
            self.0.config.k,
            self.0.config.alpha,
        )
        .run(
            &self.0.client,
            &self.0.routing_table,
            self.peerstore(),
            deadline,
        )
    }

    /// Best effort PUT_VALUE of a found value to the closest peer that didn't have it.
    fn cache_forward(&self, key: &Key, found: &FoundValue) {
        let Some(peer) = found.near_misses.first().cloned() else {
            return;
        };

        let client = self.0.client.clone();
        let timeout = self.0.config.request_timeout;
        let message = self
            .message(MessageType::PutValue, key.clone())
            .with_value(found.value.clone());

        let spawned = thread::Builder::new()
            .name("kadlookup-cache".to_string())
            .spawn(move || {
                let (ctx, _canceller) = Context::with_timeout(timeout);

                match client.send_message(&ctx, &peer, &message) {
                    Ok(()) => debug!(?peer, "Forwarded value to near miss"),
                    Err(error) => debug!(?peer, ?error, "Failed to forward value"),
                }
            });

        if let Err(error) = spawned {
            warn!(?error, "Failed to spawn cache forwarding thread");
        }
    }
}

fn deadline(timeout: Duration) -> Instant {
    Instant::now() + timeout.min(MAX_TIMEOUT)
}

#[derive(thiserror::Error, Debug)]
/// Errors of [Dht] operations.
pub enum QueryError {
    /// Every reachable peer close to the key answered without a value.
    #[error("Value not found")]
    NotFound,

    /// The timeout passed before the query could finish.
    #[error("Query timed out")]
    Timeout,

    #[error("Dht was shutdown")]
    Shutdown,

    #[error(transparent)]
    Invalid(#[from] Error),

    /// Failure of a single peer request, only returned by [Dht::ping].
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Create a testnet of Dht nodes in memory, to run tests against instead of a real network.
#[derive(Debug)]
pub struct Testnet {
    pub network: MemoryNetwork,
    pub nodes: Vec<Dht>,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet, Error> {
        Self::with_builder(count, Dht::builder)
    }

    /// Create `count` nodes from builders returned by `builder`.
    ///
    /// The first node knows every other node, and every other node knows it.
    pub fn with_builder<F>(count: usize, builder: F) -> Result<Testnet, Error>
    where
        F: Fn() -> DhtBuilder,
    {
        let network = MemoryNetwork::new();
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);

        for _ in 0..count {
            let node = builder().build(network.transport(PeerId::random()))?;
            node.start();

            nodes.push(node);
        }

        if let Some((bootstrap, rest)) = nodes.split_first() {
            for node in rest {
                bootstrap.add_peer(node.local(), node.transport().listen_addresses());
                node.add_peer(bootstrap.local(), bootstrap.transport().listen_addresses());
            }
        }

        Ok(Self { network, nodes })
    }

    /// The node every other node was seeded with.
    pub fn bootstrap(&self) -> Option<&Dht> {
        self.nodes.first()
    }
}
