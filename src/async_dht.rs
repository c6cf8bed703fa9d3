//! AsyncDht node.

use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::common::{Key, PeerId};
use crate::dht::{Dht, QueryError};
use crate::rpc::{FoundValue, Info};
use crate::Error;

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
///
/// Every query runs on its own thread, and is awaited through a channel.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Returns the blocking [Dht] behind this node.
    pub fn as_sync(&self) -> &Dht {
        &self.0
    }

    /// Information and statistics about this node.
    pub fn info(&self) -> Info {
        self.0.info()
    }

    // === Public Methods ===

    pub fn start(&self) {
        self.0.start()
    }

    pub fn shutdown(&self) {
        self.0.shutdown()
    }

    /// See [Dht::get_value].
    pub async fn get_value(&self, key: Key, timeout: Duration) -> Result<Bytes, QueryError> {
        self.spawn(move |dht| dht.get_value(&key, timeout)).await
    }

    /// See [Dht::lookup_value].
    pub async fn lookup_value(
        &self,
        key: Key,
        timeout: Duration,
    ) -> Result<FoundValue, QueryError> {
        self.spawn(move |dht| dht.lookup_value(&key, timeout)).await
    }

    /// See [Dht::put_value].
    pub async fn put_value(
        &self,
        key: Key,
        value: Bytes,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, QueryError> {
        self.spawn(move |dht| dht.put_value(key, value, timeout))
            .await
    }

    /// See [Dht::find_closest_peers].
    pub async fn find_closest_peers(
        &self,
        key: Key,
        timeout: Duration,
    ) -> Result<Vec<PeerId>, QueryError> {
        self.spawn(move |dht| dht.find_closest_peers(&key, timeout))
            .await
    }

    /// See [Dht::ping].
    pub async fn ping(&self, peer: PeerId, timeout: Duration) -> Result<Duration, QueryError> {
        self.spawn(move |dht| dht.ping(&peer, timeout)).await
    }

    // === Private Methods ===

    async fn spawn<T, F>(&self, f: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce(Dht) -> Result<T, QueryError> + Send + 'static,
    {
        let (sender, receiver) = flume::bounded::<Result<T, QueryError>>(1);
        let dht = self.0.clone();

        thread::Builder::new()
            .name("kadlookup-async".to_string())
            .spawn(move || {
                let _ = sender.send(f(dht));
            })
            .map_err(Error::IO)?;

        receiver
            .recv_async()
            .await
            .unwrap_or(Err(QueryError::Shutdown))
    }
}

#[cfg(test)]
mod test {
    use crate::dht::Testnet;

    use super::*;

    #[test]
    fn shutdown() {
        async fn test() {
            let testnet = Testnet::new(2).unwrap();

            let dht = testnet.nodes[1].clone().as_async();
            let a = dht.clone();

            dht.shutdown();

            let result = a.get_value(Key::from("key"), Duration::from_secs(1)).await;

            assert!(matches!(result, Err(QueryError::Shutdown)))
        }
        futures::executor::block_on(test());
    }

    #[test]
    fn put_get_value() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let a = testnet.nodes[1].clone().as_async();
            let b = testnet.nodes[2].clone().as_async();

            let key = Key::from("async");
            let value = Bytes::from_static(b"value");

            a.put_value(key.clone(), value.clone(), Duration::from_secs(5))
                .await
                .expect("failed to put");

            let found = b
                .get_value(key, Duration::from_secs(5))
                .await
                .expect("failed to get");

            assert_eq!(found, value);
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn concurrent_get_value() {
        async fn test() {
            let testnet = Testnet::new(10).unwrap();

            let key = Key::from("concurrent");
            testnet.nodes[4]
                .put_value(key.clone(), Bytes::from_static(b"value"), Duration::from_secs(5))
                .unwrap();

            let getters = testnet.nodes[5..]
                .iter()
                .map(|node| node.clone().as_async())
                .collect::<Vec<_>>();

            let results = futures::future::join_all(
                getters
                    .iter()
                    .map(|dht| dht.get_value(key.clone(), Duration::from_secs(5))),
            )
            .await;

            for result in results {
                assert_eq!(result.unwrap(), Bytes::from_static(b"value"));
            }
        }

        futures::executor::block_on(test());
    }

    #[test]
    fn ping_and_find() {
        async fn test() {
            let testnet = Testnet::new(5).unwrap();

            let dht = testnet.nodes[1].clone().as_async();
            let bootstrap = testnet.nodes[0].local().clone();

            dht.ping(bootstrap, Duration::from_secs(1)).await.unwrap();

            let closest = dht
                .find_closest_peers(Key::from("target"), Duration::from_secs(5))
                .await
                .unwrap();

            assert_eq!(closest.len(), 4);
            assert_eq!(dht.info().routing_table_size(), 4);
        }

        futures::executor::block_on(test());
    }
}
