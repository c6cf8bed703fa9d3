use std::sync::Arc;
use std::time::Duration;

use crate::common::MAX_BUCKET_SIZE_K;
use crate::server::{Datastore, MAX_VALUES};

/// Default number of concurrent requests per query.
pub const DEFAULT_ALPHA: usize = 3;
/// Default timeout of requests that are not part of a query, like cache forwarding.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Bucket size, and the number of closest peers a query keeps track of.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Maximum number of outstanding requests of a single query.
    ///
    /// Defaults to [DEFAULT_ALPHA]
    pub alpha: usize,
    /// Cluster level set on every outgoing message.
    ///
    /// Defaults to 0
    pub cluster_level: u32,
    /// Whether to send a found value to the closest peer that replied without it.
    ///
    /// Defaults to true
    pub cache_forward: bool,
    /// Timeout of one-off requests outside of a caller-given deadline.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Maximum number of values kept by the default store.
    ///
    /// Defaults to [MAX_VALUES]
    pub max_values: usize,
    /// Storage of values this node serves.
    ///
    /// Defaults to None, where a [crate::server::MemoryStore] of
    /// [Self::max_values] capacity is used.
    pub store: Option<Arc<dyn Datastore>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: MAX_BUCKET_SIZE_K,
            alpha: DEFAULT_ALPHA,
            cluster_level: 0,
            cache_forward: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_values: MAX_VALUES,
            store: None,
        }
    }
}
