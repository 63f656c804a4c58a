//! Single-flight memoization of asynchronous operations.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

type SharedOp<V> = Shared<BoxFuture<'static, std::result::Result<Arc<V>, Arc<Error>>>>;

/// A map from key to a single shared in-flight (or completed) operation.
///
/// The first caller for a key starts the operation; late joiners attach to
/// the same future instead of racing to start a duplicate. Results are
/// retained for the lifetime of the map, including failures, so every caller
/// for a key observes the same outcome.
pub struct SingleFlight<K, V> {
    inner: Mutex<HashMap<K, SharedOp<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Send + Sync + 'static,
{
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the memoized result for `key`, running `operation` exactly
    /// once per key to produce it.
    pub async fn get_or_run<F, Fut>(&self, key: K, operation: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let op = {
            let mut map = self.inner.lock().unwrap();
            if let Some(existing) = map.get(&key) {
                existing.clone()
            } else {
                let op = operation()
                    .map(|result| result.map(Arc::new).map_err(Arc::new))
                    .boxed()
                    .shared();
                map.insert(key, op.clone());
                op
            }
        };

        op.await.map_err(Error::Shared)
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
