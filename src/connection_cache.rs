use std::{collections::HashMap, future::Future, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::AdapterError;

/// A live connection that can be shared between transfers and shut down
/// when the batch ends.
#[async_trait]
pub trait PooledConnection: Send + Sync + 'static {
    async fn close(self: Arc<Self>);
}

/// Lock-protected cache of one connection per key (host or bucket).
///
/// Created at batch start by whoever builds the adapters, and closed at batch
/// end through [`ConnectionCache::close_all`].
pub struct ConnectionCache<C: PooledConnection> {
    connections: Mutex<HashMap<String, Arc<C>>>,
}

impl<C: PooledConnection> Default for ConnectionCache<C> {
    fn default() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }
}

impl<C: PooledConnection> ConnectionCache<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached connection for `key`, or establishes one with `connect`.
    /// A failed connect is not cached.
    pub async fn get_or_connect<F, Fut>(&self, key: &str, connect: F) -> Result<Arc<C>, AdapterError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, AdapterError>>,
    {
        let mut connections = self.connections.lock().await;
        if let Some(existing) = connections.get(key) {
            return Ok(Arc::clone(existing));
        }
        tracing::debug!("Opening new connection for {}", key);
        let connection = Arc::new(connect().await?);
        connections.insert(key.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Drops a connection that turned out to be broken, so the next caller reconnects.
    pub async fn evict(&self, key: &str) {
        let removed = self.connections.lock().await.remove(key);
        if let Some(connection) = removed {
            tracing::debug!("Evicting connection for {}", key);
            connection.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes and forgets every cached connection.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<C>)> = self.connections.lock().await.drain().collect();
        for (key, connection) in drained {
            tracing::debug!("Closing connection for {}", key);
            connection.close().await;
        }
    }
}
