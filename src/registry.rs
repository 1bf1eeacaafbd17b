//! Registry of named connections.
//!
//! Holds at most one live [`Connection`] per [`ConnectionId`]. Creating a
//! connection under an existing ID tears the old one down first.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectionRegistry             │
//! │  transport + default options             │
//! │  ┌────────────────────────────────────┐  │
//! │  │ "feed"   → Connection (Connected)  │  │
//! │  │ "orders" → Connection (Reconnect.) │  │
//! │  │ "audit"  → Connection (Failed)     │  │
//! │  └────────────────────────────────────┘  │
//! └──────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

use crate::connection::{Connection, ConnectionOptions, ConnectionStatus, ReconnectionConfig};
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::Transport;

// ============================================================================
// ConnectionRegistry
// ============================================================================

/// Creates, tracks and recovers connections by ID.
///
/// Constructed explicitly and shared as `Arc`.
///
/// # Example
///
/// ```ignore
/// let registry = ConnectionRegistry::new(Arc::new(WebSocketTransport::new()));
///
/// let feed = registry.create_connection("feed", "wss://example.com/feed", None).await?;
/// feed.connect().await;
///
/// let results = registry.recover_all_connections().await;
/// registry.cleanup_all().await;
/// ```
pub struct ConnectionRegistry {
    /// Transport shared by every connection.
    transport: Arc<dyn Transport>,

    /// Options for connections created without explicit ones.
    defaults: ConnectionOptions,

    /// Live connections by ID.
    connections: RwLock<FxHashMap<ConnectionId, Connection>>,

    /// Serializes create/remove/cleanup across teardown awaits.
    lifecycle: AsyncMutex<()>,
}

// ============================================================================
// ConnectionRegistry - Constructor
// ============================================================================

impl ConnectionRegistry {
    /// Creates an empty registry with default connection options.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_defaults(transport, ConnectionOptions::default())
    }

    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `transport` - Transport used to open every connection
    /// * `defaults` - Options applied when a call does not pass its own
    #[must_use]
    pub fn with_defaults(transport: Arc<dyn Transport>, defaults: ConnectionOptions) -> Arc<Self> {
        Arc::new(Self {
            transport,
            defaults,
            connections: RwLock::new(FxHashMap::default()),
            lifecycle: AsyncMutex::new(()),
        })
    }
}

// ============================================================================
// ConnectionRegistry - Public API
// ============================================================================

impl ConnectionRegistry {
    /// Creates and registers a connection. Does not connect it.
    ///
    /// An existing connection with the same ID is disconnected and replaced.
    ///
    /// # Arguments
    ///
    /// * `id` - Connection ID
    /// * `url` - Remote URL
    /// * `config` - Reconnection settings, or `None` for the registry default
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL or config is invalid. The
    /// existing connection is left untouched in that case.
    pub async fn create_connection(
        &self,
        id: impl Into<ConnectionId>,
        url: impl Into<String>,
        config: Option<ReconnectionConfig>,
    ) -> Result<Connection> {
        let mut options = self.defaults.clone();
        if let Some(config) = config {
            options.config = config;
        }
        self.create_connection_with(id, url, options).await
    }

    /// Creates and registers a connection with full options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL or options are invalid.
    pub async fn create_connection_with(
        &self,
        id: impl Into<ConnectionId>,
        url: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Connection> {
        let id = id.into();
        let _guard = self.lifecycle.lock().await;

        let connection = Connection::builder(id.clone(), url, Arc::clone(&self.transport))
            .options(options)
            .build()?;

        let previous = self.connections.write().remove(&id);
        if let Some(previous) = previous {
            info!(connection_id = %id, "Replacing existing connection");
            previous.disconnect("replaced").await;
        }

        self.connections.write().insert(id.clone(), connection.clone());
        debug!(connection_id = %id, url = %connection.url(), "Connection registered");

        Ok(connection)
    }

    /// Disconnects and unregisters a connection.
    ///
    /// Returns `false` if no connection has this ID.
    pub async fn remove_connection(&self, id: &ConnectionId) -> bool {
        let _guard = self.lifecycle.lock().await;

        let removed = self.connections.write().remove(id);
        match removed {
            Some(connection) => {
                connection.disconnect("removed").await;
                info!(connection_id = %id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Returns the connection registered under `id`.
    #[must_use]
    pub fn get_connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.read().get(id).cloned()
    }

    /// Connects every `Disconnected` or `Failed` connection concurrently.
    ///
    /// Returns, per ID, whether the connection is up afterwards. A failing
    /// or panicking connect only affects its own entry.
    pub async fn recover_all_connections(&self) -> FxHashMap<ConnectionId, bool> {
        let snapshot = self.snapshot();
        let mut results = FxHashMap::default();
        let mut tasks = Vec::new();

        for connection in snapshot {
            let id = connection.id().clone();
            if connection.state().is_recoverable() {
                tasks.push((id, tokio::spawn(async move { connection.connect().await })));
            } else {
                results.insert(id, connection.is_connected());
            }
        }

        let attempted = tasks.len();
        for (id, task) in tasks {
            let recovered = match task.await {
                Ok(recovered) => recovered,
                Err(e) => {
                    error!(connection_id = %id, error = %e, "Recovery task failed");
                    false
                }
            };
            results.insert(id, recovered);
        }

        let recovered = results.values().filter(|ok| **ok).count();
        info!(attempted, recovered, total = results.len(), "Recovery sweep finished");

        results
    }

    /// Returns the status of one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if no connection has this ID.
    pub fn get_status(&self, id: &ConnectionId) -> Result<ConnectionStatus> {
        self.connections
            .read()
            .get(id)
            .map(Connection::status)
            .ok_or_else(|| Error::connection_not_found(id.clone()))
    }

    /// Returns the status of every connection.
    #[must_use]
    pub fn get_all_status(&self) -> FxHashMap<ConnectionId, ConnectionStatus> {
        self.connections
            .read()
            .iter()
            .map(|(id, connection)| (id.clone(), connection.status()))
            .collect()
    }

    /// Disconnects and unregisters every connection.
    pub async fn cleanup_all(&self) {
        let _guard = self.lifecycle.lock().await;

        let drained: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        let count = drained.len();

        join_all(drained.iter().map(|connection| connection.disconnect("cleanup"))).await;

        info!(count, "All connections cleaned up");
    }

    /// Returns the number of registered connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Returns the registered IDs.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }
}

// ============================================================================
// ConnectionRegistry - Internal
// ============================================================================

impl ConnectionRegistry {
    fn snapshot(&self) -> Vec<Connection> {
        self.connections.read().values().cloned().collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
