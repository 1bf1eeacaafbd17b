//! Builder pattern for connection configuration.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use websocket_recovery::{Connection, ReconnectionConfig, WebSocketTransport};
//!
//! # fn example() -> websocket_recovery::Result<()> {
//! let connection = Connection::builder("feed", "wss://example.com/feed", Arc::new(WebSocketTransport::new()))
//!     .config(ReconnectionConfig::new().with_max_attempts(5))
//!     .on_message(|id, message| println!("{id}: {message}"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::transport::Transport;

use super::callbacks::Callbacks;
use super::config::{HeartbeatConfig, ReconnectionConfig};
use super::core::Connection;

// ============================================================================
// ConnectionOptions
// ============================================================================

/// Everything about a connection except its identity and transport.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Recovery settings.
    pub config: ReconnectionConfig,
    /// Liveness settings.
    pub heartbeat: HeartbeatConfig,
    /// Event handlers.
    pub callbacks: Callbacks,
}

impl ConnectionOptions {
    /// Creates default options.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the reconnection config.
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: ReconnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the heartbeat config.
    #[inline]
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Validates both configs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either config is invalid.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        self.heartbeat.validate()
    }
}

// ============================================================================
// ConnectionBuilder
// ============================================================================

/// Builder for a [`Connection`].
///
/// Use [`Connection::builder()`] to create one.
pub struct ConnectionBuilder {
    id: ConnectionId,
    url: String,
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
}

impl ConnectionBuilder {
    pub(crate) fn new(
        id: impl Into<ConnectionId>,
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            transport,
            options: ConnectionOptions::default(),
        }
    }

    /// Sets the reconnection config.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: ReconnectionConfig) -> Self {
        self.options.config = config;
        self
    }

    /// Sets the heartbeat config.
    #[inline]
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.options.heartbeat = heartbeat;
        self
    }

    /// Replaces all options at once.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the connect handler.
    #[must_use]
    pub fn on_connect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionId) + Send + Sync + 'static,
    {
        self.options.callbacks.on_connect = Some(Arc::new(handler));
        self
    }

    /// Sets the disconnect handler.
    #[must_use]
    pub fn on_disconnect<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionId, &str) + Send + Sync + 'static,
    {
        self.options.callbacks.on_disconnect = Some(Arc::new(handler));
        self
    }

    /// Sets the inbound message handler.
    #[must_use]
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionId, &Value) + Send + Sync + 'static,
    {
        self.options.callbacks.on_message = Some(Arc::new(handler));
        self
    }

    /// Sets the error handler.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConnectionId, &Error) + Send + Sync + 'static,
    {
        self.options.callbacks.on_error = Some(Arc::new(handler));
        self
    }

    /// Builds the connection in `Disconnected` state.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the ID is empty or a config is invalid
    /// - [`Error::Config`] if the URL does not parse
    pub fn build(self) -> Result<Connection> {
        if self.id.as_str().is_empty() {
            return Err(Error::config("connection id must not be empty"));
        }

        Url::parse(&self.url)
            .map_err(|e| Error::config(format!("invalid url '{}': {e}", self.url)))?;

        self.options.validate()?;

        Ok(Connection::new(self.id, self.url, self.transport, self.options))
    }
}

// ============================================================================
// Tests
// ============================================================================
