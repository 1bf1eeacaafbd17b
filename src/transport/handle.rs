//! Transport capability traits.
//!
//! The recovery layer never touches sockets directly. It opens handles
//! through an injected [`Transport`] and drives them through
//! [`TransportHandle`].

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

// ============================================================================
// Transport
// ============================================================================

/// Factory for transport handles.
///
/// Implementations should not apply their own timeout; the connection
/// bounds `open` by its configured timeout.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a new handle to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Connection`] if the handshake fails.
    async fn open(&self, url: &str) -> Result<Arc<dyn TransportHandle>>;
}

// ============================================================================
// TransportHandle
// ============================================================================

/// An open, bidirectional text-frame channel.
///
/// `send` and `receive` must be callable concurrently: the inbound loop
/// parks in `receive` while other tasks send.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Writes one text frame.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the frame cannot be written.
    async fn send(&self, frame: String) -> Result<()>;

    /// Reads the next text frame.
    ///
    /// # Errors
    ///
    /// Returns a transport error, or [`crate::Error::ConnectionClosed`] when
    /// the remote end closes.
    async fn receive(&self) -> Result<String>;

    /// Closes the handle. Best effort.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails; callers only log it.
    async fn close(&self) -> Result<()>;
}
