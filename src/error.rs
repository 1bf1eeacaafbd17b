//! Error types for websocket-recovery.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use websocket_recovery::{Error, Result, SendOutcome};
//!
//! async fn example(connection: &Connection) -> Result<()> {
//!     match connection.send(json!({ "text": "hi" }), true).await {
//!         Ok(SendOutcome::Sent(id)) => println!("sent {id}"),
//!         Ok(SendOutcome::Queued(id)) => println!("queued {id}"),
//!         Err(Error::Capacity { limit }) => println!("queue full ({limit})"),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants | Handling |
//! |----------|----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidMessage`] | Returned to caller |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`] | Failed open, fails or retries connect |
//! | Transport | [`Error::Transport`], [`Error::ConnectionClosed`], [`Error::WebSocket`] | Drives reconnection |
//! | Liveness | [`Error::HeartbeatTimeout`] | Drives reconnection |
//! | Delivery | [`Error::Capacity`] | Returned from `send()` |
//! | Decoding | [`Error::Decode`], [`Error::Json`] | Logged, frame skipped |
//! | Registry | [`Error::ConnectionNotFound`] | Returned to caller |

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::ConnectionId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a connection config or URL is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Outbound message cannot be tracked.
    ///
    /// Returned when `send()` receives something other than a JSON object.
    #[error("Invalid message: {message}")]
    InvalidMessage {
        /// Description of the problem.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport could not be opened.
    ///
    /// Returned when the handshake or socket open fails.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Transport did not open within the configured timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Connection closed by the remote end or the transport.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Send or receive failed on an established connection.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Too many consecutive heartbeats went unanswered.
    #[error("Heartbeat timeout: {missed} consecutive pings unanswered")]
    HeartbeatTimeout {
        /// Number of missed heartbeats.
        missed: u32,
    },

    // ========================================================================
    // Delivery Errors
    // ========================================================================
    /// Pending queue is full; the message was dropped.
    #[error("Pending queue full ({limit} messages), message dropped")]
    Capacity {
        /// Configured queue limit.
        limit: usize,
    },

    /// Inbound frame could not be decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decoding failure.
        message: String,
    },

    // ========================================================================
    // Registry Errors
    // ========================================================================
    /// No connection registered under this id.
    #[error("Connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The missing connection ID.
        connection_id: ConnectionId,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid message error.
    #[inline]
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a heartbeat timeout error.
    #[inline]
    pub fn heartbeat_timeout(missed: u32) -> Self {
        Self::HeartbeatTimeout { missed }
    }

    /// Creates a capacity error.
    #[inline]
    pub fn capacity(limit: usize) -> Self {
        Self::Capacity { limit }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a connection not found error.
    #[inline]
    pub fn connection_not_found(connection_id: ConnectionId) -> Self {
        Self::ConnectionNotFound { connection_id }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::HeartbeatTimeout { .. }
        )
    }

    /// Returns `true` if the transport failed to open.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionTimeout { .. }
        )
    }

    /// Returns `true` if an established connection broke.
    ///
    /// These errors move the connection to `Disconnected` and start
    /// reconnection.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::ConnectionClosed
                | Self::HeartbeatTimeout { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if this error stays local and never changes state.
    #[inline]
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. } | Self::Decode { .. } | Self::Json(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::connection("refused");
        assert_eq!(err.to_string(), "Connection failed: refused");
    }

    #[test]
    fn test_capacity_display() {
        let err = Error::capacity(1000);
        assert_eq!(
            err.to_string(),
            "Pending queue full (1000 messages), message dropped"
        );
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::connection_timeout(5000).is_timeout());
        assert!(Error::heartbeat_timeout(3).is_timeout());
        assert!(!Error::connection("test").is_timeout());
    }

    #[test]
    fn test_connection_vs_transport() {
        let open = Error::connection("refused");
        let broken = Error::transport("reset by peer");

        assert!(open.is_connection_error());
        assert!(!open.is_transport_error());
        assert!(broken.is_transport_error());
        assert!(!broken.is_connection_error());
        assert!(Error::ConnectionClosed.is_transport_error());
        assert!(Error::heartbeat_timeout(3).is_transport_error());
    }

    #[test]
    fn test_local_errors() {
        assert!(Error::capacity(1).is_local());
        assert!(Error::decode("bad frame").is_local());
        assert!(!Error::capacity(1).is_transport_error());
        assert!(!Error::ConnectionClosed.is_local());
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.is_local());
    }

    #[test]
    fn test_connection_not_found() {
        let err = Error::connection_not_found(ConnectionId::new("feed"));
        assert_eq!(err.to_string(), "Connection not found: feed");
    }
}
