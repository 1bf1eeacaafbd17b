//! WebSocket Recovery - Self-healing client connections.
//!
//! This library keeps a logical session with a WebSocket endpoint alive
//! across a flaky transport. The caller sends and receives JSON messages;
//! reconnection, liveness probing and redelivery happen underneath.
//!
//! # Architecture
//!
//! Each [`Connection`] is a state machine that owns up to three tasks:
//!
//! - **Inbound loop**: receives frames, routes `ack`/`ping`/`pong`, dedups
//!   application messages and acknowledges them on request
//! - **Heartbeat loop**: pings on an interval and declares the connection
//!   dead after too many missed pongs
//! - **Reconnection loop**: waits with exponential backoff and jitter, then
//!   reopens the transport
//!
//! Outbound messages are delivered at least once: anything not yet written,
//! or written but not acknowledged, is resent after the next successful
//! connect unless it outlived the retention window.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use websocket_recovery::{ConnectionRegistry, ReconnectionConfig, Result, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let registry = ConnectionRegistry::new(Arc::new(WebSocketTransport::new()));
//!
//!     let feed = registry
//!         .create_connection("feed", "ws://127.0.0.1:9001", Some(ReconnectionConfig::new()))
//!         .await?;
//!     feed.connect().await;
//!
//!     // Queued while offline, flushed once connected
//!     feed.send(json!({ "type": "subscribe", "channel": "ticks" }), true).await?;
//!
//!     registry.cleanup_all().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`Connection`] state machine, config, tracking, backoff |
//! | [`registry`] | [`ConnectionRegistry`] of named connections |
//! | [`transport`] | [`Transport`] traits, WebSocket and in-memory implementations |
//! | [`protocol`] | Wire envelope: `ack`, `ping`, `pong`, application messages |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Self-healing connections.
///
/// - [`Connection`] - State machine and background tasks
/// - [`ReconnectionConfig`] / [`HeartbeatConfig`] - Behavior settings
/// - [`MessageTracker`] - Pending queue, ack table and dedup
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for connections and messages.
pub mod identifiers;

/// Wire envelope encoding and decoding.
pub mod protocol;

/// Registry of named connections.
pub mod registry;

/// Transport capability and implementations.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{
    Backoff, Callbacks, Connection, ConnectionBuilder, ConnectionMetrics, ConnectionOptions,
    ConnectionState, ConnectionStatus, HeartbeatConfig, MessageState, MessageTracker,
    ReconnectionConfig, SendOutcome, StatusMetrics,
};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, MessageId};

// Protocol types
pub use protocol::{ControlFrame, Envelope, InboundMessage};

// Registry
pub use registry::ConnectionRegistry;

// Transport types
pub use transport::{
    MemoryPeer, MemoryTransport, OpenBehavior, Transport, TransportHandle, WebSocketTransport,
};
