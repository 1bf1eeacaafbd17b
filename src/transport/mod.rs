//! Transport layer.
//!
//! The recovery core consumes transports as an injected capability. This
//! module defines that capability and ships two implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐    open(url)     ┌──────────────────┐
//! │  Connection      │ ───────────────► │  Transport       │
//! │  (state machine) │ ◄─────────────── │  (factory)       │
//! │                  │  TransportHandle └──────────────────┘
//! │  inbound loop  ──┼── receive() ───► remote end
//! │  heartbeat     ──┼── send()    ───►
//! │  disconnect    ──┼── close()   ───►
//! └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `handle` | [`Transport`] and [`TransportHandle`] traits |
//! | `websocket` | `tokio-tungstenite` implementation |
//! | `memory` | In-process implementation for tests and demos |

// ============================================================================
// Submodules
// ============================================================================

/// Transport capability traits.
pub mod handle;

/// In-memory transport.
pub mod memory;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use handle::{Transport, TransportHandle};
pub use memory::{MemoryPeer, MemoryTransport, OpenBehavior};
pub use websocket::WebSocketTransport;
