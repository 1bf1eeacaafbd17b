//! Self-healing connections.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | [`Connection`] state machine and its background tasks |
//! | `builder` | [`ConnectionBuilder`] and [`ConnectionOptions`] |
//! | `config` | [`ReconnectionConfig`] and [`HeartbeatConfig`] |
//! | `state` | [`ConnectionState`], metrics and status snapshots |
//! | `tracker` | Pending queue, ack table and inbound dedup |
//! | `heartbeat` | Ping/pong bookkeeping |
//! | `backoff` | Reconnection delays |
//! | `callbacks` | User event handlers |

// ============================================================================
// Submodules
// ============================================================================

/// Exponential backoff with jitter.
pub mod backoff;

/// Connection builder.
pub mod builder;

/// Event handlers.
pub mod callbacks;

/// Configuration types.
pub mod config;

/// Connection state machine.
pub mod core;

/// Heartbeat bookkeeping.
pub mod heartbeat;

/// State, metrics and status.
pub mod state;

/// Message reliability tracking.
pub mod tracker;

// ============================================================================
// Re-exports
// ============================================================================

pub use backoff::{Backoff, apply_jitter, calculate_backoff};
pub use builder::{ConnectionBuilder, ConnectionOptions};
pub use callbacks::Callbacks;
pub use config::{HeartbeatConfig, ReconnectionConfig};
pub use core::{Connection, SendOutcome};
pub use heartbeat::{Beat, HeartbeatMonitor};
pub use state::{ConnectionMetrics, ConnectionState, ConnectionStatus, StatusMetrics};
pub use tracker::{MessageState, MessageTracker};
