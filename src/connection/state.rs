//! Connection state, metrics and status snapshots.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::identifiers::ConnectionId;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a connection.
///
/// | From | To | Trigger |
/// |------|----|---------|
/// | `Disconnected`/`Failed` | `Connecting` | `connect()` |
/// | `Connecting` | `Connected` / `Failed` | open succeeds / fails |
/// | `Connected` | `Disconnected` | transport or heartbeat error |
/// | `Disconnected` | `Reconnecting` / `Failed` | attempts remain / exhausted |
/// | `Reconnecting` | `Connected` / `Failed` | retry succeeds / exhausted |
/// | any | `Closing` → `Disconnected` | `disconnect()` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Opening the transport.
    Connecting,
    /// Transport open; loops running.
    Connected,
    /// Not connected.
    #[default]
    Disconnected,
    /// Waiting for the next reconnection attempt.
    Reconnecting,
    /// Attempts exhausted or open failed; needs an explicit `connect()`.
    Failed,
    /// `disconnect()` in progress.
    Closing,
}

impl ConnectionState {
    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
            Self::Closing => "closing",
        }
    }

    /// Returns `true` if a registry recovery sweep should try this state.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ConnectionMetrics
// ============================================================================

/// Counters and timings of a connection.
///
/// Callers only see snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    /// Owning connection.
    pub connection_id: ConnectionId,
    /// Last successful connect.
    pub connect_time: Option<DateTime<Utc>>,
    /// Last disconnect, cleared on connect.
    pub disconnect_time: Option<DateTime<Utc>>,
    /// Messages written to the transport.
    pub message_count: u64,
    /// Errors recorded.
    pub error_count: u64,
    /// Reconnection attempts made over the connection's lifetime.
    pub reconnect_count: u64,
    /// Last ping sent.
    pub last_ping: Option<DateTime<Utc>>,
    /// Last pong received.
    pub last_pong: Option<DateTime<Utc>>,
    /// Round trip of the last answered ping.
    pub latency_ms: f64,
    /// Consecutive unanswered pings.
    pub missed_heartbeats: u32,
}

impl ConnectionMetrics {
    /// Creates zeroed metrics.
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            connect_time: None,
            disconnect_time: None,
            message_count: 0,
            error_count: 0,
            reconnect_count: 0,
            last_ping: None,
            last_pong: None,
            latency_ms: 0.0,
            missed_heartbeats: 0,
        }
    }
}

// ============================================================================
// ConnectionStatus
// ============================================================================

/// Read-only projection returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Remote URL.
    pub url: String,
    /// Current state.
    pub state: ConnectionState,
    /// Attempts made since the last successful connect.
    pub reconnect_attempts: u32,
    /// Messages waiting to be sent.
    pub pending_messages: usize,
    /// Messages sent but not yet acknowledged.
    pub sent_unacked: usize,
    /// Counter summary.
    pub metrics: StatusMetrics,
    /// Last recorded error, cleared on connect.
    pub last_error: Option<String>,
}

/// Counter summary inside [`ConnectionStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMetrics {
    /// Messages written to the transport.
    pub message_count: u64,
    /// Errors recorded.
    pub error_count: u64,
    /// Reconnection attempts made.
    pub reconnect_count: u64,
    /// Round trip of the last answered ping.
    pub latency_ms: f64,
    /// Consecutive unanswered pings.
    pub missed_heartbeats: u32,
}

impl From<&ConnectionMetrics> for StatusMetrics {
    fn from(metrics: &ConnectionMetrics) -> Self {
        Self {
            message_count: metrics.message_count,
            error_count: metrics.error_count,
            reconnect_count: metrics.reconnect_count,
            latency_ms: metrics.latency_ms,
            missed_heartbeats: metrics.missed_heartbeats,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_initial_state() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(ConnectionState::Failed).unwrap(),
            json!("failed")
        );
    }

    #[test]
    fn test_recoverable_states() {
        assert!(ConnectionState::Failed.is_recoverable());
        assert!(ConnectionState::Disconnected.is_recoverable());
        assert!(!ConnectionState::Connected.is_recoverable());
        assert!(!ConnectionState::Reconnecting.is_recoverable());
    }

    #[test]
    fn test_status_metrics_projection() {
        let mut metrics = ConnectionMetrics::new(ConnectionId::new("a"));
        metrics.message_count = 4;
        metrics.missed_heartbeats = 1;

        let summary = StatusMetrics::from(&metrics);
        assert_eq!(summary.message_count, 4);
        assert_eq!(summary.missed_heartbeats, 1);
        assert_eq!(summary.error_count, 0);
    }
}
