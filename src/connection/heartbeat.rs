//! Heartbeat bookkeeping.
//!
//! The connection's heartbeat loop drives a [`HeartbeatMonitor`]: it calls
//! [`HeartbeatMonitor::ping_sent`] when a ping goes out, the inbound loop
//! calls [`HeartbeatMonitor::pong_received`], and after the grace window the
//! heartbeat loop asks for a verdict with [`HeartbeatMonitor::evaluate`].

// ============================================================================
// Imports
// ============================================================================

use chrono::{DateTime, Utc};
use tokio::time::Instant;

// ============================================================================
// Beat
// ============================================================================

/// Verdict for one heartbeat cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Beat {
    /// A pong answered the last ping.
    Healthy {
        /// Round trip of that ping.
        latency_ms: f64,
    },
    /// No pong yet; below the threshold.
    Missed {
        /// Consecutive misses so far.
        missed: u32,
    },
    /// Threshold reached; the connection is considered dead.
    Dead {
        /// Consecutive misses.
        missed: u32,
    },
}

// ============================================================================
// HeartbeatMonitor
// ============================================================================

/// Ping/pong timing and missed-pong counting for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    ping_sent_at: Option<Instant>,
    answered: bool,
    missed: u32,
    latency_ms: f64,
    last_ping: Option<DateTime<Utc>>,
    last_pong: Option<DateTime<Utc>>,
}

impl HeartbeatMonitor {
    /// Creates a monitor that reports [`Beat::Dead`] after `max_missed`
    /// consecutive misses.
    #[must_use]
    pub fn new(max_missed: u32) -> Self {
        Self {
            max_missed,
            ping_sent_at: None,
            answered: false,
            missed: 0,
            latency_ms: 0.0,
            last_ping: None,
            last_pong: None,
        }
    }

    /// Starts a fresh cycle for a new session.
    ///
    /// Keeps the last latency and wall-clock stamps for reporting.
    pub fn reset(&mut self) {
        self.ping_sent_at = None;
        self.answered = false;
        self.missed = 0;
    }

    /// Records an outgoing ping.
    pub fn ping_sent(&mut self) {
        self.ping_sent_at = Some(Instant::now());
        self.answered = false;
        self.last_ping = Some(Utc::now());
    }

    /// Records an incoming pong.
    ///
    /// Only the first pong after a ping measures latency.
    pub fn pong_received(&mut self) {
        self.last_pong = Some(Utc::now());

        if let Some(sent_at) = self.ping_sent_at
            && !self.answered
        {
            self.answered = true;
            self.latency_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
        }
    }

    /// Closes the current cycle.
    pub fn evaluate(&mut self) -> Beat {
        if self.answered {
            self.missed = 0;
            return Beat::Healthy {
                latency_ms: self.latency_ms,
            };
        }

        self.missed = self.missed.saturating_add(1);
        if self.missed >= self.max_missed {
            Beat::Dead {
                missed: self.missed,
            }
        } else {
            Beat::Missed {
                missed: self.missed,
            }
        }
    }

    /// Returns consecutive missed pongs.
    #[inline]
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Returns the last measured round trip.
    #[inline]
    #[must_use]
    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    /// Returns when the last ping was sent.
    #[inline]
    #[must_use]
    pub fn last_ping(&self) -> Option<DateTime<Utc>> {
        self.last_ping
    }

    /// Returns when the last pong arrived.
    #[inline]
    #[must_use]
    pub fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.last_pong
    }
}

// ============================================================================
// Tests
// ============================================================================
