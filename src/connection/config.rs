//! Reconnection and heartbeat configuration.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use websocket_recovery::{HeartbeatConfig, ReconnectionConfig};
//!
//! let config = ReconnectionConfig::new()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_secs(1))
//!     .without_jitter();
//! config.validate()?;
//!
//! let heartbeat = HeartbeatConfig::new().with_interval(Duration::from_secs(15));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_PENDING_MESSAGES: usize = 1000;
const DEFAULT_MESSAGE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEARTBEAT_GRACE: Duration = Duration::from_secs(10);
const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

// ============================================================================
// ReconnectionConfig
// ============================================================================

/// Recovery behavior of a single connection.
///
/// Immutable once the connection is built.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionConfig {
    /// Reconnection attempts before the connection is marked failed.
    pub max_attempts: u32,

    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,

    /// Upper bound for any backoff delay.
    pub max_delay: Duration,

    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,

    /// Randomize each delay into `[0.5, 1.0)` of its base value.
    pub jitter: bool,

    /// Bound on a single transport open.
    pub timeout: Duration,

    /// Resend queued and unacknowledged messages after reconnecting.
    pub preserve_pending_messages: bool,

    /// Maximum messages waiting in the pending queue.
    pub max_pending_messages: usize,

    /// Age after which undelivered messages are discarded.
    pub message_retention: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectionConfig {
    /// Creates a config with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
            timeout: DEFAULT_TIMEOUT,
            preserve_pending_messages: true,
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            message_retention: DEFAULT_MESSAGE_RETENTION,
        }
    }

    /// Sets the maximum number of reconnection attempts.
    #[inline]
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the first backoff delay.
    #[inline]
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the backoff cap.
    #[inline]
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff growth factor.
    #[inline]
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[inline]
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Sets the transport open timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Controls whether undelivered messages survive a reconnect.
    #[inline]
    #[must_use]
    pub fn with_preserve_pending(mut self, preserve: bool) -> Self {
        self.preserve_pending_messages = preserve;
        self
    }

    /// Sets the pending queue limit.
    #[inline]
    #[must_use]
    pub fn with_max_pending_messages(mut self, limit: usize) -> Self {
        self.max_pending_messages = limit;
        self
    }

    /// Sets how long undelivered messages are retained.
    #[inline]
    #[must_use]
    pub fn with_message_retention(mut self, retention: Duration) -> Self {
        self.message_retention = retention;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the multiplier is below 1 or not finite,
    /// the cap is below the initial delay, or the timeout is zero.
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        if self.max_delay < self.initial_delay {
            return Err(Error::config("max_delay must not be less than initial_delay"));
        }

        if self.timeout.is_zero() {
            return Err(Error::config("timeout must be greater than zero"));
        }

        Ok(())
    }
}

// ============================================================================
// HeartbeatConfig
// ============================================================================

/// Liveness probing of an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Send pings at all.
    pub enabled: bool,

    /// Time between pings.
    pub interval: Duration,

    /// Time to wait for a pong after each ping.
    pub grace: Duration,

    /// Consecutive missed pongs that declare the connection dead.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatConfig {
    /// Creates a config with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEARTBEAT_INTERVAL,
            grace: DEFAULT_HEARTBEAT_GRACE,
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }

    /// Creates a config with heartbeats turned off.
    #[inline]
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Sets the ping interval.
    #[inline]
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the pong grace window.
    #[inline]
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Sets the missed-pong threshold.
    #[inline]
    #[must_use]
    pub fn with_max_missed(mut self, max_missed: u32) -> Self {
        self.max_missed = max_missed;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an enabled heartbeat has a zero interval,
    /// a grace window not shorter than the interval, or a zero missed-pong
    /// threshold.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval.is_zero() {
            return Err(Error::config("heartbeat interval must be greater than zero"));
        }
        if self.grace >= self.interval {
            return Err(Error::config("heartbeat grace must be shorter than the interval"));
        }
        if self.max_missed == 0 {
            return Err(Error::config("max_missed must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
