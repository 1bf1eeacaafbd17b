//! Connection state machine.
//!
//! A [`Connection`] owns one logical session with a remote endpoint and keeps
//! it alive across transport failures.
//!
//! # Tasks
//!
//! | Task | Lifetime | Role |
//! |------|----------|------|
//! | inbound | one session | receive, decode and route frames |
//! | heartbeat | one session | ping, wait for pong, count misses |
//! | reconnect | one outage | backoff, retry `establish` |
//!
//! Every session gets its own [`CancellationToken`] and an epoch number.
//! Errors reported by a task whose epoch is no longer current are ignored,
//! so a late failure from a torn-down session cannot break its successor.
//!
//! # Locks
//!
//! All shared state sits behind `parking_lot` locks that are never held
//! across an `.await`. When two are needed they are taken in the order
//! `reconnect` → `state` → `session`. `connect_lock` serializes opens.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, MessageId};
use crate::protocol::{ControlFrame, Envelope};
use crate::transport::{Transport, TransportHandle};

use super::backoff::Backoff;
use super::builder::{ConnectionBuilder, ConnectionOptions};
use super::callbacks::Callbacks;
use super::config::{HeartbeatConfig, ReconnectionConfig};
use super::heartbeat::{Beat, HeartbeatMonitor};
use super::state::{ConnectionMetrics, ConnectionState, ConnectionStatus, StatusMetrics};
use super::tracker::{MessageState, MessageTracker};

// ============================================================================
// Constants
// ============================================================================

/// Bound on closing a handle; a dead peer must not stall teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Types
// ============================================================================

type Handle = Arc<dyn TransportHandle>;

/// Result of [`Connection::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the transport.
    Sent(MessageId),
    /// Held in the pending queue until the next flush.
    Queued(MessageId),
}

impl SendOutcome {
    /// Returns the message ID.
    #[must_use]
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Sent(id) | Self::Queued(id) => id,
        }
    }

    /// Returns `true` if the message was written.
    #[inline]
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent(_))
    }
}

/// Tasks and handle of one connected session.
struct Session {
    epoch: u64,
    handle: Handle,
    token: CancellationToken,
    inbound: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

/// The running reconnection loop.
struct ReconnectTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// ============================================================================
// Connection
// ============================================================================

/// A self-healing connection to one URL.
///
/// Cheap to clone; clones share the same session.
///
/// # Example
///
/// ```ignore
/// let connection = Connection::builder("feed", "ws://localhost:9001", transport).build()?;
/// connection.connect().await;
/// connection.send(json!({ "text": "hi" }), true).await?;
/// connection.disconnect("done").await;
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    url: String,
    config: ReconnectionConfig,
    heartbeat: HeartbeatConfig,
    backoff: Backoff,
    transport: Arc<dyn Transport>,
    callbacks: Callbacks,

    state: Mutex<ConnectionState>,
    session: Mutex<Option<Session>>,
    reconnect: Mutex<Option<ReconnectTask>>,
    connect_lock: AsyncMutex<()>,

    tracker: Mutex<MessageTracker>,
    monitor: Mutex<HeartbeatMonitor>,
    metrics: Mutex<ConnectionMetrics>,
    last_error: Mutex<Option<String>>,

    /// Reconnection attempts since the last successful connect.
    attempts: AtomicU32,
    /// Incremented for every session and on `disconnect()`.
    epoch: AtomicU64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connection - Construction
// ============================================================================

impl Connection {
    /// Starts building a connection.
    #[must_use]
    pub fn builder(
        id: impl Into<ConnectionId>,
        url: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> ConnectionBuilder {
        ConnectionBuilder::new(id, url, transport)
    }

    pub(crate) fn new(
        id: ConnectionId,
        url: String,
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
    ) -> Self {
        let ConnectionOptions {
            config,
            heartbeat,
            callbacks,
        } = options;

        Self {
            inner: Arc::new(Inner {
                backoff: Backoff::from_config(&config),
                tracker: Mutex::new(MessageTracker::from_config(&config)),
                monitor: Mutex::new(HeartbeatMonitor::new(heartbeat.max_missed)),
                metrics: Mutex::new(ConnectionMetrics::new(id.clone())),
                id,
                url,
                config,
                heartbeat,
                transport,
                callbacks,
                state: Mutex::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                reconnect: Mutex::new(None),
                connect_lock: AsyncMutex::new(()),
                last_error: Mutex::new(None),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Opens the transport and starts the session.
    ///
    /// Returns `true` if the connection is up afterwards. Already connected
    /// connections return `true` without reopening. A failure (including
    /// the open timeout) is recorded, reported to `on_error`, leaves the
    /// connection `Failed` and returns `false`. A session lost while
    /// flushing queued messages also returns `false`, with reconnection
    /// already under way.
    pub async fn connect(&self) -> bool {
        self.establish(None).await
    }

    /// Tears the session down and stops any reconnection.
    ///
    /// No-op if already disconnected.
    pub async fn disconnect(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::Closing
            ) {
                return;
            }
            *state = ConnectionState::Closing;
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }

        info!(connection_id = %self.inner.id, reason, "Disconnecting");

        let reconnect = self.inner.reconnect.lock().take();
        if let Some(task) = reconnect {
            task.token.cancel();
            join_task(task.handle).await;
        }

        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.token.cancel();
            if let Some(heartbeat) = session.heartbeat {
                join_task(heartbeat).await;
            }
            join_task(session.inbound).await;
            close_handle(&self.inner.id, &session.handle).await;
        }

        *self.inner.state.lock() = ConnectionState::Disconnected;
        self.inner.metrics.lock().disconnect_time = Some(Utc::now());

        debug!(connection_id = %self.inner.id, "Disconnected");
        self.inner.callbacks.disconnected(&self.inner.id, reason);
    }

    /// Sends a JSON object, or queues it while not connected.
    ///
    /// An `id` is assigned if the object has none. A write that fails on a
    /// live connection puts the message back in the queue, triggers
    /// recovery and reports [`SendOutcome::Queued`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidMessage`] if `message` is not a JSON object
    /// - [`Error::Capacity`] if the pending queue is full
    pub async fn send(&self, message: Value, require_ack: bool) -> Result<SendOutcome> {
        let prepared = self.inner.tracker.lock().prepare(message, require_ack)?;
        let id = prepared.message_id.clone();

        let Some((epoch, handle)) = self.live_session() else {
            self.inner.tracker.lock().enqueue(prepared)?;
            debug!(
                connection_id = %self.inner.id,
                message_id = %id,
                state = %self.state(),
                "Message queued"
            );
            return Ok(SendOutcome::Queued(id));
        };

        match self.write_message(&handle, prepared).await {
            Ok(()) => Ok(SendOutcome::Sent(id)),
            Err(e) if e.is_local() => Err(e),
            Err(e) => {
                self.handle_transport_error(epoch, e).await;
                Ok(SendOutcome::Queued(id))
            }
        }
    }

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Returns the remote URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Returns the reconnection config.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReconnectionConfig {
        &self.inner.config
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Returns `true` if the session is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Returns reconnection attempts made since the last successful connect.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.tracker.lock().pending_len()
    }

    /// Returns the number of messages awaiting `ack`.
    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.inner.tracker.lock().sent_len()
    }

    /// Returns the last recorded error, cleared on connect.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().clone()
    }

    /// Returns a metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> ConnectionMetrics {
        let mut metrics = self.inner.metrics.lock().clone();
        let monitor = self.inner.monitor.lock();
        metrics.last_ping = monitor.last_ping();
        metrics.last_pong = monitor.last_pong();
        metrics.latency_ms = monitor.latency_ms();
        metrics.missed_heartbeats = monitor.missed();
        metrics
    }

    /// Returns a status snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let metrics = self.metrics();
        let (pending_messages, sent_unacked) = {
            let tracker = self.inner.tracker.lock();
            (tracker.pending_len(), tracker.sent_len())
        };

        ConnectionStatus {
            connection_id: self.inner.id.clone(),
            url: self.inner.url.clone(),
            state: self.state(),
            reconnect_attempts: self.reconnect_attempts(),
            pending_messages,
            sent_unacked,
            metrics: StatusMetrics::from(&metrics),
            last_error: self.last_error(),
        }
    }
}

// ============================================================================
// Connection - Lifecycle
// ============================================================================

impl Connection {
    /// Opens a handle and starts a session.
    ///
    /// `reconnect` is the token of the calling reconnection loop; it is
    /// `None` for a direct `connect()`.
    async fn establish(&self, reconnect: Option<&CancellationToken>) -> bool {
        let _guard = self.inner.connect_lock.lock().await;

        {
            let mut state = self.inner.state.lock();
            match *state {
                ConnectionState::Connected => return true,
                ConnectionState::Connecting | ConnectionState::Closing => return false,
                ConnectionState::Reconnecting => {}
                _ if reconnect.is_some() => return false,
                _ => {}
            }
            *state = ConnectionState::Connecting;
        }

        debug!(connection_id = %self.inner.id, url = %self.inner.url, "Opening transport");

        let timeout = self.inner.config.timeout;
        let open = tokio::time::timeout(timeout, self.inner.transport.open(&self.inner.url));
        let opened = match reconnect {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => return false,
                result = open => result,
            },
            None => open.await,
        };
        let opened = opened.unwrap_or_else(|_| {
            Err(Error::connection_timeout(
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            ))
        });

        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                if e.is_timeout() {
                    warn!(connection_id = %self.inner.id, error = %e, "Connect timed out");
                } else {
                    warn!(connection_id = %self.inner.id, error = %e, "Connect failed");
                }
                self.record_error(&e);

                let mut state = self.inner.state.lock();
                if *state == ConnectionState::Connecting {
                    *state = if reconnect.is_some() {
                        ConnectionState::Reconnecting
                    } else {
                        ConnectionState::Failed
                    };
                }
                return false;
            }
        };

        self.inner.monitor.lock().reset();

        let epoch = {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Connecting {
                let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                let session = self.start_session(epoch, Arc::clone(&handle));
                *self.inner.session.lock() = Some(session);
                *state = ConnectionState::Connected;
                Some(epoch)
            } else {
                None
            }
        };

        // disconnect() won the race while the handle was opening
        let Some(epoch) = epoch else {
            debug!(connection_id = %self.inner.id, "Connect superseded, closing handle");
            close_handle(&self.inner.id, &handle).await;
            return false;
        };

        self.inner.attempts.store(0, Ordering::SeqCst);
        *self.inner.last_error.lock() = None;
        {
            let mut metrics = self.inner.metrics.lock();
            metrics.connect_time = Some(Utc::now());
            metrics.disconnect_time = None;
        }

        info!(connection_id = %self.inner.id, url = %self.inner.url, epoch, "Connected");

        self.flush(epoch, &handle).await;

        // The flush may already have lost the session
        if !self.is_current(epoch) {
            debug!(connection_id = %self.inner.id, epoch, "Session lost during flush");
            return false;
        }

        self.inner.callbacks.connected(&self.inner.id);
        true
    }

    /// Spawns the loops of a new session.
    fn start_session(&self, epoch: u64, handle: Handle) -> Session {
        let token = CancellationToken::new();

        let inbound = tokio::spawn(self.clone().run_inbound(
            epoch,
            Arc::clone(&handle),
            token.clone(),
        ));

        let heartbeat = self.inner.heartbeat.enabled.then(|| {
            tokio::spawn(
                self.clone()
                    .run_heartbeat(epoch, Arc::clone(&handle), token.clone()),
            )
        });

        Session {
            epoch,
            handle,
            token,
            inbound,
            heartbeat,
        }
    }

    /// Returns `true` while the session of `epoch` is still connected.
    fn is_current(&self, epoch: u64) -> bool {
        *self.inner.state.lock() == ConnectionState::Connected
            && self.inner.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Returns the epoch and handle of the current session, if connected.
    fn live_session(&self) -> Option<(u64, Handle)> {
        let state = self.inner.state.lock();
        if *state != ConnectionState::Connected {
            return None;
        }
        self.inner
            .session
            .lock()
            .as_ref()
            .map(|session| (session.epoch, Arc::clone(&session.handle)))
    }

    /// Handles a failure of an established session.
    ///
    /// Reports from stale sessions, or while not connected, are ignored.
    async fn handle_transport_error(&self, epoch: u64, err: Error) {
        let session = {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Connected
                || self.inner.epoch.load(Ordering::SeqCst) != epoch
            {
                trace!(connection_id = %self.inner.id, epoch, error = %err, "Ignoring stale error");
                return;
            }
            *state = ConnectionState::Disconnected;
            self.inner.session.lock().take()
        };

        warn!(connection_id = %self.inner.id, error = %err, "Connection lost");
        self.record_error(&err);

        if let Some(session) = session {
            // May be running on one of these tasks, so never join here
            session.token.cancel();
            close_handle(&self.inner.id, &session.handle).await;
        }

        self.inner.metrics.lock().disconnect_time = Some(Utc::now());
        self.inner
            .callbacks
            .disconnected(&self.inner.id, &err.to_string());

        self.schedule_reconnect();
    }

    /// Moves a `Disconnected` connection to `Reconnecting` and makes sure a
    /// reconnection loop is running, or to `Failed` if no attempts remain.
    fn schedule_reconnect(&self) {
        let mut slot = self.inner.reconnect.lock();

        {
            let mut state = self.inner.state.lock();
            if *state != ConnectionState::Disconnected {
                return;
            }

            let attempts = self.inner.attempts.load(Ordering::SeqCst);
            if !self.inner.backoff.should_retry(attempts) {
                *state = ConnectionState::Failed;
                error!(connection_id = %self.inner.id, attempts, "Reconnection attempts exhausted");
                return;
            }
            *state = ConnectionState::Reconnecting;
        }

        // A live loop re-reads the state before every attempt
        if slot.is_some() {
            debug!(connection_id = %self.inner.id, "Reconnection already running");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run_reconnect(token.clone()));
        *slot = Some(ReconnectTask { token, handle });
    }

    fn record_error(&self, err: &Error) {
        self.inner.metrics.lock().error_count += 1;
        *self.inner.last_error.lock() = Some(err.to_string());
        self.inner.callbacks.error(&self.inner.id, err);
    }
}

// ============================================================================
// Connection - Messaging
// ============================================================================

impl Connection {
    /// Writes one message, tracking it for `ack` if required.
    ///
    /// On a transport failure the message goes back to the pending queue.
    async fn write_message(&self, handle: &Handle, message: MessageState) -> Result<()> {
        let frame = message.encode()?;
        let id = message.message_id.clone();

        self.inner.tracker.lock().mark_in_flight(&message);

        match handle.send(frame).await {
            Ok(()) => {
                self.inner.metrics.lock().message_count += 1;
                trace!(connection_id = %self.inner.id, message_id = %id, "Message sent");
                Ok(())
            }
            Err(e) => {
                let mut tracker = self.inner.tracker.lock();
                tracker.clear_in_flight(&id);
                tracker.requeue(message);
                Err(e)
            }
        }
    }

    /// Resends queued and unacknowledged messages after a connect.
    async fn flush(&self, epoch: u64, handle: &Handle) {
        let batch = self
            .inner
            .tracker
            .lock()
            .drain_for_flush(self.inner.config.preserve_pending_messages, Utc::now());

        if batch.is_empty() {
            return;
        }

        let mut sent = 0usize;
        let mut remaining = batch.into_iter();

        while let Some(message) = remaining.next() {
            match self.write_message(handle, message).await {
                Ok(()) => sent += 1,
                Err(e) if e.is_local() => {
                    warn!(connection_id = %self.inner.id, error = %e, "Dropping unencodable message");
                }
                Err(e) => {
                    let rest: Vec<_> = remaining.by_ref().collect();
                    warn!(
                        connection_id = %self.inner.id,
                        sent,
                        unsent = rest.len() + 1,
                        "Flush interrupted"
                    );
                    self.inner.tracker.lock().restore(rest);
                    self.handle_transport_error(epoch, e).await;
                    return;
                }
            }
        }

        info!(connection_id = %self.inner.id, count = sent, "Flushed pending messages");
    }

    /// Handles one inbound text frame.
    ///
    /// Only errors from writing a reply are returned.
    async fn route(&self, handle: &Handle, text: &str) -> Result<()> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection_id = %self.inner.id, error = %e, "Dropping undecodable frame");
                return Ok(());
            }
        };

        match envelope {
            Envelope::Ack { id, .. } => {
                let acked = self.inner.tracker.lock().acknowledge(&id);
                if acked.is_some() {
                    trace!(connection_id = %self.inner.id, message_id = %id, "Message acknowledged");
                } else {
                    debug!(connection_id = %self.inner.id, message_id = %id, "Ack for unknown message");
                }
            }

            Envelope::Pong { .. } => {
                self.inner.monitor.lock().pong_received();
                trace!(connection_id = %self.inner.id, "Pong received");
            }

            Envelope::Ping { timestamp } => {
                send_control(handle, ControlFrame::pong(timestamp)).await?;
            }

            Envelope::Message(message) => {
                if let Some(id) = &message.id {
                    let fresh = self.inner.tracker.lock().record_received(id);
                    if !fresh {
                        debug!(connection_id = %self.inner.id, message_id = %id, "Dropping duplicate");
                        return Ok(());
                    }
                }

                self.inner.callbacks.message(&self.inner.id, &message.body);

                if message.ack_required {
                    match message.id {
                        Some(id) => send_control(handle, ControlFrame::ack(id)).await?,
                        None => debug!(connection_id = %self.inner.id, "Cannot ack message without id"),
                    }
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Connection - Background Tasks
// ============================================================================

impl Connection {
    async fn run_inbound(self, epoch: u64, handle: Handle, token: CancellationToken) {
        loop {
            let received = tokio::select! {
                biased;
                () = token.cancelled() => break,
                received = handle.receive() => received,
            };

            let result = match received {
                Ok(text) => self.route(&handle, &text).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_local() => {
                    warn!(connection_id = %self.inner.id, error = %e, "Failed to encode reply");
                }
                Err(e) => {
                    self.handle_transport_error(epoch, e).await;
                    break;
                }
            }
        }

        debug!(connection_id = %self.inner.id, epoch, "Inbound loop terminated");
    }

    async fn run_heartbeat(self, epoch: u64, handle: Handle, token: CancellationToken) {
        let interval = self.inner.heartbeat.interval;
        let grace = self.inner.heartbeat.grace;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            self.inner.monitor.lock().ping_sent();
            match send_control(&handle, ControlFrame::ping()).await {
                Ok(()) => trace!(connection_id = %self.inner.id, "Ping sent"),
                Err(e) if e.is_local() => {
                    warn!(connection_id = %self.inner.id, error = %e, "Failed to encode ping");
                }
                Err(e) => {
                    self.handle_transport_error(epoch, e).await;
                    break;
                }
            }

            if !sleep_or_cancel(&token, grace).await {
                break;
            }

            let beat = self.inner.monitor.lock().evaluate();
            match beat {
                Beat::Healthy { latency_ms } => {
                    trace!(connection_id = %self.inner.id, latency_ms, "Heartbeat healthy");
                }
                Beat::Missed { missed } => {
                    debug!(connection_id = %self.inner.id, missed, "Heartbeat missed");
                }
                Beat::Dead { missed } => {
                    warn!(connection_id = %self.inner.id, missed, "Heartbeat timed out");
                    self.handle_transport_error(epoch, Error::heartbeat_timeout(missed))
                        .await;
                    break;
                }
            }
        }

        debug!(connection_id = %self.inner.id, epoch, "Heartbeat loop terminated");
    }

    async fn run_reconnect(self, token: CancellationToken) {
        loop {
            let attempt = {
                let mut slot = self.inner.reconnect.lock();
                if token.is_cancelled() {
                    return;
                }

                let mut state = self.inner.state.lock();
                let current = *state;
                if current != ConnectionState::Reconnecting {
                    *slot = None;
                    debug!(connection_id = %self.inner.id, state = %current, "Reconnection loop finished");
                    return;
                }

                let attempt = self.inner.attempts.load(Ordering::SeqCst);
                if !self.inner.backoff.should_retry(attempt) {
                    *state = ConnectionState::Failed;
                    *slot = None;
                    error!(connection_id = %self.inner.id, attempts = attempt, "Reconnection attempts exhausted");
                    return;
                }
                attempt
            };

            let delay = self.inner.backoff.delay(attempt);
            info!(
                connection_id = %self.inner.id,
                attempt = attempt + 1,
                max_attempts = self.inner.backoff.max_attempts(),
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Scheduling reconnection"
            );

            if !sleep_or_cancel(&token, delay).await {
                return;
            }

            self.inner.attempts.fetch_add(1, Ordering::SeqCst);
            self.inner.metrics.lock().reconnect_count += 1;

            if self.establish(Some(&token)).await {
                info!(connection_id = %self.inner.id, attempt = attempt + 1, "Reconnected");
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Sleeps for `duration`. Returns `false` if cancelled first.
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}

async fn send_control(handle: &Handle, frame: ControlFrame) -> Result<()> {
    handle.send(frame.encode()?).await
}

async fn close_handle(id: &ConnectionId, handle: &Handle) {
    match tokio::time::timeout(CLOSE_TIMEOUT, handle.close()).await {
        Ok(Ok(())) => trace!(connection_id = %id, "Handle closed"),
        Ok(Err(e)) => warn!(connection_id = %id, error = %e, "Failed to close handle"),
        Err(_) => warn!(connection_id = %id, "Timed out closing handle"),
    }
}

/// Awaits a task unless it is the caller.
async fn join_task(handle: JoinHandle<()>) {
    if tokio::task::try_id() == Some(handle.id()) {
        return;
    }
    if let Err(e) = handle.await
        && e.is_panic()
    {
        error!(error = %e, "Background task panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    use crate::transport::{MemoryPeer, MemoryTransport, OpenBehavior};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn quick_config() -> ReconnectionConfig {
        ReconnectionConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .without_jitter()
    }

    fn build(transport: &Arc<MemoryTransport>, config: ReconnectionConfig) -> ConnectionBuilder {
        init_tracing();
        Connection::builder("conn", "ws://test.local/socket", Arc::clone(transport) as Arc<dyn Transport>)
            .config(config)
            .heartbeat(HeartbeatConfig::disabled())
    }

    async fn connected(
        config: ReconnectionConfig,
    ) -> (Connection, Arc<MemoryTransport>, MemoryPeer) {
        let transport = Arc::new(MemoryTransport::new());
        let connection = build(&transport, config).build().unwrap();
        assert!(connection.connect().await);
        let peer = transport.next_peer().await.unwrap();
        (connection, transport, peer)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(10),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    // ------------------------------------------------------------------------
    // connect / disconnect
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let (connection, transport, _peer) = connected(quick_config()).await;

        assert!(connection.connect().await);
        assert_eq!(transport.open_count(), 1);
        assert!(connection.is_connected());

        let metrics = connection.metrics();
        assert!(metrics.connect_time.is_some());
        assert!(metrics.disconnect_time.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_marks_failed() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([OpenBehavior::Refuse("refused".into())]);

        let (tx, mut errors) = mpsc::unbounded_channel();
        let connection = build(&transport, quick_config())
            .on_error(move |_, e| {
                let _ = tx.send(e.is_connection_error());
            })
            .build()
            .unwrap();

        assert!(!connection.connect().await);
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(errors.recv().await, Some(true));
        assert!(connection.last_error().unwrap().contains("refused"));
        assert_eq!(connection.metrics().error_count, 1);

        // Failed is left by an explicit connect
        assert!(connection.connect().await);
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert!(connection.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([OpenBehavior::Hang]);

        let (tx, mut errors) = mpsc::unbounded_channel();
        let connection = build(&transport, quick_config().with_timeout(Duration::from_secs(5)))
            .on_error(move |_, e| {
                let _ = tx.send(matches!(e, Error::ConnectionTimeout { timeout_ms: 5000 }));
            })
            .build()
            .unwrap();

        let started = Instant::now();
        assert!(!connection.connect().await);
        assert_close(started.elapsed(), Duration::from_secs(5));
        assert_eq!(errors.recv().await, Some(true));
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_fails_when_flush_loses_session() {
        let transport = Arc::new(MemoryTransport::new());
        transport.script([OpenBehavior::AcceptFailingSends]);
        transport.set_default(OpenBehavior::Refuse("down".into()));

        let (tx, mut events) = mpsc::unbounded_channel();
        let connected_tx = tx.clone();
        let connection = build(&transport, quick_config())
            .on_connect(move |_| {
                let _ = connected_tx.send("connect");
            })
            .on_disconnect(move |_, _| {
                let _ = tx.send("disconnect");
            })
            .build()
            .unwrap();
        assert_ok!(connection.send(json!({ "n": 1 }), true).await);

        assert!(!connection.connect().await);
        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        assert_eq!(events.recv().await, Some("disconnect"));
        assert!(events.try_recv().is_err());

        assert_eq!(connection.pending_count(), 1);
        assert_eq!(connection.sent_count(), 0);
        assert!(connection.last_error().unwrap().contains("send refused"));

        connection.disconnect("done").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_handle_once() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, mut reasons) = mpsc::unbounded_channel();
        let connection = build(&transport, quick_config())
            .on_disconnect(move |_, reason| {
                let _ = tx.send(reason.to_string());
            })
            .build()
            .unwrap();
        assert!(connection.connect().await);
        let peer = transport.next_peer().await.unwrap();

        connection.disconnect("bye").await;
        connection.disconnect("again").await;

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 1);
        assert_eq!(reasons.recv().await.as_deref(), Some("bye"));
        assert!(reasons.try_recv().is_err());
        assert!(connection.metrics().disconnect_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_reconnection() {
        let (connection, transport, peer) = connected(
            quick_config().with_initial_delay(Duration::from_secs(5)).with_max_delay(Duration::from_secs(5)),
        )
        .await;
        transport.set_default(OpenBehavior::Refuse("down".into()));

        peer.fail("reset");
        wait_until(|| connection.state() == ConnectionState::Reconnecting).await;

        connection.disconnect("shutdown").await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    // ------------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_failed() {
        let config = ReconnectionConfig::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .without_jitter();
        let (connection, transport, peer) = connected(config).await;
        transport.set_default(OpenBehavior::Refuse("down".into()));

        peer.fail("reset");
        wait_until(|| connection.state() == ConnectionState::Failed).await;

        let opens = transport.open_times();
        assert_eq!(opens.len(), 4);
        assert_close(opens[1] - opens[0], Duration::from_secs(1));
        assert_close(opens[2] - opens[1], Duration::from_secs(2));
        assert_close(opens[3] - opens[2], Duration::from_secs(4));

        assert_eq!(connection.reconnect_attempts(), 3);
        assert_eq!(connection.metrics().reconnect_count, 3);

        // No further automatic attempts
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.open_count(), 4);
        assert_eq!(connection.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_drop() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, mut events) = mpsc::unbounded_channel();
        let connect_tx = tx.clone();
        let connection = build(&transport, quick_config())
            .on_connect(move |_| {
                let _ = connect_tx.send("connect");
            })
            .on_disconnect(move |_, _| {
                let _ = tx.send("disconnect");
            })
            .build()
            .unwrap();

        assert!(connection.connect().await);
        let peer = transport.next_peer().await.unwrap();
        peer.fail("reset");

        let _second = transport.next_peer().await.unwrap();
        wait_until(|| connection.is_connected()).await;

        assert_eq!(events.recv().await, Some("connect"));
        assert_eq!(events.recv().await, Some("disconnect"));
        assert_eq!(events.recv().await, Some("connect"));
        assert_eq!(connection.reconnect_attempts(), 0);
        assert!(peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_fails_immediately() {
        let (connection, transport, peer) = connected(quick_config().with_max_attempts(0)).await;

        peer.fail("reset");
        wait_until(|| connection.state() == ConnectionState::Failed).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.open_count(), 1);
    }

    // ------------------------------------------------------------------------
    // Outbound reliability
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_resent_until_acked() {
        let (connection, transport, mut peer) = connected(quick_config()).await;

        let outcome = assert_ok!(connection.send(json!({ "text": "hi" }), true).await);
        assert!(outcome.is_sent());

        let frame = peer.next_frame().await.unwrap();
        assert_eq!(frame["text"], "hi");
        assert_eq!(frame["ack_required"], true);
        assert_eq!(frame["id"], outcome.message_id().as_str());
        assert_eq!(connection.sent_count(), 1);

        // Drop without ack: resent on reconnect, still awaiting ack
        peer.fail("reset");
        let mut second = transport.next_peer().await.unwrap();
        assert_eq!(second.next_frame().await.unwrap()["id"], frame["id"]);
        wait_until(|| connection.is_connected()).await;
        assert_eq!(connection.sent_count(), 1);

        // And again
        second.fail("reset");
        let mut third = transport.next_peer().await.unwrap();
        assert_eq!(third.next_frame().await.unwrap()["id"], frame["id"]);
        wait_until(|| connection.is_connected()).await;

        third.push(&json!({ "type": "ack", "id": frame["id"] }));
        wait_until(|| connection.sent_count() == 0).await;
        assert_eq!(connection.status().sent_unacked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_requeued_in_order() {
        let (connection, transport, peer) = connected(quick_config()).await;
        peer.fail_sends();

        let first = assert_ok!(connection.send(json!({ "n": 1 }), true).await);
        assert!(!first.is_sent());
        let second = assert_ok!(connection.send(json!({ "n": 2 }), true).await);
        assert!(!second.is_sent());
        assert_eq!(connection.pending_count(), 2);

        let mut next = transport.next_peer().await.unwrap();
        assert_eq!(next.next_frame().await.unwrap()["n"], 1);
        assert_eq!(next.next_frame().await.unwrap()["n"], 2);

        wait_until(|| connection.is_connected()).await;
        assert_eq!(connection.pending_count(), 0);
        assert_eq!(connection.sent_count(), 2);
        assert_eq!(connection.metrics().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_while_disconnected_then_flushed() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = build(&transport, quick_config()).build().unwrap();

        for n in 0..3 {
            let outcome = assert_ok!(connection.send(json!({ "n": n }), false).await);
            assert!(!outcome.is_sent());
        }
        assert_eq!(connection.pending_count(), 3);

        assert!(connection.connect().await);
        let mut peer = transport.next_peer().await.unwrap();
        let order: Vec<_> = peer.drain_frames().iter().map(|f| f["n"].clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(connection.pending_count(), 0);
        assert_eq!(connection.sent_count(), 0);
        assert_eq!(connection.metrics().message_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_discarded_without_preserve() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = build(&transport, quick_config().with_preserve_pending(false))
            .build()
            .unwrap();

        assert_ok!(connection.send(json!({ "n": 1 }), true).await);
        assert!(connection.connect().await);

        let mut peer = transport.next_peer().await.unwrap();
        assert!(peer.drain_frames().is_empty());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_capacity() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = build(&transport, quick_config().with_max_pending_messages(2))
            .build()
            .unwrap();

        assert_ok!(connection.send(json!({}), false).await);
        assert_ok!(connection.send(json!({}), false).await);
        let err = connection.send(json!({}), false).await.unwrap_err();

        assert!(matches!(err, Error::Capacity { limit: 2 }));
        assert_eq!(connection.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_send_rejects_non_object() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = build(&transport, quick_config()).build().unwrap();

        let err = connection.send(json!("text"), false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
        assert_eq!(connection.pending_count(), 0);
    }

    // ------------------------------------------------------------------------
    // Inbound routing
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_delivered_once() {
        let transport = Arc::new(MemoryTransport::new());
        let (tx, mut delivered) = mpsc::unbounded_channel();
        let connection = build(&transport, quick_config())
            .on_message(move |_, message| {
                let _ = tx.send(message.clone());
            })
            .build()
            .unwrap();
        assert!(connection.connect().await);
        let peer = transport.next_peer().await.unwrap();

        peer.push(&json!({ "id": "m1", "text": "a" }));
        peer.push(&json!({ "id": "m1", "text": "a" }));
        peer.push_text("not json");
        peer.push(&json!({ "id": "m2", "text": "b" }));

        assert_eq!(delivered.recv().await.unwrap()["id"], "m1");
        assert_eq!(delivered.recv().await.unwrap()["id"], "m2");
        assert!(delivered.try_recv().is_err());
        assert!(connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_required_inbound_is_acked() {
        let (connection, _transport, mut peer) = connected(quick_config()).await;

        peer.push(&json!({ "id": "m1", "type": "chat", "ack_required": true }));
        let ack = peer.next_frame().await.unwrap();

        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], "m1");
        assert!(ack["timestamp"].is_number());
        assert!(connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_answered() {
        let (_connection, _transport, mut peer) = connected(quick_config()).await;

        peer.push(&json!({ "type": "ping", "timestamp": 123.0 }));
        let pong = peer.next_frame().await.unwrap();

        assert_eq!(pong["type"], "pong");
        assert_eq!(pong["timestamp"], 123.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_by_peer_triggers_recovery() {
        let (connection, transport, peer) = connected(quick_config()).await;

        drop(peer);
        let _next = transport.next_peer().await.unwrap();
        wait_until(|| connection.is_connected()).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(connection.metrics().reconnect_count, 1);
    }

    // ------------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_answered_heartbeats_keep_connection() {
        init_tracing();
        let transport = Arc::new(MemoryTransport::new());
        let heartbeat = HeartbeatConfig::new()
            .with_interval(Duration::from_secs(1))
            .with_grace(Duration::from_millis(500))
            .with_max_missed(2);
        let connection = Connection::builder("hb", "ws://test.local", Arc::clone(&transport) as Arc<dyn Transport>)
            .config(quick_config())
            .heartbeat(heartbeat)
            .build()
            .unwrap();
        assert!(connection.connect().await);
        let mut peer = transport.next_peer().await.unwrap();

        for _ in 0..3 {
            let ping = peer.next_frame().await.unwrap();
            assert_eq!(ping["type"], "ping");
            peer.push(&json!({ "type": "pong", "timestamp": ping["timestamp"] }));
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(connection.is_connected());
        let metrics = connection.metrics();
        assert_eq!(metrics.missed_heartbeats, 0);
        assert!(metrics.last_pong.is_some());
        assert!(metrics.last_ping.is_some());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_trigger_recovery() {
        init_tracing();
        let transport = Arc::new(MemoryTransport::new());
        let (tx, mut errors) = mpsc::unbounded_channel();
        let heartbeat = HeartbeatConfig::new()
            .with_interval(Duration::from_secs(1))
            .with_grace(Duration::from_millis(500))
            .with_max_missed(2);
        let connection = Connection::builder("hb", "ws://test.local", Arc::clone(&transport) as Arc<dyn Transport>)
            .config(quick_config())
            .heartbeat(heartbeat)
            .on_error(move |_, e| {
                let _ = tx.send(matches!(e, Error::HeartbeatTimeout { missed: 2 }));
            })
            .build()
            .unwrap();

        let started = Instant::now();
        assert!(connection.connect().await);
        let peer = transport.next_peer().await.unwrap();

        assert_eq!(errors.recv().await, Some(true));
        // Pings at 1s and 2s, second one unanswered by 2.5s
        assert_close(started.elapsed(), Duration::from_millis(2500));

        let _next = transport.next_peer().await.unwrap();
        wait_until(|| connection.is_connected()).await;
        assert!(peer.is_closed());

        connection.disconnect("done").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_heartbeat() {
        init_tracing();
        let transport = Arc::new(MemoryTransport::new());
        let heartbeat = HeartbeatConfig::new()
            .with_interval(Duration::from_secs(1))
            .with_grace(Duration::from_millis(500))
            .with_max_missed(3);
        let connection = Connection::builder("hb", "ws://test.local", Arc::clone(&transport) as Arc<dyn Transport>)
            .config(quick_config())
            .heartbeat(heartbeat)
            .build()
            .unwrap();
        assert!(connection.connect().await);
        let mut peer = transport.next_peer().await.unwrap();

        let ping = peer.next_frame().await.unwrap();
        assert_eq!(ping["type"], "ping");
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(connection.metrics().missed_heartbeats, 1);

        connection.disconnect("done").await;
        let before = connection.metrics();
        peer.drain_frames();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(peer.drain_frames().is_empty());
        let after = connection.metrics();
        assert_eq!(after.missed_heartbeats, before.missed_heartbeats);
        assert_eq!(after.last_ping, before.last_ping);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot() {
        let transport = Arc::new(MemoryTransport::new());
        let connection = build(&transport, quick_config()).build().unwrap();
        assert_ok!(connection.send(json!({ "n": 1 }), true).await);

        let status = connection.status();
        assert_eq!(status.connection_id.as_str(), "conn");
        assert_eq!(status.url, "ws://test.local/socket");
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.pending_messages, 1);
        assert_eq!(status.sent_unacked, 0);
        assert_eq!(status.reconnect_attempts, 0);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["state"], "disconnected");
        assert_eq!(value["metrics"]["message_count"], 0);
    }
}
