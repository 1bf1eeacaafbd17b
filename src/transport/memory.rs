//! In-memory transport for tests and demos.
//!
//! Every successful `open` yields a [`MemoryPeer`], the remote side of the
//! handle. Tests script open outcomes with [`OpenBehavior`], push inbound
//! frames, inspect outbound frames and inject failures through the peer.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::Instant;

use crate::error::{Error, Result};

use super::handle::{Transport, TransportHandle};

// ============================================================================
// OpenBehavior
// ============================================================================

/// Scripted outcome of one `open` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Open succeeds and a peer is published.
    Accept,
    /// Open succeeds but every send on the handle fails.
    AcceptFailingSends,
    /// Open fails with a connection error.
    Refuse(String),
    /// Open never completes.
    Hang,
}

// ============================================================================
// MemoryTransport
// ============================================================================

/// Transport whose handles are backed by in-process channels.
///
/// Unscripted opens use the default behavior (accept unless changed with
/// [`MemoryTransport::set_default`]).
pub struct MemoryTransport {
    script: Mutex<VecDeque<OpenBehavior>>,
    default: Mutex<OpenBehavior>,
    opens: Mutex<Vec<Instant>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
    peers_rx: AsyncMutex<mpsc::UnboundedReceiver<MemoryPeer>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates a transport that accepts every open.
    #[must_use]
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(OpenBehavior::Accept),
            opens: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: AsyncMutex::new(peers_rx),
        }
    }

    /// Queues outcomes for the next `open` calls, in order.
    pub fn script(&self, behaviors: impl IntoIterator<Item = OpenBehavior>) {
        self.script.lock().extend(behaviors);
    }

    /// Sets the outcome used once the script is exhausted.
    pub fn set_default(&self, behavior: OpenBehavior) {
        *self.default.lock() = behavior;
    }

    /// Returns how many times `open` was called.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    /// Returns the instant of every `open` call, in order.
    #[must_use]
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }

    /// Waits for the peer of the next accepted open.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Arc<dyn TransportHandle>> {
        self.opens.lock().push(Instant::now());

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());

        let failing_sends = behavior == OpenBehavior::AcceptFailingSends;
        match behavior {
            OpenBehavior::Accept | OpenBehavior::AcceptFailingSends => {
                let (handle, peer) = memory_pair(url);
                if failing_sends {
                    peer.fail_sends();
                }
                // Receiver lives as long as the transport
                let _ = self.peers_tx.send(peer);
                Ok(Arc::new(handle))
            }
            OpenBehavior::Refuse(reason) => Err(Error::connection(reason)),
            OpenBehavior::Hang => std::future::pending().await,
        }
    }
}

// ============================================================================
// MemoryHandle / MemoryPeer
// ============================================================================

/// Shared flags between a handle and its peer.
#[derive(Default)]
struct Flags {
    closed: AtomicBool,
    fail_sends: AtomicBool,
    close_calls: AtomicUsize,
}

/// Local side of an in-memory connection.
struct MemoryHandle {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Result<String>>>,
    outbound: mpsc::UnboundedSender<String>,
    flags: Arc<Flags>,
}

/// Remote side of an in-memory connection.
pub struct MemoryPeer {
    url: String,
    inbound: mpsc::UnboundedSender<Result<String>>,
    outbound: mpsc::UnboundedReceiver<String>,
    flags: Arc<Flags>,
}

fn memory_pair(url: &str) -> (MemoryHandle, MemoryPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let flags = Arc::new(Flags::default());

    let handle = MemoryHandle {
        inbound: AsyncMutex::new(in_rx),
        outbound: out_tx,
        flags: Arc::clone(&flags),
    };
    let peer = MemoryPeer {
        url: url.to_string(),
        inbound: in_tx,
        outbound: out_rx,
        flags,
    };
    (handle, peer)
}

#[async_trait]
impl TransportHandle for MemoryHandle {
    async fn send(&self, frame: String) -> Result<()> {
        if self.flags.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        if self.flags.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::transport("send refused by peer"));
        }
        self.outbound
            .send(frame)
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn receive(&self) -> Result<String> {
        match self.inbound.lock().await.recv().await {
            Some(frame) => frame,
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.flags.close_calls.fetch_add(1, Ordering::SeqCst);
        self.flags.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MemoryPeer {
    /// Returns the URL the handle was opened with.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Delivers a JSON frame to the local end.
    pub fn push(&self, frame: &Value) {
        self.push_text(frame.to_string());
    }

    /// Delivers a raw text frame to the local end.
    pub fn push_text(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(Ok(frame.into()));
    }

    /// Makes the local end's pending `receive` fail with a transport error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inbound.send(Err(Error::transport(reason)));
    }

    /// Makes every subsequent local `send` fail.
    pub fn fail_sends(&self) {
        self.flags.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the local end closed the handle.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }

    /// Returns how many times the local end called `close`.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.flags.close_calls.load(Ordering::SeqCst)
    }

    /// Waits for the next frame written by the local end.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let text = self.outbound.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Returns every frame already written by the local end.
    pub fn drain_frames(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[tokio::test]
    async fn test_accept_publishes_peer() {
        let transport = MemoryTransport::new();
        let handle = transport.open("memory://a").await.unwrap();
        let mut peer = transport.next_peer().await.unwrap();

        assert_eq!(peer.url(), "memory://a");

        handle.send(json!({ "id": "1" }).to_string()).await.unwrap();
        assert_eq!(peer.next_frame().await.unwrap()["id"], "1");

        peer.push(&json!({ "id": "2" }));
        assert_eq!(handle.receive().await.unwrap(), r#"{"id":"2"}"#);
    }

    #[tokio::test]
    async fn test_scripted_refusal_then_default() {
        let transport = MemoryTransport::new();
        transport.script([OpenBehavior::Refuse("down".into())]);

        let err = transport.open("memory://a").await.err().unwrap();
        assert!(err.is_connection_error());
        assert!(transport.open("memory://a").await.is_ok());
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_dropped_peer_closes_handle() {
        let transport = MemoryTransport::new();
        let handle = transport.open("memory://a").await.unwrap();
        drop(transport.next_peer().await);

        assert!(matches!(handle.receive().await, Err(Error::ConnectionClosed)));
        assert!(handle.send("{}".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_and_failures() {
        let transport = MemoryTransport::new();
        let handle = transport.open("memory://a").await.unwrap();
        let peer = transport.next_peer().await.unwrap();

        peer.fail_sends();
        assert!(handle.send("{}".into()).await.unwrap_err().is_transport_error());

        peer.fail("reset");
        assert!(handle.receive().await.unwrap_err().is_transport_error());

        handle.close().await.unwrap();
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failing_sends() {
        let transport = MemoryTransport::new();
        transport.script([OpenBehavior::AcceptFailingSends]);

        let handle = transport.open("memory://a").await.unwrap();
        assert!(handle.send("{}".into()).await.unwrap_err().is_transport_error());

        let healthy = transport.open("memory://a").await.unwrap();
        assert!(healthy.send("{}".into()).await.is_ok());
    }
}
