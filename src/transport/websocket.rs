//! WebSocket transport backed by `tokio-tungstenite`.
//!
//! Splits the stream so the inbound loop can wait on reads while other
//! tasks write.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::handle::{Transport, TransportHandle};

// ============================================================================
// Types
// ============================================================================

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// WebSocketTransport
// ============================================================================

/// Opens real WebSocket connections.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use websocket_recovery::{ConnectionRegistry, WebSocketTransport};
///
/// let registry = ConnectionRegistry::new(Arc::new(WebSocketTransport::new()));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates a new WebSocket transport.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Arc<dyn TransportHandle>> {
        let parsed = Url::parse(url).map_err(|e| Error::connection(format!("Invalid URL {url}: {e}")))?;

        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::connection(format!(
                "Unsupported scheme: {}",
                parsed.scheme()
            )));
        }

        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| Error::connection(format!("WebSocket handshake failed: {e}")))?;

        debug!(url, status = %response.status(), "WebSocket handshake completed");

        let (sink, stream) = stream.split();

        Ok(Arc::new(WebSocketHandle {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }))
    }
}

// ============================================================================
// WebSocketHandle
// ============================================================================

/// One open WebSocket connection.
struct WebSocketHandle {
    sink: Mutex<SplitSink<Stream, Message>>,
    stream: Mutex<SplitStream<Stream>>,
}

#[async_trait]
impl TransportHandle for WebSocketHandle {
    async fn send(&self, frame: String) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        let mut stream = self.stream.lock().await;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),

                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(text),
                    Err(e) => warn!(error = %e, "Dropping non UTF-8 binary frame"),
                },

                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by remote");
                    return Err(Error::ConnectionClosed);
                }

                Some(Err(e)) => return Err(Error::WebSocket(e)),

                None => return Err(Error::ConnectionClosed),

                // Ping/Pong/raw frames are answered by tungstenite itself
                Some(Ok(other)) => trace!(?other, "Ignoring control frame"),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.close().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
