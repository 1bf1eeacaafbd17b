//! Echo session through a restarting server.
//!
//! Demonstrates:
//! - Creating connections through a registry with the WebSocket transport
//! - At-least-once sends acknowledged by the remote end
//! - Automatic reconnection after the server goes away
//! - Messages queued while offline and flushed on reconnect
//!
//! Without `--url`, a local echo server is started and restarted on the
//! same port halfway through.
//!
//! Usage:
//!   cargo run --example echo_session
//!   cargo run --example echo_session -- --debug
//!   cargo run --example echo_session -- --url ws://127.0.0.1:9001

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;

use websocket_recovery::{
    ConnectionOptions, ConnectionRegistry, HeartbeatConfig, ReconnectionConfig, WebSocketTransport,
};

// ============================================================================
// Args
// ============================================================================

#[derive(Debug, Clone)]
struct Args {
    debug: bool,
    url: Option<String>,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self {
            debug: args.iter().any(|a| a == "--debug"),
            url: args
                .iter()
                .position(|a| a == "--url")
                .and_then(|i| args.get(i + 1).cloned()),
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "websocket_recovery=debug"
    } else {
        "websocket_recovery=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    println!("=== Echo Session ===\n");

    let (url, mut server) = match args.url {
        Some(url) => (url, None),
        None => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            println!("[Setup] Local echo server on {addr}");
            (format!("ws://{addr}"), Some((addr, spawn_echo_server(listener))))
        }
    };

    // ========================================================================
    // Registry
    // ========================================================================

    let options = ConnectionOptions::new()
        .with_config(
            ReconnectionConfig::new()
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(5))
                .with_timeout(Duration::from_secs(5)),
        )
        .with_heartbeat(
            HeartbeatConfig::new()
                .with_interval(Duration::from_secs(2))
                .with_grace(Duration::from_secs(1)),
        );

    let registry = ConnectionRegistry::with_defaults(Arc::new(WebSocketTransport::new()), options);
    let echo = registry.create_connection("echo", url.clone(), None).await?;

    println!("[Connect] {url}");
    if !echo.connect().await {
        anyhow::bail!(
            "initial connect failed: {}",
            echo.last_error().unwrap_or_default()
        );
    }
    println!("          ✓ {}\n", echo.state());

    // ========================================================================
    // Send while connected
    // ========================================================================

    for n in 0..3 {
        let outcome = echo.send(json!({ "type": "chat", "n": n }), true).await?;
        println!("[Send] n={n} → {outcome:?}");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("       awaiting ack: {}\n", echo.sent_count());

    // ========================================================================
    // Outage
    // ========================================================================

    if let Some((addr, task)) = server.take() {
        println!("[Outage] Stopping server");
        task.abort();
        tokio::time::sleep(Duration::from_secs(1)).await;

        for n in 3..5 {
            let outcome = echo.send(json!({ "type": "chat", "n": n }), true).await?;
            println!("[Send] n={n} → {outcome:?} (state: {})", echo.state());
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        println!("\n[Outage] Restarting server on {addr}");
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("rebinding {addr}"))?;
        server = Some((addr, spawn_echo_server(listener)));

        for _ in 0..50 {
            if echo.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    // ========================================================================
    // Status
    // ========================================================================

    let status = registry.get_status(echo.id())?;
    println!("\n[Status]\n{}", serde_json::to_string_pretty(&status)?);

    registry.cleanup_all().await;
    if let Some((_, task)) = server {
        task.abort();
    }

    println!("\n=== Done ===");
    Ok(())
}

// ============================================================================
// Echo Server
// ============================================================================

/// Accepts WebSocket clients, acks messages that ask for it and answers
/// pings. Aborting the returned task drops every client with it.
fn spawn_echo_server(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut clients = JoinSet::new();
        while let Ok((stream, peer)) = listener.accept().await {
            clients.spawn(async move {
                if let Err(e) = serve_client(stream, peer).await {
                    eprintln!("[Server] {peer}: {e}");
                }
            });
        }
    })
}

async fn serve_client(stream: tokio::net::TcpStream, peer: SocketAddr) -> Result<()> {
    let mut ws = accept_async(stream).await?;
    println!("[Server] Client connected from {peer}");

    while let Some(message) = ws.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        let frame: Value = serde_json::from_str(text.as_str())?;

        let reply = match frame["type"].as_str() {
            Some("ping") => json!({ "type": "pong", "timestamp": frame["timestamp"] }),
            Some("ack") | Some("pong") => continue,
            _ if frame["ack_required"] == true => {
                json!({ "type": "ack", "id": frame["id"] })
            }
            _ => continue,
        };
        ws.send(Message::Text(reply.to_string().into())).await?;
    }

    Ok(())
}
