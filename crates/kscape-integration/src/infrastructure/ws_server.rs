//! Host-facing WebSocket server.
//!
//! Each accepted connection gets a [`ConnectionId`] and two halves:
//!
//! - **reader**: parses text frames with [`parse_inbound`] and forwards
//!   requests and events to the entity adapter;
//! - **writer**: drains the connection's outbound queue and writes each
//!   [`OutboundMsg`] as a JSON text frame.
//!
//! The outbound queue is bounded.  The adapter drops a host whose queue is
//! full, which closes the queue and ends the writer; the reader then stops at
//! its next frame.
//!
//! Shutdown is triggered by clearing the shared `running` flag; the accept
//! loop polls it between 200 ms accept timeouts.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::adapter::{AdapterRequest, ConnectionId};
use crate::domain::messages::{parse_inbound, Inbound, OutboundMsg};

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, WsMessage>>>;

/// Accepts host connections until `running` is cleared.
///
/// The listener is bound by the caller so that the bound address is known
/// before the loop starts.  `queue_capacity` bounds each connection's
/// outbound queue.
pub async fn run_server(
    listener: TcpListener,
    adapter: mpsc::Sender<AdapterRequest>,
    queue_capacity: usize,
    running: Arc<AtomicBool>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("host WebSocket server listening on {addr}"),
        Err(e) => warn!("host WebSocket server listening (address unknown: {e})"),
    }

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new host connection from {peer_addr}");
                let adapter = adapter.clone();
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    handle_host_connection(stream, peer_addr, adapter, queue_capacity, running)
                        .await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            // No connection within 200 ms; re-check the flag.
            Err(_) => {}
        }
    }
}

async fn handle_host_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    adapter: mpsc::Sender<AdapterRequest>,
    queue_capacity: usize,
    running: Arc<AtomicBool>,
) {
    let conn = Uuid::new_v4();
    match run_connection(stream, peer_addr, conn, &adapter, queue_capacity, running).await {
        Ok(()) => info!("host {peer_addr} ({conn}) closed normally"),
        Err(e) => warn!("host {peer_addr} ({conn}) closed with error: {e:#}"),
    }
    // The adapter may already be gone during shutdown.
    let _ = adapter.send(AdapterRequest::Detach { conn }).await;
}

async fn run_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    conn: ConnectionId,
    adapter: &mpsc::Sender<AdapterRequest>,
    queue_capacity: usize,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
    debug!("host {peer_addr}: WebSocket established as {conn}");

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let ws_tx: WsSink = Arc::new(Mutex::new(ws_tx));

    let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
    adapter
        .send(AdapterRequest::Attach {
            conn,
            outbound: outbound_tx,
        })
        .await
        .context("entity adapter is not running")?;

    let mut writer = tokio::spawn(write_outbound(outbound_rx, Arc::clone(&ws_tx), conn));

    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = &mut writer => {
                debug!("host {conn}: outbound queue closed; ending connection");
                break;
            }
        };

        let ws_msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                debug!("host {conn}: WebSocket closed");
                break;
            }
            Some(Err(e)) => {
                warn!("host {conn}: WebSocket error: {e}");
                break;
            }
            None => {
                debug!("host {conn}: stream ended");
                break;
            }
        };

        match ws_msg {
            WsMessage::Text(text) => {
                if !forward_frame(&text, conn, adapter, &ws_tx).await {
                    break;
                }
            }
            WsMessage::Binary(_) => {
                warn!("host {conn}: unexpected binary frame (ignored)");
            }
            WsMessage::Ping(data) => {
                debug!("host {conn}: ping ({} bytes)", data.len());
            }
            WsMessage::Pong(_) => {}
            WsMessage::Close(_) => {
                debug!("host {conn}: Close frame received");
                break;
            }
            WsMessage::Frame(_) => {}
        }
    }

    writer.abort();
    let mut sink = ws_tx.lock().await;
    // Best effort; the peer may already be gone.
    let _ = sink.close().await;
    Ok(())
}

/// Hands one text frame to the adapter.  Returns `false` once the adapter is
/// gone.
async fn forward_frame(
    text: &str,
    conn: ConnectionId,
    adapter: &mpsc::Sender<AdapterRequest>,
    ws_tx: &WsSink,
) -> bool {
    let request = match parse_inbound(text) {
        Ok(Inbound::Request { id, request }) => AdapterRequest::Request { conn, id, request },
        Ok(Inbound::Event(event)) => AdapterRequest::Event { conn, event },
        Ok(Inbound::Ignored(what)) => {
            debug!("host {conn}: ignoring {what}");
            return true;
        }
        Err(e) => {
            warn!("host {conn}: {e}");
            // Frames without an id cannot be answered.
            if let Some(id) = e.request_id() {
                let reply = OutboundMsg::error(id, e.status_code(), &e.to_string());
                if let Err(e) = send_json(ws_tx, &reply).await {
                    debug!("host {conn}: {e}");
                }
            }
            return true;
        }
    };
    adapter.send(request).await.is_ok()
}

async fn write_outbound(mut rx: mpsc::Receiver<OutboundMsg>, ws_tx: WsSink, conn: ConnectionId) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = send_json(&ws_tx, &msg).await {
            debug!("host {conn}: {e}");
            break;
        }
    }
}

async fn send_json(ws_tx: &WsSink, msg: &OutboundMsg) -> anyhow::Result<()> {
    let text = serde_json::to_string(msg).context("JSON serialization failed")?;
    let mut sink = ws_tx.lock().await;
    sink.send(WsMessage::Text(text))
        .await
        .context("WebSocket send failed (host disconnected)")
}
