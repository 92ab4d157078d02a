//! Reference push relay.
//!
//! A small WebSocket server speaking the same frames as the production push
//! endpoint. Used by the CLI for local runs and by the integration tests.
//!
//! ```text
//!                    RelayHandle
//!          broadcast() │        │ send_to(identity)
//!                      ▼        ▼
//!           broadcast::Sender   per-identity mpsc senders
//!              │   │   │              │
//!              ▼   ▼   ▼              ▼
//!   /ws/alice  /ws/bob  /ws/anonymous ...   (one task per connection)
//! ```
//!
//! Per connection: a `connection` greeting on open, `pong` for `ping`,
//! `echo` for any other JSON, `error` for text that is not JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hush_core::{unix_millis, wire, EventPayload, Identity};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before a slow client starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_broadcast: u64,
    pub frames_personal: u64,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

type Personal = HashMap<Identity, Vec<(u64, mpsc::Sender<Arc<String>>)>>;

struct Shared {
    broadcast: broadcast::Sender<Arc<String>>,
    personal: RwLock<Personal>,
    /// Bumped to drop every open connection.
    kick: watch::Sender<u64>,
    stats: RwLock<RelayStats>,
    next_conn: AtomicU64,
    capacity: usize,
}

pub struct PushRelay {
    config: RelayConfig,
    shared: Arc<Shared>,
}

/// Cloneable control surface of a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    shared: Arc<Shared>,
}

impl PushRelay {
    pub fn new(config: RelayConfig) -> Self {
        let capacity = config.broadcast_capacity.max(1);
        let (broadcast, _) = broadcast::channel(capacity);
        let (kick, _) = watch::channel(0);
        Self {
            config,
            shared: Arc::new(Shared {
                broadcast,
                personal: RwLock::new(HashMap::new()),
                kick,
                stats: RwLock::new(RelayStats::default()),
                next_conn: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Push relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, shared).await {
                    log::warn!("Relay connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> Result<(), RelayError> {
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;
    let identity = identity_from_path(&path);
    let (mut ws_sender, mut ws_receiver) = ws.split();

    // Subscribe before registering, so `connected()` implies delivery.
    let mut broadcast_rx = shared.broadcast.subscribe();
    let mut kick_rx = shared.kick.subscribe();
    let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
    let (personal_tx, mut personal_rx) = mpsc::channel(shared.capacity);
    shared
        .personal
        .write()
        .await
        .entry(identity.clone())
        .or_default()
        .push((conn_id, personal_tx));
    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("Relay: {identity} connected (conn {conn_id})");

    let greeting = json!({
        "type": "connection",
        "status": "connected",
        "user_id": identity.as_str(),
    });
    let result = async {
        ws_sender.send(Message::Text(greeting.to_string().into())).await?;
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        shared.stats.write().await.frames_received += 1;
                        let reply = reply_to(text.as_str());
                        ws_sender.send(Message::Text(reply.to_string().into())).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(RelayError::from(e)),
                },

                frame = broadcast_rx.recv() => match frame {
                    Ok(text) => ws_sender.send(Message::Text(text.to_string().into())).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Relay: {identity} lagged by {n} frames");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Some(text) = personal_rx.recv() => {
                    ws_sender.send(Message::Text(text.to_string().into())).await?;
                }

                changed = kick_rx.changed() => {
                    if changed.is_ok() {
                        log::debug!("Relay: dropping {identity} (conn {conn_id})");
                        let _ = ws_sender.send(Message::Close(None)).await;
                    }
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    {
        let mut personal = shared.personal.write().await;
        if let Some(senders) = personal.get_mut(&identity) {
            senders.retain(|(id, _)| *id != conn_id);
            if senders.is_empty() {
                personal.remove(&identity);
            }
        }
    }
    shared.stats.write().await.active_connections -= 1;
    log::info!("Relay: {identity} disconnected (conn {conn_id})");
    result
}

fn identity_from_path(path: &str) -> Identity {
    match path.strip_prefix("/ws/") {
        Some(raw) => Identity::new(decode_path_segment(raw)),
        None => Identity::anonymous(),
    }
}

fn decode_path_segment(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|d| d as u8)
}

fn reply_to(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(frame) if frame.get("type").and_then(Value::as_str) == Some("ping") => json!({
            "type": "pong",
            "timestamp": unix_millis(),
        }),
        Ok(frame) => json!({
            "type": "echo",
            "data": frame,
        }),
        Err(_) => json!({
            "type": "error",
            "message": "Invalid JSON format",
        }),
    }
}

impl RelayHandle {
    /// Push an event to every connection. Returns the number of receivers.
    pub async fn broadcast(&self, payload: &EventPayload) -> Result<usize, RelayError> {
        let text = wire::encode(payload, None)?;
        Ok(self.broadcast_raw(text).await)
    }

    /// Push a pre-encoded frame to every connection.
    pub async fn broadcast_raw(&self, text: impl Into<String>) -> usize {
        let count = self.shared.broadcast.send(Arc::new(text.into())).unwrap_or(0);
        self.shared.stats.write().await.frames_broadcast += 1;
        count
    }

    /// Push an event to the connections of one identity only.
    pub async fn send_to(
        &self,
        identity: &Identity,
        payload: &EventPayload,
    ) -> Result<usize, RelayError> {
        let text = Arc::new(wire::encode(payload, None)?);
        let senders: Vec<mpsc::Sender<Arc<String>>> = self
            .shared
            .personal
            .read()
            .await
            .get(identity)
            .map(|list| list.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for tx in senders {
            if tx.send(text.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        self.shared.stats.write().await.frames_personal += 1;
        Ok(delivered)
    }

    /// Close every open connection. Clients are expected to reconnect.
    pub fn disconnect_all(&self) {
        self.shared.kick.send_modify(|generation| *generation += 1);
    }

    /// Open connections of `identity`.
    pub async fn connected(&self, identity: &Identity) -> usize {
        self.shared
            .personal
            .read()
            .await
            .get(identity)
            .map_or(0, Vec::len)
    }

    pub async fn stats(&self) -> RelayStats {
        self.shared.stats.read().await.clone()
    }
}
