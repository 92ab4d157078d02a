//! Push connection manager.
//!
//! Owns one WebSocket to `{endpoint}/ws/{identity}` and keeps it alive:
//!
//! ```text
//!            connect(id)                 open ok
//! Disconnected ─────────► Connecting ─────────────► Connected
//!      ▲  ▲                   │                          │
//!      │  └── open failed ────┘                          │
//!      │                                                 │
//!      └───────────── close / socket error ──────────────┘
//!      │
//!      └─ after ReconnectPolicy::delay ──► Connecting   (unless disconnect())
//! ```
//!
//! Each session is one supervisor task. Switching identity or calling
//! `disconnect()` aborts that task, which also cancels its pending
//! reconnect sleep, so two sessions never race for the socket.
//!
//! State changes and inbound text frames travel on one ordered channel
//! (`take_event_rx`), so a consumer always sees `Connected` before the
//! frames of that connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hush_core::{wire, Identity};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Connection state. Owned by [`ConnectionManager`], observed by everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay before each reconnection attempt. Retries never stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Same delay every time.
    Fixed(Duration),
    /// Doubles from `initial` after each consecutive failure, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// `attempt` counts consecutive failures since the last successful open.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(d) => d,
            ReconnectPolicy::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(Duration::from_secs(5))
    }
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the push endpoint, e.g. `ws://localhost:8000`
    pub endpoint: String,
    pub reconnect: ReconnectPolicy,
    /// Send `{"type":"ping"}` this often while connected (None = never)
    pub ping_interval: Option<Duration>,
    /// Buffer size of the event and outgoing channels
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8000".to_string(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: Some(Duration::from_secs(30)),
            channel_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Fast retries, no keep-alive.
    pub fn for_testing(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            reconnect: ReconnectPolicy::Fixed(Duration::from_millis(100)),
            ping_interval: None,
            channel_capacity: 64,
        }
    }

    /// Channel URL for one identity.
    pub fn channel_url(&self, identity: &Identity) -> String {
        format!(
            "{}/ws/{}",
            self.endpoint.trim_end_matches('/'),
            encode_path_segment(identity.as_str())
        )
    }
}

fn encode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// What the manager reports to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// One inbound text frame, undecoded.
    Message(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("socket error: {0}")]
    Socket(String),
    #[error("not connected")]
    NotConnected,
    #[error("event channel closed")]
    ChannelClosed,
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Handles shared between the manager and its supervisor task.
#[derive(Clone)]
struct Shared {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl Shared {
    async fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            log::info!("Connection state {prev:?} -> {next:?}");
            let _ = self.events_tx.send(TransportEvent::StateChanged(next)).await;
        }
    }
}

struct Session {
    identity: Identity,
    task: JoinHandle<()>,
    outgoing: mpsc::Sender<String>,
}

/// The connection manager.
pub struct ConnectionManager {
    config: TransportConfig,
    shared: Shared,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    session: Option<Session>,
}

impl ConnectionManager {
    pub fn new(config: TransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            shared: Shared {
                state_tx: Arc::new(state_tx),
                events_tx,
            },
            events_rx: Some(events_rx),
            session: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }

    /// Open the channel of `identity`, replacing any current session.
    ///
    /// Never fails: an unreachable endpoint shows up as `Disconnected`
    /// followed by scheduled retries.
    pub async fn connect(&mut self, identity: Identity) {
        self.stop_session().await;

        let url = self.config.channel_url(&identity);
        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let task = tokio::spawn(supervise(
            url,
            self.config.reconnect,
            self.config.ping_interval,
            self.shared.clone(),
            out_rx,
        ));
        self.session = Some(Session {
            identity,
            task,
            outgoing: out_tx,
        });
    }

    /// Reconnect under a new identity. No-op if already on that channel.
    pub async fn switch_identity(&mut self, identity: Identity) {
        if self.identity() == Some(&identity) {
            return;
        }
        log::info!("Switching push channel to {identity}");
        self.connect(identity).await;
    }

    /// Close the connection and stop retrying until the next `connect`.
    pub async fn disconnect(&mut self) {
        self.stop_session().await;
    }

    async fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
            let _ = session.task.await;
            log::debug!("Stopped session for {}", session.identity);
        }
        self.shared.set_state(ConnectionState::Disconnected).await;
    }

    /// Send one text frame. Only allowed while connected.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        session
            .outgoing
            .send(text.into())
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }

    pub async fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(value)?;
        self.send(text).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state changes without consuming the event stream.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Identity of the current session, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.session.as_ref().map(|s| &s.identity)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

/// Connect, pump, wait, repeat. Runs until aborted or the consumer is gone.
async fn supervise(
    url: String,
    policy: ReconnectPolicy,
    ping_interval: Option<Duration>,
    shared: Shared,
    mut outgoing: mpsc::Receiver<String>,
) {
    let mut attempt: u32 = 0;
    loop {
        shared.set_state(ConnectionState::Connecting).await;

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                shared.set_state(ConnectionState::Connected).await;
                match pump(ws, &shared, &mut outgoing, ping_interval).await {
                    Ok(()) => log::info!("Push connection to {url} closed"),
                    Err(TransportError::ChannelClosed) => {
                        log::debug!("Event consumer gone; stopping {url}");
                        return;
                    }
                    Err(e) => log::warn!("Push connection to {url} lost: {e}"),
                }
            }
            Err(e) => {
                let err = TransportError::Connect {
                    url: url.clone(),
                    reason: e.to_string(),
                };
                log::warn!("{err}");
            }
        }

        shared.set_state(ConnectionState::Disconnected).await;
        if shared.events_tx.is_closed() {
            return;
        }

        // Frames queued for the dead socket are not replayed.
        while outgoing.try_recv().is_ok() {}

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        log::info!("Reconnecting to {url} in {delay:?}");
        tokio::time::sleep(delay).await;
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    shared: &Shared,
    outgoing: &mut mpsc::Receiver<String>,
    ping_interval: Option<Duration>,
) -> Result<(), TransportError> {
    let (mut writer, mut reader) = ws.split();
    let mut ticker = ping_interval.map(|period| {
        let mut t = tokio::time::interval_at(Instant::now() + period, period);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });

    loop {
        tokio::select! {
            msg = reader.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            log::warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(TransportError::Socket(e.to_string())),
                };
                shared
                    .events_tx
                    .send(TransportEvent::Message(text))
                    .await
                    .map_err(|_| TransportError::ChannelClosed)?;
            }

            out = outgoing.recv() => {
                let Some(text) = out else { return Ok(()) };
                writer
                    .send(Message::Text(text.into()))
                    .await
                    .map_err(|e| TransportError::Socket(e.to_string()))?;
            }

            _ = next_tick(&mut ticker) => {
                log::trace!("Sending keep-alive ping");
                writer
                    .send(Message::Text(wire::ping_frame().into()))
                    .await
                    .map_err(|e| TransportError::Socket(e.to_string()))?;
            }
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy() {
        let p = ReconnectPolicy::Fixed(Duration::from_secs(5));
        assert_eq!(p.delay(0), Duration::from_secs(5));
        assert_eq!(p.delay(100), Duration::from_secs(5));
        assert_eq!(ReconnectPolicy::default(), p);
    }

    #[test]
    fn test_exponential_policy_caps() {
        let p = ReconnectPolicy::Exponential {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(5),
        };
        assert_eq!(p.delay(0), Duration::from_millis(250));
        assert_eq!(p.delay(1), Duration::from_millis(500));
        assert_eq!(p.delay(3), Duration::from_secs(2));
        assert_eq!(p.delay(5), Duration::from_secs(5));
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_channel_url() {
        let config = TransportConfig::for_testing("ws://localhost:8000/");
        assert_eq!(
            config.channel_url(&Identity::new("0xAbC")),
            "ws://localhost:8000/ws/0xAbC"
        );
        assert_eq!(
            config.channel_url(&Identity::anonymous()),
            "ws://localhost:8000/ws/anonymous"
        );
        assert_eq!(
            config.channel_url(&Identity::new("a b/c")),
            "ws://localhost:8000/ws/a%20b%2Fc"
        );
    }

    #[tokio::test]
    async fn test_initial_state() {
        let manager = ConnectionManager::new(TransportConfig::for_testing("ws://127.0.0.1:1"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.identity().is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let manager = ConnectionManager::new(TransportConfig::for_testing("ws://127.0.0.1:1"));
        assert!(matches!(
            manager.send("{}").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut manager = ConnectionManager::new(TransportConfig::for_testing("ws://127.0.0.1:1"));
        assert!(manager.take_event_rx().is_some());
        assert!(manager.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_retries() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut manager =
            ConnectionManager::new(TransportConfig::for_testing(format!("ws://127.0.0.1:{port}")));
        let mut rx = manager.take_event_rx().unwrap();
        manager.connect(Identity::anonymous()).await;

        // Connecting, Disconnected, Connecting again after the retry delay.
        let mut seen = Vec::new();
        while seen.len() < 3 {
            let evt = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let TransportEvent::StateChanged(s) = evt {
                seen.push(s);
            }
        }
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnected,
                ConnectionState::Connecting
            ]
        );

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
