//! Gateway connection ownership: one logical WebSocket per manager, with
//! heartbeat, exponential-backoff reconnection and an outbound dispatch
//! queue that absorbs frames while the socket is down.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use futures::{FutureExt, SinkExt, StreamExt};
use shared::protocol::{ClientFrame, GatewayEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch, Mutex, Notify},
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

use crate::error::ClientError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const NOTICE_CHANNEL_CAPACITY: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures::stream::SplitSink<WsStream, Message>;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Base reconnect delay; the backoff curve is
    /// `min(base * 2^(attempt-1), base * 10)`.
    pub base_interval: Duration,
    /// Reconnection stops after this many consecutive failed attempts until
    /// a manual trigger resets the counter.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 10,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Reconnect delay for the given 1-based attempt number.
pub fn reconnect_delay(config: &ConnectionConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = config.base_interval.saturating_mul(1 << exponent);
    delay.min(config.base_interval.saturating_mul(10))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

/// Connection lifecycle signals surfaced to the owning client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionNotice {
    Opened,
    Closed,
    ReconnectsExhausted { attempts: u32 },
}

/// Sole owner of the gateway socket for a session. Consumers subscribe to
/// its event and notice channels; none of them may open a second socket.
pub struct ConnectionManager {
    config: ConnectionConfig,
    queue: Mutex<VecDeque<ClientFrame>>,
    queue_wake: Notify,
    reconnect_wake: Notify,
    session_close: Notify,
    offline: AtomicBool,
    attempts: AtomicU32,
    // Bumped on every connect/disconnect; a task observing a stale epoch
    // must not touch shared state.
    epoch: AtomicU64,
    status_tx: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<GatewayEvent>,
    notices: broadcast::Sender<ConnectionNotice>,
    // std mutex so teardown works from Drop impls; never held across awaits.
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ConnectionStatus::Closed);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            queue: Mutex::new(VecDeque::new()),
            queue_wake: Notify::new(),
            reconnect_wake: Notify::new(),
            session_close: Notify::new(),
            offline: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            status_tx,
            events,
            notices,
            supervisor: std::sync::Mutex::new(None),
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status(), ConnectionStatus::Open)
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.notices.subscribe()
    }

    /// Queues a frame for transmission. Frames enqueued while the socket is
    /// down are flushed in FIFO order the moment it reopens; nothing is
    /// dropped silently.
    pub async fn send(&self, frame: ClientFrame) {
        self.queue.lock().await.push_back(frame);
        self.queue_wake.notify_one();
    }

    /// Opens the gateway connection and keeps it alive until
    /// [`disconnect`](Self::disconnect). The bearer token rides on the
    /// connection URI; a missing token is a fatal local precondition and is
    /// not retried.
    pub async fn connect(self: &Arc<Self>, endpoint: &str, token: &str) -> Result<(), ClientError> {
        if token.is_empty() {
            return Err(ClientError::MissingToken);
        }
        let ws_url = gateway_url(endpoint, token)?;
        self.disconnect();
        self.offline.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.run(ws_url, epoch).await });
        if let Some(previous) = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle)
        {
            previous.abort();
        }
        Ok(())
    }

    /// Deterministic teardown: aborts the supervisor (which cancels the
    /// heartbeat and backoff timers with it) and invalidates the epoch so
    /// any late callback is a no-op.
    pub fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }
        let _ = self.status_tx.send(ConnectionStatus::Closed);
    }

    /// Eager reconnect trigger (app refocus, window focus, network-online
    /// event). Resets the attempt counter and wakes the supervisor out of
    /// its backoff or exhausted wait.
    pub fn trigger_reconnect(&self) {
        self.offline.store(false, Ordering::SeqCst);
        self.attempts.store(0, Ordering::SeqCst);
        self.reconnect_wake.notify_one();
    }

    /// Explicit network-offline signal: tear the socket down now instead of
    /// waiting for a heartbeat to fail. Reconnection resumes on
    /// [`trigger_reconnect`](Self::trigger_reconnect).
    pub fn handle_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
        self.session_close.notify_one();
        info!("gateway: network offline, closing socket");
    }

    async fn run(self: Arc<Self>, ws_url: String, epoch: u64) {
        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let _ = self.status_tx.send(ConnectionStatus::Connecting);
            match connect_async(&ws_url).await {
                Ok((stream, _)) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    let _ = self.status_tx.send(ConnectionStatus::Open);
                    let _ = self.notices.send(ConnectionNotice::Opened);
                    info!("gateway: connection open");
                    let reason = self.run_session(stream, epoch).await;
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return;
                    }
                    let _ = self.status_tx.send(ConnectionStatus::Closed);
                    let _ = self.notices.send(ConnectionNotice::Closed);
                    warn!(reason, "gateway: connection closed");
                }
                Err(err) => {
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return;
                    }
                    let _ = self.status_tx.send(ConnectionStatus::Closed);
                    warn!("gateway: connect failed: {err}");
                }
            }

            if self.offline.load(Ordering::SeqCst) {
                self.reconnect_wake.notified().await;
                continue;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.max_reconnect_attempts {
                let _ = self.notices.send(ConnectionNotice::ReconnectsExhausted {
                    attempts: self.config.max_reconnect_attempts,
                });
                error!(
                    attempts = self.config.max_reconnect_attempts,
                    "gateway: reconnect attempts exhausted"
                );
                self.reconnect_wake.notified().await;
                continue;
            }
            let delay = reconnect_delay(&self.config, attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "gateway: scheduling reconnect"
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.reconnect_wake.notified() => {}
            }
        }
    }

    async fn run_session(&self, stream: WsStream, epoch: u64) -> &'static str {
        let (mut sink, mut reader) = stream.split();

        // Consume a close permit left over from an offline signal that
        // arrived while no session was up.
        self.session_close.notified().now_or_never();

        // Everything queued while the socket was down goes out first.
        if self.flush_queue(&mut sink).await.is_err() {
            return "flush failed";
        }

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return "superseded";
            }
            tokio::select! {
                inbound = reader.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if !self.handle_text(&text, &mut sink).await {
                                return "pong send failed";
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                return "pong send failed";
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return "closed by peer",
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("gateway: receive failed: {err}");
                            return "transport error";
                        }
                    }
                }
                _ = self.queue_wake.notified() => {
                    if self.flush_queue(&mut sink).await.is_err() {
                        return "send failed";
                    }
                }
                _ = heartbeat.tick() => {
                    let ping = ClientFrame::Ping { ts: Utc::now().timestamp_millis() };
                    if self.transmit(&mut sink, &ping).await.is_err() {
                        return "heartbeat send failed";
                    }
                }
                _ = self.session_close.notified() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "offline teardown";
                }
            }
        }
    }

    /// Parses one inbound text frame. `ping` is answered inline and
    /// `pong` swallowed; neither reaches the application layer. Malformed
    /// payloads are dropped, never fatal. Returns false only when the
    /// inline pong could not be written.
    async fn handle_text(&self, text: &str, sink: &mut WsSink) -> bool {
        match serde_json::from_str::<GatewayEvent>(text) {
            Ok(GatewayEvent::Ping { ts }) => self
                .transmit(sink, &ClientFrame::Pong { ts })
                .await
                .is_ok(),
            Ok(GatewayEvent::Pong { .. }) => true,
            Ok(event) => {
                let _ = self.events.send(event);
                true
            }
            Err(err) => {
                warn!("gateway: dropping malformed payload: {err}");
                true
            }
        }
    }

    /// Drains the dispatch queue in FIFO order. A frame is only dequeued
    /// after a successful handoff; on a write failure it goes back to the
    /// front and the session ends, leaving the rest queued for the next
    /// connection.
    async fn flush_queue(&self, sink: &mut WsSink) -> Result<()> {
        loop {
            let frame = { self.queue.lock().await.pop_front() };
            let Some(frame) = frame else {
                return Ok(());
            };
            if let Err(err) = self.transmit(sink, &frame).await {
                self.queue.lock().await.push_front(frame);
                return Err(err);
            }
        }
    }

    async fn transmit(&self, sink: &mut WsSink, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }
}

fn gateway_url(endpoint: &str, token: &str) -> Result<String, ClientError> {
    let ws_base = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        endpoint.to_string()
    } else {
        return Err(ClientError::Transport(format!(
            "endpoint must start with http(s):// or ws(s)://, got {endpoint}"
        )));
    };
    let token: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    Ok(format!("{ws_base}/ws?token={token}"))
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
