use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::{ChatId, UserId};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;

const WAIT: Duration = Duration::from_secs(3);

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        base_interval: Duration::from_millis(10),
        max_reconnect_attempts: 10,
        heartbeat_interval: Duration::from_secs(60),
    }
}

#[derive(Clone)]
struct GatewayState {
    frames: mpsc::UnboundedSender<String>,
    outbound: broadcast::Sender<String>,
    tokens: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

/// Control string that makes the mock server close the socket from its side.
const CLOSE: &str = "__close__";

async fn spawn_gateway_server() -> (
    String,
    mpsc::UnboundedReceiver<String>,
    broadcast::Sender<String>,
    Arc<Mutex<Vec<String>>>,
    Arc<AtomicUsize>,
) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (outbound, _) = broadcast::channel(64);
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let state = GatewayState {
        frames: frames_tx,
        outbound: outbound.clone(),
        tokens: Arc::clone(&tokens),
        connections: Arc::clone(&connections),
    };
    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (
        format!("http://{addr}"),
        frames_rx,
        outbound,
        tokens,
        connections,
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    state
        .tokens
        .lock()
        .await
        .push(params.get("token").cloned().unwrap_or_default());
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut rx = state.outbound.subscribe();
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = state.frames.send(text);
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            outbound = rx.recv() => {
                let Ok(text) = outbound else { continue };
                if text == CLOSE {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(WAIT, rx.recv()).await.expect("frame").expect("open")
}

async fn next_notice(rx: &mut broadcast::Receiver<ConnectionNotice>) -> ConnectionNotice {
    timeout(WAIT, rx.recv()).await.expect("notice").expect("open")
}

#[test]
fn backoff_doubles_then_caps_at_ten_times_base() {
    let config = ConnectionConfig {
        base_interval: Duration::from_millis(1000),
        ..ConnectionConfig::default()
    };
    let delays: Vec<u64> = (1..=6)
        .map(|attempt| reconnect_delay(&config, attempt).as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10000, 10000]);
}

#[test]
fn gateway_url_swaps_scheme_and_encodes_token() {
    assert_eq!(
        gateway_url("http://localhost:3000", "abc").unwrap(),
        "ws://localhost:3000/ws?token=abc"
    );
    assert_eq!(
        gateway_url("https://chat.example.com", "a+b c").unwrap(),
        "wss://chat.example.com/ws?token=a%2Bb+c"
    );
    assert!(gateway_url("ftp://nope", "abc").is_err());
}

#[tokio::test]
async fn connect_without_token_is_fatal_locally() {
    let manager = ConnectionManager::new(fast_config());
    let err = manager.connect("http://127.0.0.1:1", "").await.unwrap_err();
    assert!(matches!(err, ClientError::MissingToken));
}

#[tokio::test]
async fn token_rides_on_the_connection_uri() {
    let (base, _frames, _outbound, tokens, _conns) = spawn_gateway_server().await;
    let manager = ConnectionManager::new(fast_config());
    let mut notices = manager.subscribe_notices();
    manager.connect(&base, "secret-token").await.expect("connect");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);
    assert_eq!(tokens.lock().await.as_slice(), ["secret-token"]);
    manager.disconnect();
}

#[tokio::test]
async fn frames_queued_while_down_flush_in_order_on_open() {
    let (base, mut frames, _outbound, _tokens, _conns) = spawn_gateway_server().await;
    let manager = ConnectionManager::new(fast_config());

    manager
        .send(ClientFrame::JoinChat { chat_id: ChatId(1) })
        .await;
    manager
        .send(ClientFrame::MarkRead { chat_id: ChatId(2) })
        .await;

    let mut notices = manager.subscribe_notices();
    manager.connect(&base, "t").await.expect("connect");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);

    assert_eq!(
        next_frame(&mut frames).await,
        r#"{"type":"join_chat","chat_id":1}"#
    );
    assert_eq!(
        next_frame(&mut frames).await,
        r#"{"type":"mark_read","chat_id":2}"#
    );
    manager.disconnect();
}

#[tokio::test]
async fn server_ping_is_answered_inline_and_never_surfaced() {
    let (base, mut frames, outbound, _tokens, _conns) = spawn_gateway_server().await;
    let manager = ConnectionManager::new(fast_config());
    let mut events = manager.subscribe_events();
    let mut notices = manager.subscribe_notices();
    manager.connect(&base, "t").await.expect("connect");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);

    outbound
        .send(r#"{"type":"ping","ts":42}"#.to_string())
        .expect("push");
    assert_eq!(next_frame(&mut frames).await, r#"{"type":"pong","ts":42}"#);

    // A real event after the ping proves the ping was not forwarded.
    outbound
        .send(r#"{"type":"typing","chat_id":4,"user_id":9,"is_typing":true}"#.to_string())
        .expect("push");
    let event = timeout(WAIT, events.recv()).await.expect("event").expect("open");
    assert_eq!(
        event,
        GatewayEvent::Typing {
            chat_id: ChatId(4),
            user_id: UserId(9),
            is_typing: true,
        }
    );
    manager.disconnect();
}

#[tokio::test]
async fn malformed_payloads_are_dropped_not_fatal() {
    let (base, _frames, outbound, _tokens, _conns) = spawn_gateway_server().await;
    let manager = ConnectionManager::new(fast_config());
    let mut events = manager.subscribe_events();
    let mut notices = manager.subscribe_notices();
    manager.connect(&base, "t").await.expect("connect");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);

    outbound.send("not json at all".to_string()).expect("push");
    outbound
        .send(r#"{"type":"unknown_event","chat_id":1}"#.to_string())
        .expect("push");
    outbound
        .send(r#"{"type":"messages_delivered","chat_id":7}"#.to_string())
        .expect("push");

    let event = timeout(WAIT, events.recv()).await.expect("event").expect("open");
    assert_eq!(event, GatewayEvent::MessagesDelivered { chat_id: ChatId(7) });
    manager.disconnect();
}

#[tokio::test]
async fn reconnects_after_server_side_close() {
    let (base, _frames, outbound, _tokens, conns) = spawn_gateway_server().await;
    let manager = ConnectionManager::new(fast_config());
    let mut notices = manager.subscribe_notices();
    manager.connect(&base, "t").await.expect("connect");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);

    outbound.send(CLOSE.to_string()).expect("push");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Closed);
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);
    assert_eq!(conns.load(Ordering::SeqCst), 2);
    manager.disconnect();
}

#[tokio::test]
async fn offline_parks_until_triggered() {
    let (base, _frames, _outbound, _tokens, conns) = spawn_gateway_server().await;
    let manager = ConnectionManager::new(fast_config());
    let mut notices = manager.subscribe_notices();
    manager.connect(&base, "t").await.expect("connect");
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);

    manager.handle_offline();
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Closed);

    // Parked: no reconnect happens on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(conns.load(Ordering::SeqCst), 1);

    manager.trigger_reconnect();
    assert_eq!(next_notice(&mut notices).await, ConnectionNotice::Opened);
    assert_eq!(conns.load(Ordering::SeqCst), 2);
    manager.disconnect();
}

#[tokio::test]
async fn exhausted_reconnects_surface_and_park() {
    // No server listening: every attempt fails.
    let manager = ConnectionManager::new(ConnectionConfig {
        base_interval: Duration::from_millis(1),
        max_reconnect_attempts: 2,
        heartbeat_interval: Duration::from_secs(60),
    });
    let mut notices = manager.subscribe_notices();
    manager
        .connect("http://127.0.0.1:9", "t")
        .await
        .expect("spawn supervisor");

    let notice = next_notice(&mut notices).await;
    assert_eq!(notice, ConnectionNotice::ReconnectsExhausted { attempts: 2 });
    manager.disconnect();
}
