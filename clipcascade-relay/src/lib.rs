use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clipcascade_core::{
    DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_PEERS_PER_ROOM, PeerId, RELAY_PATH, RoomId,
    SIGNALING_PATH, SignalMessage, StompFrame, room_id_from_cookie,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// Pongs for client pings are only flushed when the write half sends
// something, so the writer pings on its own schedule.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const STOMP_OVERHEAD_BYTES: usize = 4 * 1024;

type ConnectionId = u64;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_message_bytes: usize,
    pub max_peers_per_room: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_peers_per_room: DEFAULT_MAX_PEERS_PER_ROOM,
        }
    }
}

#[derive(Debug, Clone)]
struct BrokerClient {
    tx: mpsc::UnboundedSender<Message>,
    subscriptions: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct RelayState {
    broker_rooms: HashMap<RoomId, HashMap<ConnectionId, BrokerClient>>,
    signaling_rooms: HashMap<RoomId, HashMap<PeerId, mpsc::UnboundedSender<Message>>>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    config: Arc<RelayConfig>,
    next_id: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RelayConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            config: Arc::new(config),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(RELAY_PATH, get(relay_handler))
        .route(SIGNALING_PATH, get(signaling_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

fn room_from_headers(headers: &HeaderMap) -> Result<RoomId, Response> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .filter(|cookie| !cookie.trim().is_empty())
        .map(room_id_from_cookie)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing session cookie").into_response())
}

async fn relay_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let room_id = match room_from_headers(&headers) {
        Ok(room_id) => room_id,
        Err(response) => return response,
    };
    let max_frame = state.config.max_message_bytes + STOMP_OVERHEAD_BYTES;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_broker_socket(state, room_id, socket).await {
                warn!("broker session ended with error: {}", err);
            }
        })
}

async fn signaling_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let room_id = match room_from_headers(&headers) {
        Ok(room_id) => room_id,
        Err(response) => return response,
    };
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = handle_signaling_socket(state, room_id, socket).await {
            warn!("signaling session ended with error: {}", err);
        }
    })
}

fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
) -> (mpsc::UnboundedSender<Message>, JoinHandle<()>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (outbound_tx, task)
}

fn stomp_message(frame: &StompFrame) -> Message {
    Message::Text(frame.encode().into())
}

async fn next_stomp_frame(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> Result<StompFrame, String> {
    while let Some(next) = receiver.next().await {
        match next.map_err(|err| err.to_string())? {
            Message::Text(text) => {
                if let Some(frame) =
                    StompFrame::decode(text.as_str()).map_err(|err| err.to_string())?
                {
                    return Ok(frame);
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    Err("client disconnected before CONNECT".to_owned())
}

async fn handle_broker_socket(
    state: AppState,
    room_id: RoomId,
    socket: WebSocket,
) -> Result<(), String> {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, send_task) = spawn_writer(ws_sender);

    let connect = next_stomp_frame(&mut ws_receiver).await?;
    if !matches!(connect.command.as_str(), "CONNECT" | "STOMP") {
        let _ = outbound_tx.send(stomp_message(&StompFrame::error(
            "first frame must be CONNECT",
        )));
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_task.abort();
        return Err(format!("unexpected first frame {}", connect.command));
    }
    let _ = outbound_tx.send(stomp_message(&StompFrame::connected()));

    let connection_id = state.next_id();
    register_broker_client(&state, &room_id, connection_id, outbound_tx.clone()).await;
    info!(connection_id, "broker client joined room {}", room_id);

    let mut rate_limiter = TokenBucket::new(24.0, 12.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };

        let frame = match StompFrame::decode(text.as_str()) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                warn!(connection_id, "failed to decode frame: {}", err);
                continue;
            }
        };

        match frame.command.as_str() {
            "SUBSCRIBE" => {
                let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination"))
                else {
                    warn!(connection_id, "SUBSCRIBE without id or destination");
                    continue;
                };
                add_subscription(&state, &room_id, connection_id, id, destination).await;
            }
            "UNSUBSCRIBE" => {
                if let Some(id) = frame.get("id") {
                    remove_subscription(&state, &room_id, connection_id, id).await;
                }
            }
            "SEND" => {
                if frame.body.len() > state.config.max_message_bytes {
                    warn!(
                        connection_id,
                        size = frame.body.len(),
                        "dropping oversized message"
                    );
                    continue;
                }
                if !rate_limiter.consume(1.0) {
                    warn!(connection_id, "rate limit exceeded");
                    continue;
                }
                forward_to_subscribers(&state, &room_id, connection_id, &frame.body).await;
            }
            "DISCONNECT" => break,
            other => debug!(connection_id, "ignoring {} frame", other),
        }
    }

    unregister_broker_client(&state, &room_id, connection_id).await;
    send_task.abort();
    info!(connection_id, "broker client left room {}", room_id);
    Ok(())
}

async fn register_broker_client(
    state: &AppState,
    room_id: &RoomId,
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
) {
    let mut relay = state.inner.write().await;
    relay
        .broker_rooms
        .entry(room_id.clone())
        .or_default()
        .insert(
            connection_id,
            BrokerClient {
                tx,
                subscriptions: Vec::new(),
            },
        );
}

async fn add_subscription(
    state: &AppState,
    room_id: &RoomId,
    connection_id: ConnectionId,
    id: &str,
    destination: &str,
) {
    let mut relay = state.inner.write().await;
    if let Some(client) = relay
        .broker_rooms
        .get_mut(room_id)
        .and_then(|room| room.get_mut(&connection_id))
    {
        client.subscriptions.retain(|(existing, _)| existing != id);
        client
            .subscriptions
            .push((id.to_owned(), destination.to_owned()));
    }
}

async fn remove_subscription(
    state: &AppState,
    room_id: &RoomId,
    connection_id: ConnectionId,
    id: &str,
) {
    let mut relay = state.inner.write().await;
    if let Some(client) = relay
        .broker_rooms
        .get_mut(room_id)
        .and_then(|room| room.get_mut(&connection_id))
    {
        client.subscriptions.retain(|(existing, _)| existing != id);
    }
}

async fn unregister_broker_client(state: &AppState, room_id: &RoomId, connection_id: ConnectionId) {
    let mut relay = state.inner.write().await;
    if let Some(room) = relay.broker_rooms.get_mut(room_id) {
        room.remove(&connection_id);
        if room.is_empty() {
            relay.broker_rooms.remove(room_id);
        }
    }
}

async fn forward_to_subscribers(
    state: &AppState,
    room_id: &RoomId,
    sender: ConnectionId,
    body: &str,
) {
    let recipients = {
        let relay = state.inner.read().await;
        relay
            .broker_rooms
            .get(room_id)
            .map(|room| {
                room.iter()
                    .filter(|(connection_id, _)| **connection_id != sender)
                    .map(|(_, client)| client.clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    };

    for client in recipients {
        for (subscription, destination) in &client.subscriptions {
            let message_id = state.next_id().to_string();
            let frame = StompFrame::message(subscription, &message_id, destination, body);
            let _ = client.tx.send(stomp_message(&frame));
        }
    }
}

async fn handle_signaling_socket(
    state: AppState,
    room_id: RoomId,
    socket: WebSocket,
) -> Result<(), String> {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, send_task) = spawn_writer(ws_sender);
    let peer_id: PeerId = Uuid::new_v4().to_string();

    if let Err(err) = register_peer(&state, &room_id, &peer_id, outbound_tx.clone()).await {
        send_task.abort();
        return Err(err);
    }

    let assigned = SignalMessage::AssignedId {
        peer_id: peer_id.clone(),
    };
    match assigned.encode() {
        Ok(text) => {
            let _ = outbound_tx.send(Message::Text(text.into()));
        }
        Err(err) => error!("failed to serialize ASSIGNED_ID: {}", err),
    }
    broadcast_peer_list(&state, &room_id).await;
    info!(peer_id = %peer_id, "peer joined signaling room {}", room_id);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => continue,
        };

        let signal = match SignalMessage::decode(text.as_str()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(peer_id = %peer_id, "dropping signaling message: {}", err);
                continue;
            }
        };

        let Some(to_peer_id) = signal.to_peer_id() else {
            warn!(peer_id = %peer_id, "client sent a server-only signaling message");
            continue;
        };
        if signal.from_peer_id() != Some(peer_id.as_str()) {
            warn!(peer_id = %peer_id, "dropping signaling message with spoofed sender");
            continue;
        }
        forward_signal(&state, &room_id, to_peer_id, text.as_str()).await;
    }

    unregister_peer(&state, &room_id, &peer_id).await;
    send_task.abort();
    info!(peer_id = %peer_id, "peer left signaling room {}", room_id);
    Ok(())
}

async fn register_peer(
    state: &AppState,
    room_id: &RoomId,
    peer_id: &PeerId,
    tx: mpsc::UnboundedSender<Message>,
) -> Result<(), String> {
    let mut relay = state.inner.write().await;
    let room = relay.signaling_rooms.entry(room_id.clone()).or_default();
    if room.len() >= state.config.max_peers_per_room {
        return Err(format!(
            "room {} is full (max {})",
            room_id, state.config.max_peers_per_room
        ));
    }
    room.insert(peer_id.clone(), tx);
    Ok(())
}

async fn unregister_peer(state: &AppState, room_id: &RoomId, peer_id: &PeerId) {
    {
        let mut relay = state.inner.write().await;
        if let Some(room) = relay.signaling_rooms.get_mut(room_id) {
            room.remove(peer_id);
            if room.is_empty() {
                relay.signaling_rooms.remove(room_id);
            }
        }
    }
    broadcast_peer_list(state, room_id).await;
}

async fn broadcast_peer_list(state: &AppState, room_id: &RoomId) {
    let (peers, recipients) = {
        let relay = state.inner.read().await;
        let Some(room) = relay.signaling_rooms.get(room_id) else {
            return;
        };
        let mut peers = room.keys().cloned().collect::<Vec<_>>();
        peers.sort();
        (peers, room.values().cloned().collect::<Vec<_>>())
    };

    let text = match (SignalMessage::PeerList { peers }).encode() {
        Ok(text) => text,
        Err(err) => {
            error!("failed to serialize PEER_LIST: {}", err);
            return;
        }
    };
    for tx in recipients {
        let _ = tx.send(Message::Text(text.clone().into()));
    }
}

async fn forward_signal(state: &AppState, room_id: &RoomId, to_peer_id: &str, text: &str) {
    let recipient = {
        let relay = state.inner.read().await;
        relay
            .signaling_rooms
            .get(room_id)
            .and_then(|room| room.get(to_peer_id))
            .cloned()
    };
    match recipient {
        Some(tx) => {
            let _ = tx.send(Message::Text(text.to_owned().into()));
        }
        None => debug!("signaling target {} is not in room {}", to_peer_id, room_id),
    }
}
