//! BoardLink WebSocket Relay Server
//!
//! A development relay that keeps boards in memory, assigns ids and
//! broadcasts every accepted change to all subscribers of the board topic,
//! the sender included.
//!
//! ## Protocol
//!
//! Frames are JSON text with the following format:
//! ```json
//! { "type": "subscribe", "topic": "/topic/board/1" }
//! { "type": "publish", "destination": "/app/board/1/item.update", "payload": { ... } }
//! { "type": "message", "topic": "/topic/board/1", "payload": { "type": "UPDATE_ITEM", "data": { ... } } }
//! ```

mod board;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, header::AUTHORIZATION},
    response::IntoResponse,
    routing::get,
};
use boardlink_core::config::{DEFAULT_DESTINATION_PREFIX, DEFAULT_TOPIC_PREFIX};
use boardlink_core::model::BoardId;
use boardlink_core::protocol::{
    ClientFrame, Destination, ERROR_TYPE, SERVER_ERRORS_TOPIC, ServerFrame, board_topic,
    parse_board_topic,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::board::{Board, BoardError};

/// Server configuration
const CHANNEL_CAPACITY: usize = 256;
const DEFAULT_ADDR: &str = "0.0.0.0:3030";
const ADDR_ENV: &str = "BOARDLINK_ADDR";
const WRITE_TOKEN_ENV: &str = "BOARDLINK_WRITE_TOKEN";
const ACCESS_DENIED: &str = "Access denied: a valid write token is required";

/// What a room's channel carries
#[derive(Debug, Clone)]
enum RoomEvent {
    /// Delivered to every subscriber
    Broadcast(Value),
    /// Sync reply for one peer, ordered with the broadcasts around it
    Snapshot { peer: String, payload: Value },
}

impl RoomEvent {
    fn payload_for(self, peer_id: &str) -> Option<Value> {
        match self {
            RoomEvent::Broadcast(payload) => Some(payload),
            RoomEvent::Snapshot { peer, payload } if peer == peer_id => Some(payload),
            RoomEvent::Snapshot { .. } => None,
        }
    }
}

/// Board state plus its broadcast channel
struct Room {
    tx: broadcast::Sender<RoomEvent>,
    board: Board,
}

impl Room {
    fn new(board_id: BoardId) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            board: Board::new(board_id),
        }
    }
}

/// Shared application state
struct AppState {
    rooms: DashMap<BoardId, Room>,
    /// When set, publishes other than sync require this bearer token.
    write_token: Option<String>,
}

impl AppState {
    fn new(write_token: Option<String>) -> Self {
        Self {
            rooms: DashMap::new(),
            write_token,
        }
    }

    fn can_write(&self, token: Option<&str>) -> bool {
        match &self.write_token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    /// Receive every event broadcast on a board
    fn subscribe(&self, board_id: BoardId) -> broadcast::Receiver<RoomEvent> {
        self.rooms
            .entry(board_id)
            .or_insert_with(|| Room::new(board_id))
            .tx
            .subscribe()
    }

    /// Apply a publish and broadcast the resulting events
    fn publish(&self, board_id: BoardId, destination: Destination, payload: Value) -> Result<usize, BoardError> {
        let mut room = self.rooms.entry(board_id).or_insert_with(|| Room::new(board_id));
        let events = room.board.apply(destination, payload)?;
        for event in &events {
            let value = serde_json::to_value(event)?;
            let _ = room.tx.send(RoomEvent::Broadcast(value));
        }
        Ok(events.len())
    }

    /// Current contents as an INITIAL_DATA payload
    fn snapshot(&self, board_id: BoardId) -> Result<Value, serde_json::Error> {
        let room = self.rooms.entry(board_id).or_insert_with(|| Room::new(board_id));
        serde_json::to_value(room.board.snapshot())
    }

    /// Queue a snapshot for `peer` on the room channel. The room stays locked
    /// while it is taken, so it lands between the same broadcasts it reflects.
    fn queue_snapshot(&self, board_id: BoardId, peer: &str) -> Result<(), serde_json::Error> {
        let room = self.rooms.entry(board_id).or_insert_with(|| Room::new(board_id));
        let payload = serde_json::to_value(room.board.snapshot())?;
        let _ = room.tx.send(RoomEvent::Snapshot { peer: peer.to_string(), payload });
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "boardlink_server=info,tower_http=info".into()),
        )
        .init();

    let addr: SocketAddr = std::env::var(ADDR_ENV)
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()?;
    let write_token = std::env::var(WRITE_TOKEN_ENV).ok().filter(|t| !t.is_empty());
    if write_token.is_some() {
        info!("Write access requires a bearer token");
    }

    let state = Arc::new(AppState::new(write_token));

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("BoardLink relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Index page
async fn index() -> &'static str {
    "BoardLink Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let can_write = state.can_write(bearer_token(&headers).as_deref());
    ws.on_upgrade(move |socket| handle_socket(socket, state, can_write))
}

/// One connected client
struct Peer {
    id: String,
    can_write: bool,
    state: Arc<AppState>,
    out: mpsc::UnboundedSender<ServerFrame>,
    /// Forwarding task per subscribed board topic
    forwards: HashMap<String, JoinHandle<()>>,
    errors_subscribed: bool,
}

impl Peer {
    fn send(&self, frame: ServerFrame) {
        let _ = self.out.send(frame);
    }

    /// Deliver an error on the error queue if subscribed, else as an error frame
    fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("Error for {}: {}", self.id, message);
        if self.errors_subscribed {
            self.send(ServerFrame::Message {
                topic: SERVER_ERRORS_TOPIC.to_string(),
                payload: json!({ "type": ERROR_TYPE, "message": message }),
            });
        } else {
            self.send(ServerFrame::Error { message });
        }
    }

    fn handle(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Subscribe { topic } => self.subscribe(topic),
            ClientFrame::Unsubscribe { topic } => {
                if topic == SERVER_ERRORS_TOPIC {
                    self.errors_subscribed = false;
                } else if let Some(task) = self.forwards.remove(&topic) {
                    task.abort();
                    info!("Peer {} unsubscribed from {}", self.id, topic);
                }
            }
            ClientFrame::Publish { destination, payload } => self.publish(&destination, payload),
        }
    }

    fn subscribe(&mut self, topic: String) {
        if topic == SERVER_ERRORS_TOPIC {
            self.errors_subscribed = true;
            return;
        }
        let Some(board_id) = parse_board_topic(DEFAULT_TOPIC_PREFIX, &topic) else {
            self.report_error(format!("Unknown topic: {}", topic));
            return;
        };
        if self.forwards.contains_key(&topic) {
            return;
        }

        let mut rx = self.state.subscribe(board_id);
        let out = self.out.clone();
        let task_topic = topic.clone();
        let peer_id = self.id.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(payload) = event.payload_for(&peer_id) else { continue };
                        let frame = ServerFrame::Message { topic: task_topic.clone(), payload };
                        if out.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Peer {} lagged {} messages on {}", peer_id, skipped, task_topic);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwards.insert(topic.clone(), task);
        info!("Peer {} subscribed to {}", self.id, topic);
    }

    fn publish(&self, destination: &str, payload: Value) {
        let Some((board_id, target)) = Destination::parse(DEFAULT_DESTINATION_PREFIX, destination) else {
            self.report_error(format!("Unknown destination: {}", destination));
            return;
        };

        if target == Destination::Sync {
            let topic = board_topic(DEFAULT_TOPIC_PREFIX, board_id);
            let result = if self.forwards.contains_key(&topic) {
                self.state.queue_snapshot(board_id, &self.id)
            } else {
                self.state
                    .snapshot(board_id)
                    .map(|payload| self.send(ServerFrame::Message { topic, payload }))
            };
            if let Err(e) = result {
                self.report_error(format!("Snapshot failed: {}", e));
            }
            return;
        }

        if !self.can_write {
            self.report_error(ACCESS_DENIED);
            return;
        }

        match self.state.publish(board_id, target, payload) {
            Ok(count) => debug!("Peer {} published to {} ({} events)", self.id, destination, count),
            Err(e) => self.report_error(e.to_string()),
        }
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, can_write: bool) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New connection: {} (write: {})", peer_id, can_write);

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let mut peer = Peer {
        id: peer_id.clone(),
        can_write,
        state,
        out: out_tx,
        forwards: HashMap::new(),
        errors_subscribed: false,
    };

    loop {
        tokio::select! {
            // Handle incoming frames from client
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => peer.handle(frame),
                            Err(e) => peer.report_error(format!("Invalid frame: {}", e)),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Ok(_)) => {} // Ignore binary, ping/pong
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer_id, e);
                        break;
                    }
                }
            }

            // Deliver frames queued for this client
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode frame for {}: {}", peer_id, e),
                }
            }
        }
    }

    // Cleanup on disconnect
    for (_, task) in peer.forwards.drain() {
        task.abort();
    }
    info!("Connection closed: {}", peer_id);
}
