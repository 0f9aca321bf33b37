//! Wire protocol: per-board events, publish destinations and the socket envelope.
//!
//! ## Board events
//!
//! Every board topic carries JSON objects tagged by `type`:
//! ```json
//! { "type": "CREATE_ITEM", "data": { ...item... } }
//! { "type": "DELETE_ITEM", "itemId": 42 }
//! { "type": "INITIAL_DATA", "data": { "items": [...], "connectors": [...] } }
//! { "type": "ERROR", "message": "Access denied" }
//! ```
//!
//! ## Socket envelope
//!
//! Board events travel inside a thin envelope that routes them to topics:
//! ```json
//! { "type": "subscribe", "topic": "/topic/board/1" }
//! { "type": "publish", "destination": "/app/board/1/item.update", "payload": { ... } }
//! { "type": "message", "topic": "/topic/board/1", "payload": { ... } }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{BoardId, Connector, ConnectorId, Item, ItemId};

/// Topic on which the server pushes connection-level errors.
pub const SERVER_ERRORS_TOPIC: &str = "/user/queue/errors";

/// Event types a board topic may carry, besides `ERROR`.
pub const EVENT_TYPES: [&str; 7] = [
    "CREATE_ITEM",
    "UPDATE_ITEM",
    "DELETE_ITEM",
    "CREATE_CONNECTOR",
    "UPDATE_CONNECTOR",
    "DELETE_CONNECTOR",
    "INITIAL_DATA",
];

/// Type tag of error frames.
pub const ERROR_TYPE: &str = "ERROR";

/// Errors decoding an inbound frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame has no type tag")]
    MissingType,
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} event: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("non-finite geometry in {0} event")]
    NonFinite(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Full board contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialData {
    /// Bare item list, as returned by the board fetch.
    Items(Vec<Item>),
    /// `{ "items": [...], "connectors": [...] }`
    Full {
        items: Vec<Item>,
        #[serde(default)]
        connectors: Vec<Connector>,
    },
}

impl InitialData {
    pub fn into_parts(self) -> (Vec<Item>, Vec<Connector>) {
        match self {
            InitialData::Full { items, connectors } => (items, connectors),
            InitialData::Items(items) => (items, Vec::new()),
        }
    }
}

/// An authoritative event broadcast on a board topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardEvent {
    CreateItem { data: Item },
    UpdateItem { data: Item },
    DeleteItem {
        #[serde(rename = "itemId")]
        item_id: ItemId,
    },
    CreateConnector { data: Connector },
    UpdateConnector { data: Connector },
    DeleteConnector {
        #[serde(rename = "connectorId")]
        connector_id: ConnectorId,
    },
    InitialData { data: InitialData },
}

impl BoardEvent {
    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            BoardEvent::CreateItem { .. } => "CREATE_ITEM",
            BoardEvent::UpdateItem { .. } => "UPDATE_ITEM",
            BoardEvent::DeleteItem { .. } => "DELETE_ITEM",
            BoardEvent::CreateConnector { .. } => "CREATE_CONNECTOR",
            BoardEvent::UpdateConnector { .. } => "UPDATE_CONNECTOR",
            BoardEvent::DeleteConnector { .. } => "DELETE_CONNECTOR",
            BoardEvent::InitialData { .. } => "INITIAL_DATA",
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            BoardEvent::CreateItem { data } | BoardEvent::UpdateItem { data } => data.is_finite(),
            BoardEvent::InitialData { data } => match data {
                InitialData::Full { items, .. } | InitialData::Items(items) => {
                    items.iter().all(Item::is_finite)
                }
            },
            _ => true,
        }
    }
}

/// Error frame as emitted by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self { kind: ERROR_TYPE.to_string(), message: message.into(), data: None }
    }
}

/// Result of decoding a topic payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(BoardEvent),
    /// Raw error frame, left for the error channel to classify.
    Error(Value),
}

/// Decode a payload received on a board or error topic.
///
/// Bare strings are treated as error frames; so is anything tagged `ERROR`.
pub fn decode_payload(payload: &Value) -> Result<Inbound, ProtocolError> {
    if payload.is_string() {
        return Ok(Inbound::Error(payload.clone()));
    }
    let kind = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if kind == ERROR_TYPE {
        return Ok(Inbound::Error(payload.clone()));
    }
    if !EVENT_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    let event: BoardEvent = serde_json::from_value(payload.clone()).map_err(|source| {
        ProtocolError::Malformed { kind: kind.to_string(), source }
    })?;
    if !event.is_finite() {
        return Err(ProtocolError::NonFinite(kind.to_string()));
    }
    Ok(Inbound::Event(event))
}

/// Outbound publish targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    ItemCreate,
    ItemUpdate,
    ItemDelete,
    ConnectorCreate,
    ConnectorUpdate,
    ConnectorDelete,
    /// Ask the server to push `INITIAL_DATA` for the board.
    Sync,
}

impl Destination {
    pub const ALL: [Destination; 7] = [
        Destination::ItemCreate,
        Destination::ItemUpdate,
        Destination::ItemDelete,
        Destination::ConnectorCreate,
        Destination::ConnectorUpdate,
        Destination::ConnectorDelete,
        Destination::Sync,
    ];

    fn suffix(&self) -> &'static str {
        match self {
            Destination::ItemCreate => "item.create",
            Destination::ItemUpdate => "item.update",
            Destination::ItemDelete => "item.delete",
            Destination::ConnectorCreate => "connector.create",
            Destination::ConnectorUpdate => "connector.update",
            Destination::ConnectorDelete => "connector.delete",
            Destination::Sync => "sync",
        }
    }

    /// Full destination path, e.g. `/app/board/4/item.update`.
    pub fn path(&self, prefix: &str, board_id: BoardId) -> String {
        format!("{}/board/{}/{}", prefix.trim_end_matches('/'), board_id, self.suffix())
    }

    /// Inverse of [`Destination::path`].
    pub fn parse(prefix: &str, path: &str) -> Option<(BoardId, Destination)> {
        let rest = path.strip_prefix(prefix.trim_end_matches('/'))?;
        let rest = rest.strip_prefix("/board/")?;
        let (board, suffix) = rest.split_once('/')?;
        let board_id = board.parse().ok()?;
        let destination = Destination::ALL.into_iter().find(|d| d.suffix() == suffix)?;
        Some((board_id, destination))
    }
}

/// Topic for a board's events, e.g. `/topic/board/4`.
pub fn board_topic(prefix: &str, board_id: BoardId) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), board_id)
}

/// Inverse of [`board_topic`].
pub fn parse_board_topic(prefix: &str, topic: &str) -> Option<BoardId> {
    topic
        .strip_prefix(prefix.trim_end_matches('/'))?
        .strip_prefix('/')?
        .parse()
        .ok()
}

/// Body of an item delete publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteItemRequest {
    pub item_id: ItemId,
}

/// Body of a connector delete publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteConnectorRequest {
    pub connector_id: ConnectorId,
}

/// Body of a resync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub board_id: BoardId,
}

/// Frames sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { destination: String, payload: Value },
}

/// Frames received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A payload published on a subscribed topic.
    Message { topic: String, payload: Value },
    /// Connection-level error (bad frame, rejected subscription).
    Error { message: String },
}
