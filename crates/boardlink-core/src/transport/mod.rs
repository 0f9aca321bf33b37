//! Persistent publish/subscribe transport.
//!
//! [`TransportAdapter`] owns exactly one [`Connection`] and layers topics,
//! handlers and a guarded publish on top of it. The connection does its I/O
//! elsewhere (a worker thread for [`NativeWebSocket`]); the adapter only
//! touches handlers inside [`TransportAdapter::poll`], so every handler runs on
//! the thread that polls.
//!
//! Nothing is buffered across a disconnect. Publishing while not connected is
//! dropped with a log line, and callers resynchronize once `on_ready` fires.

mod memory;
mod native;

pub use memory::{MemoryConnection, MemoryHandle};
pub use native::NativeWebSocket;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::protocol::{ClientFrame, ERROR_TYPE, SERVER_ERRORS_TOPIC, ServerFrame};

/// Transport failures. Recovered by reconnecting; never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid WebSocket URL scheme: {0}")]
    InvalidScheme(String),
    #[error("auth token is not a valid header value")]
    InvalidToken,
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(String),
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub token: Option<String>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
}

/// Check the URL scheme and token before any socket is opened.
pub(crate) fn validate_endpoint(endpoint: &Endpoint) -> Result<(), TransportError> {
    let parsed = url::Url::parse(&endpoint.url)?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(TransportError::InvalidScheme(parsed.scheme().to_string()));
    }
    if let Some(token) = &endpoint.token {
        tungstenite::http::HeaderValue::from_str(&bearer(token))
            .map_err(|_| TransportError::InvalidToken)?;
    }
    Ok(())
}

pub(crate) fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// A state change observed during [`TransportAdapter::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl Transition {
    /// An established connection was lost and is being retried.
    pub fn is_drop(&self) -> bool {
        self.from == ConnectionState::Connected && self.to == ConnectionState::Connecting
    }

    /// The connection became usable.
    pub fn is_ready(&self) -> bool {
        self.to == ConnectionState::Connected
    }
}

/// Raw events produced by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Text(String),
    Error(String),
}

/// A socket that reconnects on its own after `open` until `close`.
pub trait Connection {
    /// Start connecting. Reconnects after drops with the endpoint's delay.
    fn open(&mut self, endpoint: &Endpoint) -> Result<(), TransportError>;

    /// Queue a text frame. Frames racing a drop may be discarded.
    fn send(&self, text: String) -> Result<(), TransportError>;

    /// Drain pending events (non-blocking).
    fn poll_events(&mut self) -> Vec<LinkEvent>;

    /// Stop the connection and any reconnect loop.
    fn close(&mut self);
}

/// Topic handler. Identity is the `Rc` allocation.
pub type Handler = Rc<dyn Fn(&Value)>;

fn same_handler(a: &Handler, b: &Handler) -> bool {
    std::ptr::addr_eq(Rc::as_ptr(a), Rc::as_ptr(b))
}

/// Topic routing and guarded publishing over one connection.
pub struct TransportAdapter<C: Connection> {
    connection: C,
    state: ConnectionState,
    handlers: BTreeMap<String, Vec<Handler>>,
    on_ready: Option<Box<dyn FnMut()>>,
}

impl<C: Connection> TransportAdapter<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            state: ConnectionState::Disconnected,
            handlers: BTreeMap::new(),
            on_ready: None,
        }
    }

    /// Start connecting. `on_ready` runs during `poll` each time the
    /// connection (re)enters [`ConnectionState::Connected`].
    pub fn connect(
        &mut self,
        endpoint: &Endpoint,
        on_ready: impl FnMut() + 'static,
    ) -> Result<(), TransportError> {
        if self.state != ConnectionState::Disconnected {
            return Err(TransportError::AlreadyConnected);
        }
        self.connection.open(endpoint)?;
        self.state = ConnectionState::Connecting;
        self.on_ready = Some(Box::new(on_ready));
        log::info!("Connecting to {}", endpoint.url);
        Ok(())
    }

    /// Register `handler` for `topic`. Returns false if this exact handler
    /// was already registered there.
    pub fn subscribe(&mut self, topic: &str, handler: Handler) -> bool {
        let handlers = self.handlers.entry(topic.to_string()).or_default();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        let first = handlers.is_empty();
        handlers.push(handler);
        if first && self.is_connected() {
            self.send_frame(&ClientFrame::Subscribe { topic: topic.to_string() });
        }
        true
    }

    /// Drop every handler of `topic`.
    pub fn unsubscribe(&mut self, topic: &str) -> bool {
        let removed = self.handlers.remove(topic).is_some();
        if removed && self.is_connected() {
            self.send_frame(&ClientFrame::Unsubscribe { topic: topic.to_string() });
        }
        removed
    }

    /// Topics with at least one handler.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Send `payload` to `destination`. Dropped (and logged) unless connected.
    /// Returns whether the frame was handed to the connection.
    pub fn publish<P: Serialize + ?Sized>(&self, destination: &str, payload: &P) -> bool {
        if !self.is_connected() {
            log::debug!("Dropping publish to {} while {:?}", destination, self.state);
            return false;
        }
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to encode payload for {}: {}", destination, e);
                return false;
            }
        };
        self.send_frame(&ClientFrame::Publish { destination: destination.to_string(), payload })
    }

    fn send_frame(&self, frame: &ClientFrame) -> bool {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode frame: {}", e);
                return false;
            }
        };
        match self.connection.send(text) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Transport send failed: {}", e);
                false
            }
        }
    }

    /// Drain connection events: update state, re-announce subscriptions,
    /// run `on_ready` and dispatch messages to handlers.
    pub fn poll(&mut self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for event in self.connection.poll_events() {
            if self.state == ConnectionState::Disconnected {
                continue;
            }
            match event {
                LinkEvent::Connected => {
                    let from = self.state;
                    self.state = ConnectionState::Connected;
                    log::info!("Transport connected");
                    for topic in self.handlers.keys() {
                        self.send_frame(&ClientFrame::Subscribe { topic: topic.clone() });
                    }
                    if let Some(on_ready) = self.on_ready.as_mut() {
                        on_ready();
                    }
                    transitions.push(Transition { from, to: ConnectionState::Connected });
                }
                LinkEvent::Disconnected => {
                    if self.state == ConnectionState::Connected {
                        log::warn!("Transport connection lost; retrying");
                        self.state = ConnectionState::Connecting;
                        transitions.push(Transition {
                            from: ConnectionState::Connected,
                            to: ConnectionState::Connecting,
                        });
                    }
                }
                LinkEvent::Error(message) => log::warn!("Transport error: {}", message),
                LinkEvent::Text(text) => self.dispatch(&text),
            }
        }
        transitions
    }

    fn dispatch(&self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to parse server frame: {}", e);
                return;
            }
        };
        let (topic, payload) = match frame {
            ServerFrame::Message { topic, payload } => (topic, payload),
            ServerFrame::Error { message } => (
                SERVER_ERRORS_TOPIC.to_string(),
                json!({ "type": ERROR_TYPE, "message": message }),
            ),
        };
        match self.handlers.get(&topic) {
            Some(handlers) => handlers.iter().for_each(|handler| handler(&payload)),
            None => log::debug!("No handler for topic {}", topic),
        }
    }

    /// Close the connection and forget every handler.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            log::info!("Disconnecting transport");
        }
        self.connection.close();
        self.state = ConnectionState::Disconnected;
        self.handlers.clear();
        self.on_ready = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }
}

impl<C: Connection> Drop for TransportAdapter<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn endpoint() -> Endpoint {
        Endpoint {
            url: "ws://localhost:3030/ws".to_string(),
            token: None,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    fn recorder() -> (Handler, Rc<RefCell<Vec<Value>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let handler: Handler = Rc::new(move |v: &Value| sink.borrow_mut().push(v.clone()));
        (handler, seen)
    }

    #[test]
    fn test_validate_endpoint() {
        assert!(validate_endpoint(&endpoint()).is_ok());

        let mut bad = endpoint();
        bad.url = "http://localhost/ws".to_string();
        assert!(matches!(validate_endpoint(&bad), Err(TransportError::InvalidScheme(s)) if s == "http"));

        bad.url = "not a url".to_string();
        assert!(matches!(validate_endpoint(&bad), Err(TransportError::InvalidUrl(_))));

        let mut with_token = endpoint();
        with_token.token = Some("line\nbreak".to_string());
        assert!(matches!(validate_endpoint(&with_token), Err(TransportError::InvalidToken)));
    }

    #[test]
    fn test_publish_dropped_while_not_connected() {
        let (conn, handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        assert!(!adapter.publish("/app/x", &json!({"a": 1})));

        adapter.connect(&endpoint(), || {}).unwrap();
        assert_eq!(adapter.state(), ConnectionState::Connecting);
        assert!(!adapter.publish("/app/x", &json!({"a": 1})));
        assert!(handle.take_sent().is_empty());

        handle.accept();
        adapter.poll();
        assert!(adapter.publish("/app/x", &json!({"a": 1})));
        assert_eq!(
            handle.take_sent(),
            vec![ClientFrame::Publish { destination: "/app/x".into(), payload: json!({"a": 1}) }]
        );
    }

    #[test]
    fn test_subscribe_idempotent_per_handler() {
        let (conn, handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        let (first, seen_first) = recorder();
        let (second, seen_second) = recorder();

        assert!(adapter.subscribe("/topic/board/1", first.clone()));
        assert!(!adapter.subscribe("/topic/board/1", first.clone()));
        assert!(adapter.subscribe("/topic/board/1", second));

        adapter.connect(&endpoint(), || {}).unwrap();
        handle.accept();
        handle.message("/topic/board/1", json!({"n": 1}));
        adapter.poll();

        assert_eq!(seen_first.borrow().len(), 1);
        assert_eq!(seen_second.borrow().len(), 1);
        // One subscribe frame per topic, not per handler.
        let subscribes = handle
            .take_sent()
            .into_iter()
            .filter(|f| matches!(f, ClientFrame::Subscribe { .. }))
            .count();
        assert_eq!(subscribes, 1);
    }

    #[test]
    fn test_reconnect_resubscribes_and_fires_on_ready() {
        let (conn, handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        let ready = Rc::new(Cell::new(0));
        let counter = ready.clone();
        let (handler, _) = recorder();
        adapter.subscribe("/topic/board/9", handler);
        adapter.connect(&endpoint(), move || counter.set(counter.get() + 1)).unwrap();

        handle.accept();
        let transitions = adapter.poll();
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].is_ready());
        assert_eq!(ready.get(), 1);
        handle.take_sent();

        handle.drop_link();
        let transitions = adapter.poll();
        assert!(transitions[0].is_drop());
        assert_eq!(adapter.state(), ConnectionState::Connecting);
        assert!(!adapter.publish("/app/x", &json!(null)));

        handle.accept();
        adapter.poll();
        assert_eq!(ready.get(), 2);
        assert_eq!(
            handle.take_sent(),
            vec![ClientFrame::Subscribe { topic: "/topic/board/9".into() }]
        );
    }

    #[test]
    fn test_server_errors_routed_to_error_topic() {
        let (conn, handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        let (handler, seen) = recorder();
        adapter.subscribe(SERVER_ERRORS_TOPIC, handler);
        adapter.connect(&endpoint(), || {}).unwrap();
        handle.accept();
        handle.deliver(&ServerFrame::Error { message: "Invalid frame".into() });
        handle.deliver_text("this is not json");
        adapter.poll();
        assert_eq!(*seen.borrow(), vec![json!({"type": "ERROR", "message": "Invalid frame"})]);
    }

    #[test]
    fn test_no_handlers_after_disconnect() {
        let (conn, handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        let (handler, seen) = recorder();
        adapter.subscribe("/topic/board/1", handler);
        adapter.connect(&endpoint(), || {}).unwrap();
        handle.accept();
        adapter.poll();

        adapter.disconnect();
        assert!(!handle.is_open());
        handle.message("/topic/board/1", json!({"late": true}));
        adapter.poll();
        assert!(seen.borrow().is_empty());
        assert_eq!(adapter.topics().count(), 0);
    }

    #[test]
    fn test_drop_closes_connection() {
        let (conn, handle) = MemoryConnection::new();
        {
            let mut adapter = TransportAdapter::new(conn);
            adapter.connect(&endpoint(), || {}).unwrap();
            assert!(handle.is_open());
        }
        assert!(!handle.is_open());
        assert_eq!(handle.close_count(), 1);
    }

    #[test]
    fn test_connect_twice_rejected() {
        let (conn, _handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        adapter.connect(&endpoint(), || {}).unwrap();
        assert!(matches!(adapter.connect(&endpoint(), || {}), Err(TransportError::AlreadyConnected)));
    }

    #[test]
    fn test_unsubscribe_notifies_server() {
        let (conn, handle) = MemoryConnection::new();
        let mut adapter = TransportAdapter::new(conn);
        adapter.connect(&endpoint(), || {}).unwrap();
        handle.accept();
        adapter.poll();
        let (handler, seen) = recorder();
        adapter.subscribe("/topic/board/2", handler);
        assert!(adapter.unsubscribe("/topic/board/2"));
        assert!(!adapter.unsubscribe("/topic/board/2"));
        handle.message("/topic/board/2", json!({}));
        adapter.poll();
        assert!(seen.borrow().is_empty());
        assert_eq!(
            handle.take_sent(),
            vec![
                ClientFrame::Subscribe { topic: "/topic/board/2".into() },
                ClientFrame::Unsubscribe { topic: "/topic/board/2".into() },
            ]
        );
    }
}
