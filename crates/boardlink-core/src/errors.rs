//! Error classification and the non-fatal error channel.
//!
//! Nothing reported here stops synchronization. Server error frames are
//! classified, appended to a bounded log and handed to an optional callback.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

/// Message used when a frame carries nothing readable.
pub const GENERIC_ERROR_MESSAGE: &str = "An unexpected error occurred";

/// Default capacity of the error log.
pub const DEFAULT_MAX_ERROR_LOG: usize = 100;

/// Lowercase phrases that identify an access-denied message.
const PERMISSION_PHRASES: [&str; 9] = [
    "permission denied",
    "access denied",
    "forbidden",
    "unauthorized",
    "not authorized",
    "not allowed",
    "insufficient permission",
    "do not have permission",
    "don't have permission",
];

/// What kind of entity a stale reference pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Item,
    Connector,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Item => f.write_str("item"),
            EntityKind::Connector => f.write_str("connector"),
        }
    }
}

/// Errors surfaced by the synchronization core. None of them is fatal.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("unknown {kind} id {id}")]
    StaleReference { kind: EntityKind, id: i64 },
    #[error("no board is open")]
    NoBoard,
    #[error("non-finite {0}")]
    NonFinite(&'static str),
}

impl SyncError {
    /// The worst outcome of any error here is a stale view until the next resync.
    pub fn is_fatal(&self) -> bool {
        false
    }
}

/// Classification of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Permission,
    Server,
}

/// One entry of the error log.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub permission_flag: bool,
}

impl ErrorEvent {
    pub fn to_error(&self) -> SyncError {
        match self.kind {
            ErrorKind::Permission => SyncError::Permission(self.message.clone()),
            ErrorKind::Server => SyncError::Server(self.message.clone()),
        }
    }
}

fn non_empty(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Extract a readable message from an error frame.
///
/// Accepts a bare string, `{message}` or `{data: {message}}`.
pub fn classify(frame: &Value) -> String {
    let message = match frame {
        Value::String(s) => Some(s.trim()).filter(|s| !s.is_empty()),
        Value::Object(map) => non_empty(map.get("message"))
            .or_else(|| non_empty(map.get("data").and_then(|d| d.get("message")))),
        _ => None,
    };
    message.unwrap_or(GENERIC_ERROR_MESSAGE).to_string()
}

/// Whether `message` is an access-denied message.
pub fn is_permission_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMISSION_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

/// Callback invoked for every reported error.
pub type ErrorCallback = Box<dyn FnMut(&ErrorEvent)>;

/// Ordered, bounded log of server-pushed errors.
pub struct ErrorChannel {
    log: VecDeque<ErrorEvent>,
    capacity: usize,
    callback: Option<ErrorCallback>,
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: VecDeque::new(),
            capacity: capacity.max(1),
            callback: None,
        }
    }

    /// Register the callback, replacing any previous one.
    pub fn set_callback(&mut self, callback: impl FnMut(&ErrorEvent) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Classify `frame`, log it and notify the callback.
    pub fn report(&mut self, frame: &Value) -> ErrorEvent {
        let message = classify(frame);
        let permission = is_permission_error(&message);
        let data = match frame {
            Value::Object(map) => map.get("data").cloned(),
            _ => None,
        };
        let event = ErrorEvent {
            kind: if permission { ErrorKind::Permission } else { ErrorKind::Server },
            message,
            data,
            timestamp: Utc::now(),
            permission_flag: permission,
        };

        if permission {
            log::warn!("Permission error from server: {}", event.message);
        } else {
            log::warn!("Server error: {}", event.message);
        }

        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(event.clone());

        if let Some(callback) = self.callback.as_mut() {
            callback(&event);
        }
        event
    }

    /// Entries, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &ErrorEvent> {
        self.log.iter()
    }

    pub fn latest(&self) -> Option<&ErrorEvent> {
        self.log.back()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Drain the log.
    pub fn take_log(&mut self) -> Vec<ErrorEvent> {
        self.log.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERROR_LOG)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_classify_shapes() {
        assert_eq!(classify(&json!("Board is locked")), "Board is locked");
        assert_eq!(classify(&json!({"message": "Item too large"})), "Item too large");
        assert_eq!(
            classify(&json!({"type": "ERROR", "data": {"message": "Quota exceeded"}})),
            "Quota exceeded"
        );
        // Top-level message wins over nested.
        assert_eq!(classify(&json!({"message": "outer", "data": {"message": "inner"}})), "outer");
    }

    #[test]
    fn test_classify_fallback() {
        assert_eq!(classify(&json!({})), GENERIC_ERROR_MESSAGE);
        assert_eq!(classify(&json!({"message": "  "})), GENERIC_ERROR_MESSAGE);
        assert_eq!(classify(&json!({"message": 42})), GENERIC_ERROR_MESSAGE);
        assert_eq!(classify(&json!(null)), GENERIC_ERROR_MESSAGE);
        assert_eq!(classify(&json!([1, 2])), GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn test_permission_phrases() {
        assert!(is_permission_error("Access Denied: read-only board"));
        assert!(is_permission_error("403 FORBIDDEN"));
        assert!(is_permission_error("You do not have permission to edit"));
        assert!(is_permission_error("user is not authorized"));
        assert!(!is_permission_error("Item not found"));
        assert!(!is_permission_error(GENERIC_ERROR_MESSAGE));
    }

    #[test]
    fn test_report_logs_and_notifies() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut channel = ErrorChannel::default();
        let sink = seen.clone();
        channel.set_callback(move |event| sink.borrow_mut().push(event.message.clone()));

        let event = channel.report(&json!({"type": "ERROR", "message": "Permission denied", "data": {"itemId": 4}}));
        assert!(event.permission_flag);
        assert_eq!(event.kind, ErrorKind::Permission);
        assert_eq!(event.data, Some(json!({"itemId": 4})));
        assert!(matches!(event.to_error(), SyncError::Permission(_)));

        channel.report(&json!("socket hiccup"));
        assert_eq!(*seen.borrow(), vec!["Permission denied".to_string(), "socket hiccup".to_string()]);
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.latest().map(|e| e.kind), Some(ErrorKind::Server));
    }

    #[test]
    fn test_log_is_bounded_and_ordered() {
        let mut channel = ErrorChannel::new(3);
        for i in 0..5 {
            channel.report(&json!({ "message": format!("error {}", i) }));
        }
        let messages: Vec<_> = channel.log().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["error 2", "error 3", "error 4"]);
        assert_eq!(channel.take_log().len(), 3);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_event_serializes_for_ui() {
        let mut channel = ErrorChannel::default();
        let event = channel.report(&json!({"message": "Forbidden"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PERMISSION");
        assert_eq!(json["permissionFlag"], true);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_sync_errors_are_not_fatal() {
        let err = SyncError::StaleReference { kind: EntityKind::Item, id: 3 };
        assert_eq!(err.to_string(), "unknown item id 3");
        assert!(!err.is_fatal());
        assert!(!SyncError::NoBoard.is_fatal());
    }
}
