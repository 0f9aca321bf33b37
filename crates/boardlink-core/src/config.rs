//! Synchronization settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DEFAULT_MAX_ERROR_LOG;
use crate::transport::Endpoint;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:3030/ws";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_DRAG_THROTTLE_MS: u64 = 100;
pub const DEFAULT_DESTINATION_PREFIX: &str = "/app";
pub const DEFAULT_TOPIC_PREFIX: &str = "/topic/board";

/// Settings for a [`BoardSession`](crate::BoardSession).
///
/// The endpoint and token are supplied by whoever owns authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket URL of the board service.
    pub endpoint: String,
    /// Bearer token sent on the upgrade request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Minimum spacing of drag updates per item.
    pub drag_throttle_ms: u64,
    pub destination_prefix: String,
    pub topic_prefix: String,
    /// Number of entries kept in the error log.
    pub max_error_log: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            drag_throttle_ms: DEFAULT_DRAG_THROTTLE_MS,
            destination_prefix: DEFAULT_DESTINATION_PREFIX.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            max_error_log: DEFAULT_MAX_ERROR_LOG,
        }
    }
}

impl SyncConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn drag_throttle(&self) -> Duration {
        Duration::from_millis(self.drag_throttle_ms)
    }

    /// Connection parameters for the transport.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            url: self.endpoint.clone(),
            token: self.token.clone(),
            reconnect_delay: self.reconnect_delay(),
        }
    }
}
