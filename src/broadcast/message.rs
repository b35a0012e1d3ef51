//! WebSocket wire messages.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CONNECTED: &str = "connected";
pub const AUTHENTICATED: &str = "authenticated";
pub const SUBSCRIBED: &str = "subscribed";
pub const UNSUBSCRIBED: &str = "unsubscribed";
pub const SUBMITTED: &str = "submitted";
pub const PONG: &str = "pong";
pub const ERROR: &str = "error";

pub const BATCH_PROCESSED: &str = "batch_processed";
pub const BATCH_FAILED: &str = "batch_failed";
pub const STATS_UPDATE: &str = "stats_update";
pub const DATA_UPDATE: &str = "data_update";

/// Topic carrying realtime stats snapshots.
pub const STATS_TOPIC: &str = "stats";

/// Topic carrying new points of one type.
pub fn data_topic(point_type: &str) -> String {
    format!("data:{}", point_type)
}

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate { token: String },
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Submit { points: Vec<JsonValue> },
    Ping,
}

/// Every server-to-client message: an event name plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: JsonValue,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ERROR, serde_json::json!({ "message": message.into() }))
    }

    pub fn to_json(&self) -> String {
        // Envelope holds only a string and a JSON value; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
