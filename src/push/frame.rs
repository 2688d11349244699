//! Outbound push frames.
//!
//! Every event pushed to a client is a [`Frame`] with an event name, an
//! optional id and retry hint, and a JSON body. `serde_json` backs objects
//! with a sorted map, so serialized key order is stable and clients can diff
//! consecutive frames textually.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::message::{Message, MessagePriority};
use crate::utils::BusError;

/// Retry hint (ms) attached to frames carrying high-priority messages.
const URGENT_RETRY_MS: u64 = 5000;

/// Reserved control event names.
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_SUBSCRIBED: &str = "subscribed";
pub const EVENT_UNSUBSCRIBED: &str = "unsubscribed";
pub const EVENT_PING: &str = "ping";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            id: None,
            retry: None,
            data,
        }
    }

    /// Heartbeat frame with the current server time.
    pub fn ping() -> Self {
        Self::new(EVENT_PING, json!({ "timestamp": Utc::now().to_rfc3339() }))
    }

    /// Wraps a bus message: the topic becomes the event name, the message id
    /// the frame id, and urgent messages carry a retry hint.
    pub fn from_message(message: &Message) -> Result<Self, BusError> {
        let data = serde_json::to_value(message).map_err(|e| BusError::Codec(e.to_string()))?;
        Ok(Self {
            event: message.topic.clone(),
            id: Some(message.id.to_string()),
            retry: (message.priority >= MessagePriority::High).then_some(URGENT_RETRY_MS),
            data,
        })
    }

    /// JSON text for WebSocket delivery.
    pub fn to_json(&self) -> Result<String, BusError> {
        serde_json::to_string(self).map_err(|e| BusError::Codec(e.to_string()))
    }

    /// `text/event-stream` rendering for SSE delivery.
    pub fn to_sse(&self) -> Result<String, BusError> {
        let mut lines = Vec::new();
        lines.push(format!("event: {}", self.event));
        if let Some(id) = &self.id {
            lines.push(format!("id: {id}"));
        }
        if let Some(retry) = self.retry {
            lines.push(format!("retry: {retry}"));
        }
        let data =
            serde_json::to_string(&self.data).map_err(|e| BusError::Codec(e.to_string()))?;
        for line in data.split('\n') {
            lines.push(format!("data: {line}"));
        }
        lines.push(String::new());
        lines.push(String::new());
        Ok(lines.join("\n"))
    }
}
