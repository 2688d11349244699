use serde::Deserialize;

use crate::manager::BackendSelector;

/// Messages a WebSocket client may send. Tagged JSON, e.g.
/// `{"type": "subscribe", "topic": "orders.created"}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ClientMessage {
    Subscribe {
        topic: String,
    },

    Unsubscribe {
        topic: String,
    },

    /// Publish through the manager. `backend` selects where the message
    /// goes; omitted means every enabled backend.
    Publish {
        topic: String,
        payload: serde_json::Value,
        #[serde(default)]
        backend: Option<String>,
    },

    Join {
        room: String,
    },

    Leave {
        room: String,
    },

    /// Client-side keepalive; refreshes the connection's activity clock.
    Ping,
}

/// Maps the wire-level backend name onto a selector. Unknown names are
/// reported back to the client rather than guessed at.
pub fn parse_selector(backend: Option<&str>) -> Result<BackendSelector, String> {
    match backend {
        None | Some("all") => Ok(BackendSelector::All),
        Some("durable") => Ok(BackendSelector::Durable),
        Some("ephemeral") => Ok(BackendSelector::Ephemeral),
        Some("push") => Ok(BackendSelector::Push),
        Some(other) => Err(format!("unknown backend: {other}")),
    }
}
