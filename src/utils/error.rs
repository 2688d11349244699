//! Error taxonomy shared across the bus.
//!
//! Transport failures are caught at the backend boundary and returned as
//! values; nothing in this crate throws through the manager. Handler errors
//! stay attached to the message they failed and drive retry/dead-letter
//! accounting, never the publisher's result.

use thiserror::Error;
use uuid::Uuid;

use crate::message::MessageStatus;

#[derive(Debug, Error)]
pub enum BusError {
    /// The underlying transport is down or not connected. Retryable.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A publish attempt failed on one backend. Non-fatal; captured in the
    /// per-backend result map.
    #[error("publish failed on {backend}: {reason}")]
    PublishFailed {
        backend: &'static str,
        reason: String,
    },

    /// Malformed topic, queue conflict, or a consumer that could not be set
    /// up. Fatal only to the subscribe call that produced it.
    #[error("subscription error: {0}")]
    SubscriptionError(String),

    /// An application handler returned an error while processing a message.
    #[error("handler error: {0}")]
    HandlerError(String),

    /// The push channel refused a new connection because it is at capacity.
    #[error("connection capacity exceeded ({max} connections)")]
    ConnectionCapacityExceeded { max: usize },

    /// Strict envelope (de)serialization failed or the envelope version is
    /// unknown. The payload is rejected, never silently stringified.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    /// An operation was attempted on a message in a terminal state.
    #[error("message {id} is terminal ({status:?})")]
    TerminalMessage { id: Uuid, status: MessageStatus },

    #[error("message {id} has exhausted its {max_retries} retries")]
    RetriesExhausted { id: Uuid, max_retries: u32 },

    #[error("message {id} expired before processing")]
    MessageExpired { id: Uuid },

    #[error("unknown client: {0}")]
    UnknownClient(String),
}

impl BusError {
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::HandlerError(err.to_string())
    }
}
