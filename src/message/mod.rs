//! The universal message model shared by every backend.
//!
//! A [`Message`] carries an opaque JSON payload plus routing and processing
//! metadata, and owns its own lifecycle state machine:
//!
//! ```text
//! Pending -> Processing -> { Completed | Failed }
//! Failed  -> Retrying  -> Processing      (while can_retry())
//! Failed  -> DeadLetter                   (retries exhausted or expired)
//! ```
//!
//! `Completed` and `DeadLetter` are terminal: any mark on a terminal message
//! returns an error instead of mutating state. Messages are passed by value
//! into backends and copied per recipient on fan-out, so no consumer ever
//! observes another consumer's mutations.

pub mod envelope;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::BusError;

pub use envelope::{ENVELOPE_VERSION, Envelope};

/// Default number of retries a message is allowed before dead-lettering.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Critical,
}

impl MessagePriority {
    /// Numeric priority as carried on the AMQP wire (1..=4).
    pub fn as_amqp(self) -> u8 {
        match self {
            MessagePriority::Low => 1,
            MessagePriority::Normal => 2,
            MessagePriority::High => 3,
            MessagePriority::Critical => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLetter,
}

impl MessageStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::DeadLetter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    /// Sorted map so serialized header order is stable.
    pub headers: BTreeMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub priority: MessagePriority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub ttl: Option<Duration>,

    pub status: MessageStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,

    pub routing_key: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            headers: BTreeMap::new(),
            created_at: Utc::now(),
            priority: MessagePriority::Normal,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            ttl: None,
            status: MessageStatus::Pending,
            error_message: None,
            processed_at: None,
            routing_key: None,
            source: None,
            destination: None,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, serde_json::Value>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Routing key used on the durable backend; falls back to the topic.
    pub fn effective_routing_key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.topic)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once `created_at + ttl` has passed. A message without a ttl
    /// never expires; a ttl of zero expires immediately.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            None => false,
            Some(ttl) => {
                let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::TimeDelta::MAX);
                match self.created_at.checked_add_signed(ttl) {
                    Some(deadline) => Utc::now() > deadline,
                    None => false,
                }
            }
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries && !self.is_expired()
    }

    fn guard_not_terminal(&self) -> Result<(), BusError> {
        if self.is_terminal() {
            return Err(BusError::TerminalMessage {
                id: self.id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Transition into `Processing`. Rejected for terminal or expired
    /// messages: an expired message can never enter processing.
    pub fn mark_processing(&mut self) -> Result<(), BusError> {
        self.guard_not_terminal()?;
        if self.is_expired() {
            return Err(BusError::MessageExpired { id: self.id });
        }
        self.status = MessageStatus::Processing;
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), BusError> {
        self.guard_not_terminal()?;
        self.status = MessageStatus::Completed;
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), BusError> {
        self.guard_not_terminal()?;
        self.status = MessageStatus::Failed;
        self.error_message = Some(error.into());
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    /// Count a retry. `retry_count` never exceeds `max_retries`; a retry
    /// past the limit or of an expired message is rejected.
    pub fn mark_retry(&mut self) -> Result<(), BusError> {
        self.guard_not_terminal()?;
        if self.retry_count >= self.max_retries {
            return Err(BusError::RetriesExhausted {
                id: self.id,
                max_retries: self.max_retries,
            });
        }
        if self.is_expired() {
            return Err(BusError::MessageExpired { id: self.id });
        }
        self.retry_count += 1;
        self.status = MessageStatus::Retrying;
        self.processed_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal transition for messages whose retries are exhausted or that
    /// expired before completing.
    pub fn mark_dead_letter(&mut self) -> Result<(), BusError> {
        self.guard_not_terminal()?;
        self.status = MessageStatus::DeadLetter;
        self.processed_at = Some(Utc::now());
        Ok(())
    }
}

/// Future returned by a message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>>;

/// An application handler: a plain async function value registered
/// explicitly against a backend. Invoked once per delivery attempt.
pub type MessageHandler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// A predicate applied before the handler; all filters of a subscription
/// must pass or the delivery is silently dropped.
pub type MessageFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Wraps an async closure into a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BusError>> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Wraps a predicate closure into a [`MessageFilter`].
pub fn filter<F>(f: F) -> MessageFilter
where
    F: Fn(&Message) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests;
