//! Shared utilities: the bus-wide error type and tracing setup.

pub mod error;
pub mod logging;

pub use error::BusError;

/// Validates a topic name. Topics must be non-empty and free of whitespace
/// and control characters.
pub fn validate_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Like [`validate_topic`] but produces the error the backends return for a
/// bad topic name.
pub fn ensure_topic(topic: &str) -> Result<(), BusError> {
    if validate_topic(topic) {
        Ok(())
    } else {
        Err(BusError::SubscriptionError(format!(
            "invalid topic name: {topic:?}"
        )))
    }
}
