use std::time::Duration;

use serde_json::json;

use super::{DEFAULT_MAX_RETRIES, Envelope, Message, MessagePriority, MessageStatus};
use crate::utils::BusError;

#[test]
fn test_new_message_defaults() {
    let msg = Message::new("orders.created", json!({"id": 1}));
    assert_eq!(msg.topic, "orders.created");
    assert_eq!(msg.status, MessageStatus::Pending);
    assert_eq!(msg.priority, MessagePriority::Normal);
    assert_eq!(msg.retry_count, 0);
    assert_eq!(msg.max_retries, DEFAULT_MAX_RETRIES);
    assert!(msg.ttl.is_none());
    assert!(!msg.is_expired());
    assert!(msg.can_retry());
}

#[test]
fn test_lifecycle_happy_path() {
    let mut msg = Message::new("t", json!(null));
    msg.mark_processing().unwrap();
    assert_eq!(msg.status, MessageStatus::Processing);
    assert!(msg.processed_at.is_some());
    msg.mark_completed().unwrap();
    assert_eq!(msg.status, MessageStatus::Completed);
}

#[test]
fn test_terminal_messages_reject_mutation() {
    let mut msg = Message::new("t", json!(null));
    msg.mark_completed().unwrap();

    for result in [
        msg.mark_processing(),
        msg.mark_failed("boom"),
        msg.mark_retry(),
        msg.mark_dead_letter(),
    ] {
        assert!(matches!(result, Err(BusError::TerminalMessage { .. })));
    }
    assert_eq!(msg.status, MessageStatus::Completed);
}

#[test]
fn test_retry_count_never_exceeds_max() {
    let mut msg = Message::new("t", json!(null)).with_max_retries(2);

    msg.mark_failed("1").unwrap();
    msg.mark_retry().unwrap();
    msg.mark_failed("2").unwrap();
    msg.mark_retry().unwrap();
    assert_eq!(msg.retry_count, 2);
    assert!(!msg.can_retry());

    msg.mark_failed("3").unwrap();
    assert!(matches!(
        msg.mark_retry(),
        Err(BusError::RetriesExhausted { max_retries: 2, .. })
    ));
    assert_eq!(msg.retry_count, 2);

    msg.mark_dead_letter().unwrap();
    assert_eq!(msg.status, MessageStatus::DeadLetter);
}

#[test]
fn test_zero_ttl_expires_immediately() {
    let mut msg = Message::new("t", json!(null)).with_ttl(Duration::ZERO);
    assert!(msg.is_expired());
    assert!(!msg.can_retry());
    assert!(matches!(
        msg.mark_processing(),
        Err(BusError::MessageExpired { .. })
    ));
    assert_eq!(msg.status, MessageStatus::Pending);
}

#[test]
fn test_long_ttl_not_expired() {
    let msg = Message::new("t", json!(null)).with_ttl(Duration::from_secs(3600));
    assert!(!msg.is_expired());
}

#[test]
fn test_effective_routing_key() {
    let msg = Message::new("orders.created", json!(null));
    assert_eq!(msg.effective_routing_key(), "orders.created");
    let msg = msg.with_routing_key("orders.eu");
    assert_eq!(msg.effective_routing_key(), "orders.eu");
}

#[test]
fn test_priority_amqp_values() {
    assert_eq!(MessagePriority::Low.as_amqp(), 1);
    assert_eq!(MessagePriority::Critical.as_amqp(), 4);
    assert!(MessagePriority::High > MessagePriority::Normal);
}

#[test]
fn test_envelope_round_trip() {
    let msg = Message::new("orders.created", json!({"id": 7}))
        .with_priority(MessagePriority::High)
        .with_correlation_id("corr-1");
    let bytes = Envelope::encode(&msg).unwrap();
    let decoded = Envelope::decode(&bytes).unwrap();
    assert_eq!(decoded.id, msg.id);
    assert_eq!(decoded.topic, "orders.created");
    assert_eq!(decoded.payload, json!({"id": 7}));
    assert_eq!(decoded.priority, MessagePriority::High);
    assert_eq!(decoded.correlation_id.as_deref(), Some("corr-1"));
}

#[test]
fn test_envelope_rejects_unknown_version() {
    let msg = Message::new("t", json!(null));
    let bytes = Envelope::encode(&msg).unwrap();
    let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    value["version"] = json!(99);
    let bytes = serde_json::to_vec(&value).unwrap();
    assert!(matches!(Envelope::decode(&bytes), Err(BusError::Codec(_))));
}

#[test]
fn test_envelope_rejects_garbage() {
    assert!(matches!(
        Envelope::decode(b"not json at all"),
        Err(BusError::Codec(_))
    ));
    assert!(matches!(
        Envelope::decode(br#"{"version":1,"message":{"bogus":true}}"#),
        Err(BusError::Codec(_))
    ));
}

#[test]
fn test_header_order_is_stable() {
    let mut msg = Message::new("t", json!(null));
    msg.headers.insert("zeta".into(), json!(1));
    msg.headers.insert("alpha".into(), json!(2));
    let text = serde_json::to_string(&msg).unwrap();
    assert!(text.find("alpha").unwrap() < text.find("zeta").unwrap());
}
