use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message as WsMessage;

use crate::config::PushSettings;
use crate::manager::{BackendSelector, MessagingManager};
use crate::push::PushChannel;
use crate::transport::message::{ClientMessage, parse_selector};
use crate::transport::websocket;

#[test]
fn test_client_message_parsing() {
    let msg: ClientMessage =
        serde_json::from_str(r#"{"type": "subscribe", "topic": "orders.created"}"#).unwrap();
    assert!(matches!(msg, ClientMessage::Subscribe { topic } if topic == "orders.created"));

    let msg: ClientMessage = serde_json::from_str(
        r#"{"type": "publish", "topic": "jobs", "payload": {"n": 1}, "backend": "durable"}"#,
    )
    .unwrap();
    match msg {
        ClientMessage::Publish {
            topic,
            payload,
            backend,
        } => {
            assert_eq!(topic, "jobs");
            assert_eq!(payload, json!({"n": 1}));
            assert_eq!(backend.as_deref(), Some("durable"));
        }
        other => panic!("unexpected variant: {other:?}"),
    }

    let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
    assert!(matches!(msg, ClientMessage::Ping));

    assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "shout"}"#).is_err());
    assert!(
        serde_json::from_str::<ClientMessage>(
            r#"{"type": "subscribe", "topic": "t", "extra": 1}"#
        )
        .is_err()
    );
}

#[test]
fn test_selector_parsing() {
    assert_eq!(parse_selector(None).unwrap(), BackendSelector::All);
    assert_eq!(parse_selector(Some("all")).unwrap(), BackendSelector::All);
    assert_eq!(
        parse_selector(Some("ephemeral")).unwrap(),
        BackendSelector::Ephemeral
    );
    assert!(parse_selector(Some("carrier-pigeon")).is_err());
}

async fn start_push_only_server() -> String {
    let push = Arc::new(PushChannel::new(PushSettings {
        enabled: true,
        max_connections: 16,
        queue_size: 32,
        ping_interval_secs: 30,
        connection_timeout_secs: 300,
        cleanup_interval_secs: 60,
    }));
    let manager = Arc::new(MessagingManager::with_backends(None, None, Some(push)));
    manager.init().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = websocket::run(listener, manager).await;
    });
    format!("ws://{addr}")
}

async fn next_event(
    ws: &mut (impl StreamExt<Item = Result<WsMessage, tungstenite::Error>> + Unpin),
) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_subscribe_and_publish_between_clients() {
    let url = start_push_only_server().await;

    let (mut subscriber, _) = connect_async(url.clone()).await.unwrap();
    let (mut publisher, _) = connect_async(url).await.unwrap();

    assert_eq!(next_event(&mut subscriber).await["event"], "connected");
    assert_eq!(next_event(&mut publisher).await["event"], "connected");

    subscriber
        .send(WsMessage::text(
            json!({"type": "subscribe", "topic": "chat"}).to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(next_event(&mut subscriber).await["event"], "subscribed");

    publisher
        .send(WsMessage::text(
            json!({
                "type": "publish",
                "topic": "chat",
                "payload": {"text": "hello"},
                "backend": "push"
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let frame = next_event(&mut subscriber).await;
    assert_eq!(frame["event"], "chat");
    assert_eq!(frame["data"]["payload"], json!({"text": "hello"}));
    // the publisher identity travels with the message
    assert!(
        frame["data"]["source"]
            .as_str()
            .unwrap()
            .starts_with("client-")
    );
}

#[tokio::test]
async fn test_invalid_message_yields_error_frame() {
    let url = start_push_only_server().await;
    let (mut ws, _) = connect_async(url).await.unwrap();
    assert_eq!(next_event(&mut ws).await["event"], "connected");

    ws.send(WsMessage::text(r#"{"type": "shout"}"#.to_string()))
        .await
        .unwrap();
    let frame = next_event(&mut ws).await;
    assert_eq!(frame["event"], "error");
    assert!(frame["data"]["reason"].as_str().unwrap().contains("invalid"));
}

#[tokio::test]
async fn test_unknown_backend_yields_error_frame() {
    let url = start_push_only_server().await;
    let (mut ws, _) = connect_async(url).await.unwrap();
    assert_eq!(next_event(&mut ws).await["event"], "connected");

    ws.send(WsMessage::text(
        json!({
            "type": "publish",
            "topic": "t",
            "payload": 1,
            "backend": "carrier-pigeon"
        })
        .to_string(),
    ))
    .await
    .unwrap();
    let frame = next_event(&mut ws).await;
    assert_eq!(frame["event"], "error");
    assert!(
        frame["data"]["reason"]
            .as_str()
            .unwrap()
            .contains("unknown backend")
    );
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let url = start_push_only_server().await;
    let (mut ws, _) = connect_async(url).await.unwrap();
    assert_eq!(next_event(&mut ws).await["event"], "connected");

    ws.send(WsMessage::text(r#"{"type": "ping"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_event(&mut ws).await["event"], "pong");
}
