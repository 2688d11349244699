use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::manager::MessagingManager;
use crate::message::Message;
use crate::push::Frame;
use crate::transport::message::{ClientMessage, parse_selector};
use crate::utils::BusError;

/// Bind and serve. Runs until the listener fails.
pub async fn start_websocket_server(
    addr: &str,
    manager: Arc<MessagingManager>,
) -> Result<(), BusError> {
    let listener = TcpListener::bind(addr).await?;
    info!("websocket server listening on ws://{addr}");
    run(listener, manager).await
}

/// Accept loop over a pre-bound listener; tests bind their own port and
/// hand it in.
pub async fn run(listener: TcpListener, manager: Arc<MessagingManager>) -> Result<(), BusError> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            debug!(%peer, "incoming websocket connection");
            if let Err(e) = handle_socket(stream, manager).await {
                warn!(%peer, "websocket session ended with error: {e}");
            }
        });
    }
}

async fn handle_socket(stream: TcpStream, manager: Arc<MessagingManager>) -> Result<(), BusError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| BusError::SubscriptionError(format!("websocket handshake failed: {e}")))?;
    let push = Arc::clone(manager.push_channel()?);
    let client_id = format!("client-{}", uuid::Uuid::new_v4());

    // Registering with the push channel enforces the connection cap and
    // yields the outbound frame queue.
    let mut frames = push.connect(&client_id, BTreeMap::new()).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Forward frames from the push channel to the socket.
    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(client = %writer_id, "frame encoding failed: {e}");
                    continue;
                }
            };
            if ws_sender.send(WsMessage::text(text)).await.is_err() {
                break;
            }
        }
        debug!(client = %writer_id, "writer loop closed");
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            WsMessage::Text(text) => {
                push.record_activity(&client_id).await;
                handle_client_message(&client_id, text.as_str(), &manager).await;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                push.record_activity(&client_id).await;
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    info!(client = %client_id, "websocket client disconnected");
    push.disconnect(&client_id).await;
    writer.abort();
    Ok(())
}

async fn handle_client_message(client_id: &str, text: &str, manager: &MessagingManager) {
    let parsed = match serde_json::from_str::<ClientMessage>(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(client = %client_id, "invalid client message: {e}");
            send_error(client_id, manager, format!("invalid message: {e}")).await;
            return;
        }
    };

    let push = match manager.push_channel() {
        Ok(push) => push,
        Err(e) => {
            warn!("push channel unavailable: {e}");
            return;
        }
    };

    match parsed {
        ClientMessage::Subscribe { topic } => {
            if let Err(e) = push.subscribe_client(client_id, &topic).await {
                send_error(client_id, manager, e.to_string()).await;
            }
        }
        ClientMessage::Unsubscribe { topic } => {
            if let Err(e) = push.unsubscribe_client(client_id, &topic).await {
                send_error(client_id, manager, e.to_string()).await;
            }
        }
        ClientMessage::Publish {
            topic,
            payload,
            backend,
        } => {
            let selector = match parse_selector(backend.as_deref()) {
                Ok(selector) => selector,
                Err(reason) => {
                    send_error(client_id, manager, reason).await;
                    return;
                }
            };
            let message = Message::new(topic, payload).with_source(client_id);
            let report = manager.publish(message, selector).await;
            if !report.is_success() {
                let reasons: Vec<String> = report
                    .failures()
                    .iter()
                    .map(|(backend, e)| format!("{backend}: {e}"))
                    .collect();
                send_error(client_id, manager, reasons.join("; ")).await;
            }
        }
        ClientMessage::Join { room } => {
            if let Err(e) = push.join_room(client_id, &room).await {
                send_error(client_id, manager, e.to_string()).await;
            }
        }
        ClientMessage::Leave { room } => {
            if let Err(e) = push.leave_room(client_id, &room).await {
                send_error(client_id, manager, e.to_string()).await;
            }
        }
        ClientMessage::Ping => {
            let _ = push
                .send_to_client(client_id, Frame::new("pong", serde_json::Value::Null))
                .await;
        }
    }
}

async fn send_error(client_id: &str, manager: &MessagingManager, reason: String) {
    if let Ok(push) = manager.push_channel() {
        let _ = push
            .send_to_client(
                client_id,
                Frame::new("error", serde_json::json!({ "reason": reason })),
            )
            .await;
    }
}
