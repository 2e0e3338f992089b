//! WebSocket endpoint for the system event stream.

use crate::stream::protocol::{self, Inbound};
use crate::stream::{StreamHub, Subscriber};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};

/// WebSocket handler: `GET /ws`.
///
/// No authentication; any origin may connect.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    tracing::debug!(remote_addr = %addr, "websocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, Arc::clone(&state.hub), addr))
}

/// Handles the WebSocket connection.
async fn handle_socket(socket: WebSocket, hub: Arc<StreamHub>, addr: SocketAddr) {
    let (subscriber, mut rx) = hub.connect().await;
    let connection_id = subscriber.id();
    let cancel = subscriber.cancellation().clone();

    tracing::info!(%connection_id, remote_addr = %addr, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Writer task: drains the bounded outbound queue into the socket until
    // the connection is cancelled or the socket fails.
    let writer_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        writer_cancel.cancel();
        let _ = sender.send(AxumMessage::Close(None)).await;
    });

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = receiver.next() => msg,
        };

        match msg {
            Some(Ok(AxumMessage::Text(text))) => dispatch(&hub, &subscriber, text.as_str()),
            Some(Ok(AxumMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(%connection_id, "websocket read error: {}", e);
                break;
            }
        }
    }

    hub.disconnect(&subscriber).await;
    if let Err(e) = send_task.await {
        tracing::warn!(%connection_id, "websocket writer task failed: {}", e);
    }

    tracing::info!(%connection_id, remote_addr = %addr, "websocket disconnected");
}

/// Routes one inbound text frame.
fn dispatch(hub: &Arc<StreamHub>, subscriber: &Arc<Subscriber>, text: &str) {
    match protocol::decode(text) {
        Ok(Inbound::Subscribe(request)) => {
            tracing::debug!(
                connection_id = %subscriber.id(),
                channel = %request.channel,
                last_seen = ?request.last_seen,
                "subscribe requested"
            );
            hub.subscribe(subscriber, request);
        }
        Err(e) => {
            tracing::debug!(connection_id = %subscriber.id(), error = ?e, "rejected inbound frame");
            if let Err(e) = subscriber.send_frame(protocol::encode_error(&e.to_string())) {
                tracing::warn!(
                    connection_id = %subscriber.id(),
                    "failed to send WebSocket error to client: {}",
                    e
                );
            }
        }
    }
}
