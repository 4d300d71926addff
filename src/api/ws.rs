//! WebSocket bridge: subscribes to the event bus and pushes `{type, data}`
//! frames. Read-only; incoming client messages are drained and ignored.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use crate::Core;
use crate::events::Event;

pub async fn ws_handler(ws: WebSocketUpgrade, State(core): State<Arc<Core>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, core))
}

async fn handle_socket(socket: WebSocket, core: Arc<Core>) {
    let mut rx = core.bus.subscribe();
    let (mut sink, mut stream) = socket.split();
    log::debug!("websocket client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    // Bus disconnected us (slow consumer) or is shutting down.
                    log::debug!("websocket client detached from event bus");
                    break;
                };
                if sink.send(Message::Text(frame(&event).into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // subscribers are read-only; ignore
                    Some(Err(e)) => {
                        log::debug!("websocket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }
    log::debug!("websocket client disconnected");
}

fn frame(event: &Event) -> String {
    serde_json::json!({
        "type": event.topic.as_str(),
        "data": event.data,
    })
    .to_string()
}
