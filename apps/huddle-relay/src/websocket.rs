use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

use crate::room::Room;

const TARGET: &str = "huddle::relay::websocket";

pub async fn websocket_handler(ws: WebSocketUpgrade, State(room): State<Room>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room))
}

async fn handle_socket(socket: WebSocket, room: Room) {
    let (socket_id, mut outbound) = room.connect();
    let (mut sender, mut receiver) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(target = TARGET, socket = socket_id, error = %err, "websocket read failed");
                break;
            }
        };
        match message {
            Message::Text(text) => room.handle_frame(socket_id, &text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => room.handle_frame(socket_id, &text),
                Err(_) => {
                    tracing::warn!(target = TARGET, socket = socket_id, "dropping non-utf8 binary frame")
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    room.disconnect(socket_id);
    writer.abort();
    tracing::debug!(target = TARGET, socket = socket_id, "socket closed");
}
