//! The smallest real [`Connection`]: one axum WebSocket per client,
//! wrapping a `ClientMessage`/`ServerMessage` JSON-over-text exchange.
//!
//! `Connection::send` is synchronous (the core never awaits a transport),
//! so outbound messages are handed to an unbounded channel and a background
//! task drains it onto the socket — the same shape `axum-live-view`'s
//! `ViewHandle` uses to decouple a cheaply-cloneable handle from the actual
//! socket write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use viewloop_core::{Connection, ConnectionHandle, ConnectionId, ControllerHandle, UserId};
use viewloop_protocol::{ClientMessage, Method, ServerMessage};

/// One live WebSocket, identified by the user the upgrade request
/// authenticated (or [`UserId::anonymous`] if it didn't).
pub struct WebSocketConnection {
    id: ConnectionId,
    user: UserId,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    open: AtomicBool,
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection").field("id", &self.id).field("user", &self.user).finish()
    }
}

impl Connection for WebSocketConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn user(&self) -> UserId {
        self.user.clone()
    }

    fn send(&self, message: ServerMessage) {
        // A closed socket's drain task has already dropped its receiver;
        // silently losing the message here is the transport analogue of
        // spec §7's `TransportClosed`.
        let _ = self.outbound.send(message);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// Drive one upgraded socket until it closes: read frames and forward them
/// to the controller, write whatever the controller pushes back.
pub async fn serve(socket: WebSocket, user: UserId, controller: ControllerHandle) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

    let connection = Arc::new(WebSocketConnection {
        id: ConnectionId::next(),
        user,
        outbound: outbound_tx,
        open: AtomicBool::new(true),
    });
    let connection_handle: ConnectionHandle = connection.clone();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(Message::Text(message.encode().into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(?err, "websocket read error");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
        };

        let client_message = match ClientMessage::decode(&text) {
            Ok(message) => message,
            Err(err) => {
                warn!(?err, "dropping malformed client message");
                continue;
            }
        };

        dispatch(&controller, &connection_handle, client_message);
    }

    connection.open.store(false, Ordering::Relaxed);
    controller.connection_closed(connection.id);
    writer.abort();
}

fn dispatch(controller: &ControllerHandle, connection: &ConnectionHandle, message: ClientMessage) {
    debug!(method = ?message.method, url = %message.url, window_id = message.window_id, "dispatching client message");

    match message.method {
        Method::View => controller.handle_view(connection.clone(), message.window_id, message.url, message.payload),
        Method::InputEvent => {
            let payload = message.payload.unwrap_or(serde_json::Value::Null);
            controller.handle_input_event(connection.clone(), message.window_id, message.url, payload);
        }
    }
}
