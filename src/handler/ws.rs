//! WebSocket session loop.
//!
//! Each socket gets a connection in the broadcaster. Broadcast events go
//! through the connection's bounded queue and may be dropped under load.
//! Replies to client requests are written to the socket directly after the
//! events already queued, so they are never dropped and stay in order.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;
use crate::broadcast::{message, ClientMessage, ConnectionId, ConnectionState, Credentials, Envelope};
use tokio::sync::mpsc;

pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
}

async fn run_session(socket: WebSocket, state: AppState) {
    let (conn, mut outbound) = state.broadcaster.connect();
    let (mut sink, mut stream) = socket.split();

    let greeting = Envelope::new(message::CONNECTED, json!({ "connection_id": conn }));
    let mut open = send(&mut sink, conn, greeting).await;

    while open {
        tokio::select! {
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                open = send(&mut sink, conn, envelope).await;
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_text(&state, conn, &text).await;
                    open = reply_in_order(&mut sink, &mut outbound, conn, reply).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %conn, error = %e, "socket error");
                    break;
                }
            },
        }
    }

    state.broadcaster.disconnect(conn);
}

async fn send<S>(sink: &mut S, conn: ConnectionId, envelope: Envelope) -> bool
where
    S: Sink<Message> + Unpin,
{
    if sink.send(Message::Text(envelope.to_json())).await.is_err() {
        debug!(connection = %conn, "socket closed while sending");
        return false;
    }
    true
}

/// Flush events queued before `reply`, then write the reply itself.
async fn reply_in_order<S>(
    sink: &mut S,
    outbound: &mut mpsc::Receiver<Envelope>,
    conn: ConnectionId,
    reply: Envelope,
) -> bool
where
    S: Sink<Message> + Unpin,
{
    while let Ok(envelope) = outbound.try_recv() {
        if !send(sink, conn, envelope).await {
            return false;
        }
    }
    send(sink, conn, reply).await
}

async fn handle_text(state: &AppState, conn: ConnectionId, text: &str) -> Envelope {
    let broadcaster = &state.broadcaster;
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => return Envelope::error(format!("invalid message: {}", e)),
    };

    match msg {
        ClientMessage::Authenticate { token } => {
            match broadcaster.authenticate(conn, &Credentials::bearer(token)) {
                Ok(principal) => Envelope::new(
                    message::AUTHENTICATED,
                    json!({ "subject": principal.subject }),
                ),
                Err(e) => Envelope::error(e.to_string()),
            }
        }
        ClientMessage::Subscribe { topic } => match broadcaster.subscribe(conn, &topic) {
            Ok(()) => Envelope::new(message::SUBSCRIBED, json!({ "topic": topic })),
            Err(e) => Envelope::error(e.to_string()),
        },
        ClientMessage::Unsubscribe { topic } => match broadcaster.unsubscribe(conn, &topic) {
            Ok(()) => Envelope::new(message::UNSUBSCRIBED, json!({ "topic": topic })),
            Err(e) => Envelope::error(e.to_string()),
        },
        ClientMessage::Submit { points } => {
            if broadcaster.state(conn) != ConnectionState::Authenticated {
                Envelope::error("connection is not authenticated")
            } else {
                match state.pipeline.ingest(points).await {
                    Ok(receipt) => Envelope::new(message::SUBMITTED, json!(receipt)),
                    Err(e) => {
                        warn!(connection = %conn, error = %e, "websocket submit rejected");
                        Envelope::error(e.to_string())
                    }
                }
            }
        }
        ClientMessage::Ping => Envelope::new(
            message::PONG,
            json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
        ),
    }
}
