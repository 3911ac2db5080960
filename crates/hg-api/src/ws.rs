//! Observer WebSocket bound to a hub connection

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use hg_broadcast::RealtimeBroadcastHub;

use crate::AppState;

const CONTROL_CAPACITY: usize = 32;

#[derive(Debug, Default, Deserialize)]
pub struct ObserverQuery {
    pub role: Option<String>,
}

/// Frames an observer may send
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { room: String },
    Unsubscribe { room: String },
    Ack {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    Ping,
}

/// GET /ws?role=<role>
pub async fn observer_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ObserverQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.hub, query.role))
}

async fn handle_socket(socket: WebSocket, hub: Arc<RealtimeBroadcastHub>, role: Option<String>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let mut deliveries = hub.connect(connection_id.clone(), role.clone());
    info!(connection_id = %connection_id, role = ?role, "Observer connected");

    let (mut sender, mut receiver) = socket.split();
    let (control_tx, mut control_rx) = mpsc::channel::<Value>(CONTROL_CAPACITY);

    let _ = control_tx
        .send(json!({ "type": "connected", "connectionId": connection_id }))
        .await;

    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(message) => message.to_frame(),
                    None => break,
                },
                control = control_rx.recv() => match control {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    let recv_hub = hub.clone();
    let recv_id = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => {
                    recv_hub.touch(&recv_id);
                    let reply = match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => apply_frame(&recv_hub, &recv_id, frame),
                        Err(e) => {
                            debug!(connection_id = %recv_id, error = %e, "Unreadable observer frame");
                            json!({ "type": "error", "message": "unrecognized frame" })
                        }
                    };
                    if control_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::Pong(_) | Message::Ping(_) => {
                    recv_hub.touch(&recv_id);
                }
                Message::Close(_) => break,
                Message::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    hub.disconnect(&connection_id);
    info!(connection_id = %connection_id, "Observer disconnected");
}

/// Apply one client frame to the hub and build the control reply
pub fn apply_frame(hub: &RealtimeBroadcastHub, connection_id: &str, frame: ClientFrame) -> Value {
    match frame {
        ClientFrame::Subscribe { room } => match hub.subscribe(connection_id, &room) {
            Ok(replayed) => json!({ "type": "subscribed", "room": room, "replayed": replayed }),
            Err(e) => {
                warn!(connection_id = %connection_id, room = %room, error = %e, "Subscribe failed");
                json!({ "type": "error", "message": e.to_string() })
            }
        },
        ClientFrame::Unsubscribe { room } => {
            let removed = hub.unsubscribe(connection_id, &room);
            json!({ "type": "unsubscribed", "room": room, "removed": removed })
        }
        ClientFrame::Ack { message_id } => {
            let acknowledged = hub.acknowledge(connection_id, &message_id);
            json!({ "type": "acked", "messageId": message_id, "acknowledged": acknowledged })
        }
        ClientFrame::Ping => json!({ "type": "pong" }),
    }
}
