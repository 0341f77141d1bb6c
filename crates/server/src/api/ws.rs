//! WebSocket stream of batch events.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use cartpilot_core::{BatchStatus, Event, Received};

use crate::metrics::{WS_MESSAGES_SENT, WS_SUBSCRIBERS};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket message sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Status of every known batch, sent once on connect.
    Snapshot { batches: Vec<BatchStatus> },
    /// One event, in publish order.
    Event { event: Event },
    /// The client fell behind and this many events were dropped for it.
    Lagged { skipped: u64 },
    /// Server heartbeat (sent periodically to keep connection alive).
    Heartbeat { timestamp: i64 },
}

impl WsMessage {
    fn type_name(&self) -> &'static str {
        match self {
            WsMessage::Snapshot { .. } => "snapshot",
            WsMessage::Event { .. } => "event",
            WsMessage::Lagged { .. } => "lagged",
            WsMessage::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Serialize and send one message. False once the client is gone.
async fn send_message<S>(sender: &mut S, msg: &WsMessage) -> bool
where
    S: SinkExt<Message> + Unpin,
{
    match serde_json::to_string(msg) {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                debug!("WebSocket send failed, client disconnected");
                return false;
            }
            WS_MESSAGES_SENT.with_label_values(&[msg.type_name()]).inc();
            true
        }
        Err(e) => {
            error!("Failed to serialize WsMessage: {}", e);
            true
        }
    }
}

/// Handle a single WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before taking the snapshot so nothing published in between is missed
    let mut subscription = state.broadcaster().subscribe();
    let snapshot = WsMessage::Snapshot {
        batches: state.controller().list().await,
    };

    WS_SUBSCRIBERS.inc();
    info!("WebSocket client connected");

    let send_task = tokio::spawn(async move {
        if !send_message(&mut sender, &snapshot).await {
            return;
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            let msg = tokio::select! {
                received = subscription.recv() => match received {
                    Some(Received::Event(event)) => WsMessage::Event { event },
                    Some(Received::Lagged(skipped)) => {
                        warn!("WebSocket client lagged, skipped {} events", skipped);
                        WsMessage::Lagged { skipped }
                    }
                    None => {
                        debug!("Event broadcaster closed");
                        break;
                    }
                },
                _ = heartbeat.tick() => WsMessage::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp(),
                },
            };

            if !send_message(&mut sender, &msg).await {
                break;
            }
        }
    });

    // Handle incoming messages from client (ping/pong, close)
    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client requested close");
                break;
            }
            Ok(Message::Text(text)) => {
                debug!("Ignoring text message from client: {}", text);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    send_task.abort();
    WS_SUBSCRIBERS.dec();
    info!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartpilot_core::{BatchId, EventKind, EventLevel};

    #[test]
    fn test_event_message_shape() {
        let event = Event::new(BatchId::new(), EventLevel::Info, EventKind::Log, "points: 120");
        let json = serde_json::to_value(WsMessage::Event { event }).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["event"]["kind"], "log");
        assert_eq!(json["event"]["message"], "points: 120");
    }

    #[test]
    fn test_lagged_message_shape() {
        let json = serde_json::to_value(WsMessage::Lagged { skipped: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "lagged", "skipped": 7 }));
    }

    #[test]
    fn test_snapshot_round_trips() {
        let msg = WsMessage::Snapshot { batches: vec![] };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: WsMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WsMessage::Snapshot { batches } if batches.is_empty()));
    }
}
