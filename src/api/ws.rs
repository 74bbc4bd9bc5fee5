// =============================================================================
// Alert WebSocket — per-user server-push notifications
// =============================================================================
//
// One socket per user at `/alerts/{user_id}`. The handler registers the
// user's push channel with the hub; composite ticks drop formatted alert
// texts into that channel and this task forwards them as JSON frames.
// Inbound frames are a tiny command protocol: ping / get_status /
// get_my_alerts.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app_state::AppState;

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// `GET /alerts/{user_id}` (WebSocket upgrade).
pub async fn alerts_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_alert_socket(socket, state, user_id))
}

async fn handle_alert_socket(socket: WebSocket, state: Arc<AppState>, user_id: i64) {
    let mut rx = state.user_hub.register(user_id);
    let (mut sender, mut receiver) = socket.split();

    // Greeting + the user's current subscription stats.
    let greeting = json!({
        "type": "connected",
        "message": "connected to the alert feed",
        "user_id": user_id,
        "timestamp": now_iso(),
    });
    let subscriptions = state.commands.list_alerts(user_id);
    let stats = json!({
        "type": "user_stats",
        "alerts_count": subscriptions.len(),
        "alert_ids": subscriptions.iter().map(|a| a.alert_id.clone()).collect::<Vec<_>>(),
        "timestamp": now_iso(),
    });
    for msg in [greeting, stats] {
        if sender.send(Message::Text(msg.to_string())).await.is_err() {
            state.user_hub.unregister(user_id);
            return;
        }
    }
    info!(user_id, "alert socket connected");

    // `replaced` distinguishes our channel being superseded by a newer
    // connection (do not unregister) from the socket closing (do).
    let mut replaced = false;
    loop {
        tokio::select! {
            notification = rx.recv() => {
                match notification {
                    Some(text) => {
                        let frame = json!({
                            "type": "alert",
                            "message": text,
                            "timestamp": now_iso(),
                        });
                        if let Err(e) = sender.send(Message::Text(frame.to_string())).await {
                            debug!(user_id, error = %e, "alert push failed — disconnecting");
                            break;
                        }
                    }
                    None => {
                        replaced = true;
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&state, user_id, &text);
                        if sender.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(user_id, "alert socket closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(user_id, error = %e, "alert socket receive error");
                        break;
                    }
                }
            }
        }
    }

    if !replaced {
        state.user_hub.unregister(user_id);
    }
}

/// Inbound command protocol: `{"type": "ping" | "get_status" | "get_my_alerts"}`.
fn handle_command(state: &AppState, user_id: i64, raw: &str) -> serde_json::Value {
    let parsed: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            return json!({
                "type": "error",
                "message": "invalid JSON",
                "timestamp": now_iso(),
            });
        }
    };

    match parsed["type"].as_str() {
        Some("ping") => json!({
            "type": "pong",
            "timestamp": now_iso(),
        }),
        Some("get_status") => {
            let mine = state.commands.list_alerts(user_id);
            json!({
                "type": "status",
                "connected_users": state.user_hub.connected_users().len(),
                "your_alerts": mine.len(),
                "total_alerts": state.engine.len(),
                "timestamp": now_iso(),
            })
        }
        Some("get_my_alerts") => {
            let mine = state.commands.list_alerts(user_id);
            let alerts: Vec<serde_json::Value> = mine
                .iter()
                .map(|a| {
                    json!({
                        "alert_id": a.alert_id,
                        "expression": a.expression,
                        "subscribers_count": a.subscribers_count,
                        "cooldown": a.cooldown_sec,
                    })
                })
                .collect();
            json!({
                "type": "my_alerts",
                "alerts": alerts,
                "timestamp": now_iso(),
            })
        }
        other => json!({
            "type": "error",
            "message": format!("unknown command: {}", other.unwrap_or("<missing type>")),
            "timestamp": now_iso(),
        }),
    }
}
