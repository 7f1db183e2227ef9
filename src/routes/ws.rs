use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::state::AppState;

/// Subscription control frames a websocket client may send.
#[derive(Deserialize)]
struct ClientFrame {
    action: String,
    resource: Option<String>,
}

/// The HTTP upgrade endpoint for the push channel. The token travels as a
/// query parameter because browsers cannot set headers on websocket
/// handshakes.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(token) = params.get("token") else {
        tracing::warn!("🚫 Unauthorized WebSocket: no token provided in query params");
        return (axum::http::StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    match state.tokens.resolve(token).await {
        Ok(claims) => {
            let agent_id = claims.sub.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, state, agent_id))
                .into_response()
        }
        Err(_) => {
            tracing::warn!("🚫 Unauthorized WebSocket: token did not resolve");
            (axum::http::StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
        }
    }
}

/// Registers the socket as a hub subscriber and pumps events out while
/// accepting subscribe/unsubscribe frames in.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, agent_id: String) {
    let subscriber_id = format!("ws-{}", uuid::Uuid::new_v4());
    let mut rx = state.hub.register(&subscriber_id, &agent_id);

    let (mut sender, mut receiver) = socket.split();
    tracing::info!(subscriber = %subscriber_id, agent = %agent_id, "🔗 WebSocket connected");

    let mut send_task = tokio::spawn(async move {
        // Runs until the hub drops our sink (reap or unsubscribe) or the
        // socket goes away.
        while let Some(payload) = rx.recv().await {
            match serde_json::to_string(&payload) {
                Ok(json_str) => {
                    if sender.send(Message::Text(json_str)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "WS payload serialization failed"),
            }
        }
    });

    let hub_in = Arc::clone(&state.hub);
    let in_id = subscriber_id.clone();
    let owner = agent_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            // Any inbound traffic counts as liveness.
            hub_in.touch(&in_id);
            if let Message::Text(text) = message {
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    continue;
                };
                match (frame.action.as_str(), frame.resource) {
                    ("subscribe", Some(uri)) => {
                        if allowed_subscription(&uri, &owner) {
                            hub_in.subscribe(&in_id, &uri);
                        } else {
                            tracing::warn!(subscriber = %in_id, uri = %uri, "🚫 subscription refused");
                        }
                    }
                    ("unsubscribe", Some(uri)) => hub_in.unsubscribe(&in_id, Some(&uri)),
                    ("ping", _) => {}
                    _ => {}
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.unsubscribe(&subscriber_id, None);
    tracing::info!(subscriber = %subscriber_id, "🔗 WebSocket disconnected");
}

/// Session resources are open to any authenticated subscriber (delivery is
/// already visibility-trimmed upstream); memory resources only make sense
/// for their owner.
fn allowed_subscription(uri: &str, agent_id: &str) -> bool {
    if uri.starts_with("session://") {
        return true;
    }
    if let Some(rest) = uri.strip_prefix("agent://") {
        if let Some(owner) = rest.strip_suffix("/memory") {
            return owner == agent_id;
        }
    }
    false
}
