// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket upgrade endpoint for ride clients.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::ErrorCode;
use crate::manager::Identity;
use crate::message::{Message, MessageType};
use crate::state::AppState;
use crate::transport::auth;

/// Query parameters for the WS upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    /// Token from a previous session's welcome message.
    #[serde(default, alias = "reconnectToken")]
    pub reconnect_token: Option<String>,
}

/// `GET /ws/connect`: authenticate, then upgrade.
pub async fn ws_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| auth::bearer_token(&headers));
    let Some(identity) = token.and_then(|t| state.authenticator.verify(t)) else {
        debug!("rejecting ws upgrade: missing or invalid token");
        return ErrorCode::Unauthorized.to_http_response("unauthorized").into_response();
    };

    let config = state.config();
    if state.manager.hub().total_connections() >= config.max_connections {
        warn!(user_id = %identity.user_id, max = config.max_connections, "connection limit reached");
        return ErrorCode::Unavailable.to_http_response("connection limit reached").into_response();
    }

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let max_message_size = config.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| {
            handle_socket(state, identity, user_agent, query.reconnect_token, socket)
        })
        .into_response()
}

/// Per-connection task: register, greet, replay offline items, pump.
async fn handle_socket(
    state: Arc<AppState>,
    identity: Identity,
    user_agent: String,
    reconnect_token: Option<String>,
    socket: WebSocket,
) {
    let manager = Arc::clone(&state.manager);
    let (conn, rx) = manager.new_connection(identity, user_agent);
    if !manager.hub().register(Arc::clone(&conn)).await {
        warn!(conn_id = %conn.id, "hub not running, dropping connection");
        return;
    }
    info!(
        conn_id = %conn.id,
        user_id = %conn.user_id,
        role = %conn.role,
        reconnect = reconnect_token.is_some(),
        "websocket connected"
    );

    conn.enqueue(Message::with_json(
        MessageType::SYSTEM,
        json!({
            "message": "Connected successfully",
            "clientId": conn.id,
            "reconnectToken": new_reconnect_token(),
            "serverTime": chrono::Utc::now(),
        }),
    ));

    {
        let manager = Arc::clone(&manager);
        let conn = Arc::clone(&conn);
        tokio::spawn(async move { manager.deliver_offline(&conn).await });
    }

    let (sink, stream) = socket.split();
    conn.run(rx, sink, stream).await;
}

/// 32 random bytes, base64url without padding.
fn new_reconnect_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
