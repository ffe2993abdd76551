// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Operational HTTP endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::manager::{Identity, ManagerStats};
use crate::message::{Message, Role};
use crate::state::AppState;
use crate::transport::auth::require_admin;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connected_users: usize,
    pub total_connections: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: ManagerStats,
    pub users: BTreeMap<String, usize>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRequest {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub online: bool,
    pub connection_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub presence: BTreeMap<String, UserPresence>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub require_ack: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
    pub message: String,
    pub online: bool,
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Restrict to one role (`driver`, `rider`, ...).
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub success: bool,
    pub message: String,
}

// -- Handlers -----------------------------------------------------------------

/// `GET /ws/health`
pub async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let hub = s.manager.hub();
    Json(HealthResponse {
        status: "healthy".to_owned(),
        connected_users: hub.connected_users(),
        total_connections: hub.total_connections(),
        timestamp: Utc::now(),
    })
}

/// `GET /ws/stats` (admin)
pub async fn stats(
    State(s): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<StatsResponse>, HandlerError> {
    require_admin(&identity)?;
    Ok(Json(StatsResponse {
        stats: s.manager.stats(),
        users: s.manager.hub().debug_snapshot(),
        timestamp: Utc::now(),
    }))
}

/// `POST /ws/presence`
pub async fn presence(
    State(s): State<Arc<AppState>>,
    Json(req): Json<PresenceRequest>,
) -> impl IntoResponse {
    let hub = s.manager.hub();
    let mut presence = BTreeMap::new();
    for user_id in req.user_ids {
        let online = hub.is_user_online(&user_id).await;
        let connection_count = hub.user_connection_count(&user_id);
        presence.insert(user_id, UserPresence { online, connection_count });
    }
    Json(PresenceResponse { presence })
}

/// `POST /ws/send`
pub async fn send(
    State(s): State<Arc<AppState>>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, HandlerError> {
    if req.user_id.is_empty() || req.kind.is_empty() {
        return Err(HandlerError::bad_request("userId and type are required"));
    }
    let mut message = Message::new(req.kind, req.data);
    if req.require_ack {
        message = message.acked();
    }

    let online = s.manager.send_message(&req.user_id, message).await;
    let text = if online { "message sent" } else { "user offline" };
    Ok(Json(SendResponse { success: online, message: text.to_owned(), online }))
}

/// `POST /ws/broadcast` (admin)
pub async fn broadcast(
    State(s): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, HandlerError> {
    require_admin(&identity)?;
    if req.kind.is_empty() {
        return Err(HandlerError::bad_request("type is required"));
    }
    let message = Message::new(req.kind, req.data);
    match req.role.as_deref() {
        Some(role) => s.manager.hub().broadcast_to_role(Role::parse(role), message).await,
        None => s.manager.hub().broadcast(message).await,
    }
    Ok(Json(BroadcastResponse { success: true, message: "broadcast sent".to_owned() }))
}
