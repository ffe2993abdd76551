// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Inbound message handlers: the pluggable table plus the built-in kinds
//! every connection understands.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use crate::connection::Connection;
use crate::error::HandlerError;
use crate::message::{Message, MessageType, Role};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// A message handler. Receives the originating connection and the message
/// with `senderId` already stamped.
pub type Handler = Arc<dyn Fn(Arc<Connection>, Message) -> HandlerFuture + Send + Sync>;

/// Wrap an async function or closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Connection>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |conn, msg| Box::pin(f(conn, msg)))
}

/// Shared, mutable map from message type to handler. Cloning shares the
/// table, so registrations are visible to connections already running.
#[derive(Clone, Default)]
pub struct HandlerTable {
    inner: Arc<RwLock<HashMap<MessageType, Handler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table pre-populated with the default handlers.
    pub fn with_defaults() -> Self {
        let table = Self::new();
        table.register(MessageType::PING, handler_fn(ping));
        table.register(MessageType::TYPING, handler_fn(typing));
        table.register(MessageType::READ_RECEIPT, handler_fn(read_receipt));
        table.register(MessageType::PRESENCE, handler_fn(presence));
        table
    }

    /// Register or replace the handler for `kind`.
    pub fn register(&self, kind: impl Into<MessageType>, handler: Handler) {
        self.inner.write().insert(kind.into(), handler);
    }

    pub fn get(&self, kind: &MessageType) -> Option<Handler> {
        self.inner.read().get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<MessageType> {
        let mut kinds: Vec<_> = self.inner.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Fallback for kinds missing from the table.
pub async fn builtin(conn: &Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    let conn = Arc::clone(conn);
    match msg.kind.as_str() {
        MessageType::PING => ping(conn, msg).await,
        MessageType::ACK => ack(conn, msg).await,
        MessageType::TYPING => typing(conn, msg).await,
        MessageType::READ_RECEIPT => read_receipt(conn, msg).await,
        MessageType::PRESENCE => presence(conn, msg).await,
        MessageType::DRIVER_LOCATION_UPDATE => location_update(conn, msg).await,
        other => Err(HandlerError::bad_request(format!("unhandled message type: {other}"))),
    }
}

/// Reply `pong` with the server time.
pub async fn ping(conn: Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    let reply = Message::with_json(MessageType::PONG, json!({ "timestamp": chrono::Utc::now() }))
        .reply_to(msg.request_id);
    conn.enqueue(reply);
    Ok(())
}

/// Settle a pending delivery by `data.messageId`.
pub async fn ack(conn: Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    match msg.str_field("messageId") {
        Some(id) => {
            conn.acknowledge(id);
        }
        None => tracing::warn!(conn_id = %conn.id, "ack without messageId"),
    }
    Ok(())
}

/// Relay a typing indicator to `data.receiverId`.
pub async fn typing(conn: Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    let receiver = msg
        .str_field("receiverId")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::bad_request("receiverId is required"))?;
    let is_typing = msg.bool_field("isTyping").unwrap_or(false);

    let relay = Message::with_json(
        MessageType::TYPING,
        json!({ "senderId": conn.user_id, "isTyping": is_typing }),
    )
    .to(receiver);
    conn.hub()?.send_to_user(receiver, relay).await;
    conn.send_ack(msg.request_id, json!({ "success": true }));
    Ok(())
}

/// Tell the author of `data.messageIds` that this user read them. The
/// author is `data.authorId`, or `data.receiverId` for older clients.
pub async fn read_receipt(conn: Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    let author = msg
        .str_field("authorId")
        .or_else(|| msg.str_field("receiverId"))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerError::bad_request("authorId is required"))?;
    let message_ids = msg
        .data
        .get("messageIds")
        .filter(|v| v.is_array())
        .cloned()
        .ok_or_else(|| HandlerError::bad_request("messageIds must be an array"))?;

    let receipt = Message::with_json(
        MessageType::READ_RECEIPT,
        json!({
            "readBy": conn.user_id,
            "messageIds": message_ids,
            "readAt": chrono::Utc::now(),
        }),
    )
    .to(author);
    conn.hub()?.send_to_user(author, receipt).await;
    conn.send_ack(msg.request_id, json!({ "success": true }));
    Ok(())
}

/// Answer whether each of `data.userIds` is online.
pub async fn presence(conn: Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    let user_ids = msg
        .str_list("userIds")
        .ok_or_else(|| HandlerError::bad_request("userIds must be an array"))?;
    let hub = conn.hub()?;

    let mut presence = Map::new();
    for user_id in user_ids {
        let online = hub.is_user_online(&user_id).await;
        presence.insert(user_id, Value::Bool(online));
    }
    let reply = Message::with_json(MessageType::PRESENCE, json!({ "presence": presence }))
        .reply_to(msg.request_id);
    conn.enqueue(reply);
    Ok(())
}

/// Broadcast a driver's position. Drivers only.
pub async fn location_update(conn: Arc<Connection>, msg: Message) -> Result<(), HandlerError> {
    if conn.role != Role::Driver {
        return Err(HandlerError::forbidden("only drivers can send location updates"));
    }
    let (Some(latitude), Some(longitude)) = (msg.f64_field("latitude"), msg.f64_field("longitude"))
    else {
        return Err(HandlerError::bad_request("latitude and longitude are required"));
    };
    if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return Err(HandlerError::bad_request("coordinates out of range"));
    }

    let update = Message::with_json(
        MessageType::DRIVER_LOCATION_UPDATE,
        json!({
            "driverId": conn.user_id,
            "latitude": latitude,
            "longitude": longitude,
            "timestamp": chrono::Utc::now(),
        }),
    );
    conn.hub()?.broadcast(update).await;
    conn.send_ack(msg.request_id, json!({ "success": true }));
    Ok(())
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;
