// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A single authenticated WebSocket connection: identity, bounded outbound
//! queue, and the read/write pumps that move frames between the socket and
//! the hub.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use axum::extract::ws::Message as WsMessage;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorCode, HandlerError};
use crate::handlers::{self, HandlerTable};
use crate::hub::Hub;
use crate::message::{Message, MessageType, Role};

/// Timing and capacity knobs for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub buffer_size: usize,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub ack_timeout: Duration,
    pub max_ack_retries: u32,
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Queue full; the message was dropped.
    Full,
    /// Queue already closed.
    Closed,
}

/// Everything needed to create a [`Connection`].
pub struct ConnectionInit {
    pub user_id: String,
    pub role: Role,
    pub user_agent: String,
    pub hub: Weak<Hub>,
    pub handlers: Option<HandlerTable>,
    pub settings: ConnectionSettings,
}

pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub role: Role,
    pub user_agent: String,
    pub connected_at: DateTime<Utc>,
    settings: ConnectionSettings,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    last_heartbeat: Mutex<Instant>,
    pending_acks: Mutex<HashMap<String, Message>>,
    dropped: AtomicU64,
    cancel: CancellationToken,
    hub: Weak<Hub>,
    handlers: Option<HandlerTable>,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue.
    pub fn new(init: ConnectionInit) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(init.settings.buffer_size.max(1));
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: init.user_id,
            role: init.role,
            user_agent: init.user_agent,
            connected_at: Utc::now(),
            settings: init.settings,
            outbound: Mutex::new(Some(tx)),
            last_heartbeat: Mutex::new(Instant::now()),
            pending_acks: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            hub: init.hub,
            handlers: init.handlers,
        });
        (conn, rx)
    }

    /// Non-blocking enqueue onto the outbound queue. Never waits on a slow
    /// client: a full queue drops the message.
    pub fn enqueue(&self, msg: Message) -> Enqueue {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(msg) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(msg)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conn_id = %self.id,
                    user_id = %self.user_id,
                    kind = %msg.kind,
                    "outbound queue full, dropping message"
                );
                Enqueue::Full
            }
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Close the outbound queue. The write pump drains what is queued, sends
    /// a close frame, and stops. Idempotent.
    pub fn close(&self) {
        self.outbound.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Token cancelled once either pump stops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn last_heartbeat(&self) -> Instant {
        *self.last_heartbeat.lock()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().len()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// The owning hub, if it is still alive.
    pub fn hub(&self) -> Result<Arc<Hub>, HandlerError> {
        self.hub.upgrade().ok_or_else(|| HandlerError::unavailable("hub is shutting down"))
    }

    /// Enqueue an `error` envelope. Never closes the connection.
    pub fn send_error(&self, code: ErrorCode, message: &str, request_id: Option<String>) {
        let data = json!({ "error": message, "code": code.as_str() });
        let msg = Message::with_json(MessageType::ERROR, data).reply_to(request_id);
        self.enqueue(msg);
    }

    /// Enqueue an `ack` envelope echoing the request id.
    pub fn send_ack(&self, request_id: Option<String>, data: serde_json::Value) {
        self.enqueue(Message::with_json(MessageType::ACK, data).reply_to(request_id));
    }

    /// Settle a pending ack. Unknown ids are ignored.
    pub fn acknowledge(&self, message_id: &str) -> bool {
        let settled = self.pending_acks.lock().remove(message_id).is_some();
        if settled {
            debug!(conn_id = %self.id, message_id, "ack received");
        }
        settled
    }

    fn touch(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Run both pumps until the connection ends, then unregister.
    pub async fn run<S, R, E>(self: Arc<Self>, rx: mpsc::Receiver<Message>, sink: S, stream: R)
    where
        S: Sink<WsMessage> + Unpin + Send + 'static,
        S::Error: Display,
        R: Stream<Item = Result<WsMessage, E>> + Unpin + Send,
        E: Display,
    {
        let writer = tokio::spawn(Arc::clone(&self).write_pump(rx, sink));
        Arc::clone(&self).read_pump(stream).await;
        if let Err(e) = writer.await {
            error!(conn_id = %self.id, "write pump panicked: {e}");
        }
    }

    /// Read frames until the socket closes, errors, goes idle past
    /// `pong_wait`, or the write side stops.
    pub async fn read_pump<R, E>(self: Arc<Self>, mut stream: R)
    where
        R: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: Display,
    {
        let pong_wait = self.settings.pong_wait;
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = tokio::time::timeout(pong_wait, stream.next()) => frame,
            };
            let frame = match frame {
                Err(_) => {
                    info!(conn_id = %self.id, user_id = %self.user_id, "read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(conn_id = %self.id, "socket read error: {e}");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.touch();
            match frame {
                WsMessage::Text(text) => self.handle_text(text.as_str()).await,
                WsMessage::Pong(_) => {
                    if let Some(hub) = self.hub.upgrade() {
                        hub.refresh_presence(&self.user_id);
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Binary(_) => {
                    self.send_error(ErrorCode::BadRequest, "binary frames are not supported", None)
                }
                WsMessage::Ping(_) => {}
            }
        }

        if let Some(hub) = self.hub.upgrade() {
            hub.unregister(Arc::clone(&self)).await;
        }
        self.close();
        self.cancel.cancel();
    }

    /// Drain the outbound queue to the socket and keep the peer alive with
    /// periodic pings.
    pub async fn write_pump<S>(self: Arc<Self>, mut rx: mpsc::Receiver<Message>, mut sink: S)
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: Display,
    {
        let write_wait = self.settings.write_wait;
        let ping_period = self.settings.ping_period;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = tokio::time::timeout(write_wait, sink.send(WsMessage::Close(None))).await;
                        break;
                    };
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(conn_id = %self.id, kind = %msg.kind, "failed to serialize message: {e}");
                            continue;
                        }
                    };
                    match tokio::time::timeout(write_wait, sink.send(WsMessage::Text(text.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!(conn_id = %self.id, "socket write error: {e}");
                            break;
                        }
                        Err(_) => {
                            warn!(conn_id = %self.id, "write deadline exceeded");
                            break;
                        }
                    }
                    if msg.require_ack {
                        self.track_ack(msg);
                    }
                }
                _ = ping.tick() => {
                    let sent = tokio::time::timeout(write_wait, sink.send(WsMessage::Ping(Bytes::new()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        debug!(conn_id = %self.id, "ping failed");
                        break;
                    }
                }
            }
        }

        self.cancel.cancel();
    }

    async fn handle_text(self: &Arc<Self>, text: &str) {
        let mut msg: Message = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn_id = %self.id, "invalid message: {e}");
                self.send_error(ErrorCode::BadRequest, "invalid message format", None);
                return;
            }
        };
        // Clients cannot impersonate other senders.
        msg.data.insert("senderId".to_owned(), json!(self.user_id));
        self.dispatch(msg).await;
    }

    /// Route an inbound message to its handler and report failures in-band.
    pub async fn dispatch(self: &Arc<Self>, msg: Message) {
        let request_id = msg.request_id.clone();
        let kind = msg.kind.clone();
        let handler = self.handlers.as_ref().and_then(|table| table.get(&kind));
        let result = match handler {
            Some(handler) => handler(Arc::clone(self), msg).await,
            None => handlers::builtin(self, msg).await,
        };
        if let Err(e) = result {
            debug!(conn_id = %self.id, %kind, code = %e.code, "handler error: {}", e.message);
            if e.code == ErrorCode::Internal {
                error!(conn_id = %self.id, %kind, "handler failed: {}", e.message);
            }
            self.send_error(e.code, &e.message, request_id);
        }
    }

    fn track_ack(self: &Arc<Self>, msg: Message) {
        let Some(id) = msg.message_id.clone() else {
            return;
        };
        {
            let mut pending = self.pending_acks.lock();
            if msg.retry_count == 0 {
                pending.insert(id.clone(), msg);
            } else if !pending.contains_key(&id) {
                // Acked while the retry sat in the queue.
                return;
            }
        }
        self.arm_ack_timer(id);
    }

    fn arm_ack_timer(self: &Arc<Self>, message_id: String) {
        let conn = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let timeout = self.settings.ack_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(conn) = conn.upgrade() {
                        conn.check_ack(message_id);
                    }
                }
            }
        });
    }

    fn check_ack(self: &Arc<Self>, message_id: String) {
        let retry = {
            let mut pending = self.pending_acks.lock();
            let Some(msg) = pending.get_mut(&message_id) else {
                return;
            };
            if msg.retry_count < self.settings.max_ack_retries {
                msg.retry_count += 1;
                Some(msg.clone())
            } else {
                pending.remove(&message_id);
                None
            }
        };

        match retry {
            Some(msg) => {
                info!(conn_id = %self.id, %message_id, attempt = msg.retry_count, "resending unacked message");
                if self.enqueue(msg) != Enqueue::Queued {
                    // Not written, so the write pump will not re-arm the timer.
                    self.arm_ack_timer(message_id);
                }
            }
            None => {
                error!(conn_id = %self.id, %message_id, "message not acknowledged after retries, giving up");
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
