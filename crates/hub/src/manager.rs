// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level owner: configuration, hub, handler table, stores, and the
//! background loops. Injected into the transport as `Arc<Manager>`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionInit, Enqueue};
use crate::handlers::{Handler, HandlerTable};
use crate::hub::{Hub, HubOptions, DEFAULT_CHANNEL_CAPACITY};
use crate::message::{Message, MessageType, Role};
use crate::store::kv::KvStore;
use crate::store::memory::{MemoryStore, StoreLimits};
use crate::store::{MessageStore, NotificationStore, PresenceStore};

/// Maximum stored messages replayed to a reconnecting device.
const OFFLINE_REPLAY_LIMIT: usize = 100;

/// Store backends handed to the manager. Any may be absent.
#[derive(Clone, Default)]
pub struct Stores {
    pub presence: Option<Arc<dyn PresenceStore>>,
    pub notifications: Option<Arc<dyn NotificationStore>>,
    pub messages: Option<Arc<dyn MessageStore>>,
}

impl Stores {
    /// All three backed by one in-process store.
    pub fn memory(limits: StoreLimits) -> Self {
        let store = Arc::new(MemoryStore::new(limits));
        Self {
            presence: Some(Arc::clone(&store) as Arc<dyn PresenceStore>),
            notifications: Some(Arc::clone(&store) as Arc<dyn NotificationStore>),
            messages: Some(store as Arc<dyn MessageStore>),
        }
    }

    /// All three backed by JetStream key-value buckets.
    pub async fn kv(
        client: async_nats::Client,
        prefix: &str,
        limits: StoreLimits,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(KvStore::open(client, prefix, limits).await?);
        Ok(Self {
            presence: Some(Arc::clone(&store) as Arc<dyn PresenceStore>),
            notifications: Some(Arc::clone(&store) as Arc<dyn NotificationStore>),
            messages: Some(store as Arc<dyn MessageStore>),
        })
    }
}

/// Authenticated caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

/// Operational counters reported by `/ws/stats` and the metrics loop.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub node_id: String,
    pub connected_users: usize,
    pub total_connections: usize,
    pub average_connections_per_user: f64,
    pub connected_drivers: usize,
    pub connected_riders: usize,
    pub delivered: u64,
    pub dropped: u64,
    pub handlers: Vec<String>,
    pub presence_enabled: bool,
    pub persistence_enabled: bool,
    pub message_store_enabled: bool,
}

pub struct Manager {
    config: HubConfig,
    hub: Arc<Hub>,
    handlers: HandlerTable,
    notifications: Option<Arc<dyn NotificationStore>>,
    messages: Option<Arc<dyn MessageStore>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(config: HubConfig, bus: Arc<dyn Bus>, stores: Stores) -> Arc<Self> {
        let node_id =
            config.node_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let hub = Hub::new(HubOptions {
            node_id,
            bus,
            presence: stores.presence.filter(|_| config.enable_presence),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        });
        Arc::new(Self {
            hub,
            handlers: HandlerTable::with_defaults(),
            notifications: stores.notifications.filter(|_| config.persistence_enabled),
            messages: stores.messages.filter(|_| config.enable_message_store),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Spawn the hub and the background loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        tasks.push(self.hub.spawn(self.shutdown.clone()));
        tasks.push(tokio::spawn(monitor_heartbeats(
            Arc::clone(&self.hub),
            self.config.heartbeat_interval(),
            self.config.pong_wait(),
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(log_metrics(
            Arc::clone(&self.hub),
            self.config.metrics_interval(),
            self.shutdown.clone(),
        )));
        if let Some(ref store) = self.messages {
            tasks.push(tokio::spawn(sweep_messages(
                Arc::clone(store),
                self.config.retention_sweep_interval(),
                self.config.message_retention(),
                self.shutdown.clone(),
            )));
        }
        info!(node_id = %self.hub.node_id(), tasks = tasks.len(), "manager started");
    }

    /// Cancel everything and wait up to `timeout` for background tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("manager shutting down");
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        match tokio::time::timeout(timeout, join_all(tasks)).await {
            Ok(_) => info!("manager stopped"),
            Err(_) => warn!(?timeout, "timed out waiting for background tasks"),
        }
    }

    /// Register or replace a handler. Takes effect for live connections.
    pub fn register_handler(&self, kind: impl Into<MessageType>, handler: Handler) {
        let kind = kind.into();
        debug!(%kind, "handler registered");
        self.handlers.register(kind, handler);
    }

    pub fn handler(&self, kind: &MessageType) -> Option<Handler> {
        self.handlers.get(kind)
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Build a connection bound to this manager's hub and handler table.
    pub fn new_connection(
        &self,
        identity: Identity,
        user_agent: String,
    ) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<Message>) {
        Connection::new(ConnectionInit {
            user_id: identity.user_id,
            role: identity.role,
            user_agent,
            hub: Arc::downgrade(&self.hub),
            handlers: Some(self.handlers.clone()),
            settings: self.config.connection_settings(),
        })
    }

    /// Store (when persistence is on) and deliver a notification. Returns
    /// whether the user was online.
    pub async fn send_notification(&self, user_id: &str, payload: Value) -> bool {
        if let Some(ref store) = self.notifications {
            if let Err(e) = store.push(user_id, payload.clone()).await {
                warn!(user_id, "failed to store notification: {e:#}");
            }
        }

        let online = self.hub.is_user_online(user_id).await;
        if online {
            let message =
                Message::with_json(MessageType::NOTIFICATION, json!({ "notification": payload }));
            self.hub.send_to_user(user_id, message).await;
        } else {
            debug!(user_id, "user offline, notification kept for later");
        }
        online
    }

    /// Send the same notification to several users.
    pub async fn broadcast_notification(&self, user_ids: &[String], payload: Value) -> usize {
        let mut online = 0;
        for user_id in user_ids {
            if self.send_notification(user_id, payload.clone()).await {
                online += 1;
            }
        }
        online
    }

    /// Deliver to an online user, or keep it in the message store. Returns
    /// whether the user was online.
    pub async fn send_message(&self, user_id: &str, message: Message) -> bool {
        if self.hub.is_user_online(user_id).await {
            self.hub.send_to_user(user_id, message).await;
            return true;
        }
        if let Some(ref store) = self.messages {
            if let Err(e) = store.store(user_id, message).await {
                warn!(user_id, "failed to store message: {e:#}");
            }
        }
        false
    }

    /// Push stored notifications and messages to a freshly connected device.
    pub async fn deliver_offline(&self, conn: &Connection) {
        let user_id = conn.user_id.as_str();

        if let Some(ref store) = self.notifications {
            match store.pending(user_id).await {
                Ok(pending) if !pending.is_empty() => {
                    let count = pending.len();
                    let notifications: Vec<Value> =
                        pending.into_iter().map(|n| n.payload).collect();
                    let bulk = Message::with_json(
                        MessageType::NOTIFICATION_BULK,
                        json!({ "notifications": notifications, "count": count }),
                    );
                    match conn.enqueue(bulk) {
                        Enqueue::Queued => {
                            if let Err(e) = store.clear(user_id).await {
                                warn!(user_id, "failed to clear notifications: {e:#}");
                            }
                            info!(user_id, count, "delivered offline notifications");
                        }
                        outcome => {
                            warn!(user_id, count, ?outcome, "offline notifications kept for retry");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(user_id, "failed to load notifications: {e:#}"),
            }
        }

        if let Some(ref store) = self.messages {
            match store.pending(user_id, OFFLINE_REPLAY_LIMIT).await {
                Ok(pending) if !pending.is_empty() => {
                    let total = pending.len();
                    let mut ids = Vec::with_capacity(total);
                    for message in pending {
                        let id = message.message_id.clone();
                        if conn.enqueue(message) != Enqueue::Queued {
                            // Keep the rest in order for the next connect.
                            break;
                        }
                        ids.extend(id);
                    }
                    if !ids.is_empty() {
                        if let Err(e) = store.mark_delivered(user_id, &ids).await {
                            warn!(user_id, "failed to mark messages delivered: {e:#}");
                        }
                    }
                    info!(user_id, replayed = ids.len(), total, "replayed stored messages");
                }
                Ok(_) => {}
                Err(e) => warn!(user_id, "failed to load stored messages: {e:#}"),
            }
        }
    }

    pub fn stats(&self) -> ManagerStats {
        let hub = self.hub.stats();
        let average = if hub.connected_users == 0 {
            0.0
        } else {
            hub.total_connections as f64 / hub.connected_users as f64
        };
        ManagerStats {
            node_id: self.hub.node_id().to_owned(),
            connected_users: hub.connected_users,
            total_connections: hub.total_connections,
            average_connections_per_user: average,
            connected_drivers: hub.connected_drivers,
            connected_riders: hub.connected_riders,
            delivered: hub.delivered,
            dropped: hub.dropped,
            handlers: self.handlers.kinds().into_iter().map(|k| k.to_string()).collect(),
            presence_enabled: self.config.enable_presence,
            persistence_enabled: self.notifications.is_some(),
            message_store_enabled: self.messages.is_some(),
        }
    }
}

/// Count connections that have been silent longer than `pong_wait`.
async fn monitor_heartbeats(
    hub: Arc<Hub>,
    interval: Duration,
    pong_wait: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        let connections = hub.connections();
        let stale = connections.iter().filter(|c| c.last_heartbeat().elapsed() > pong_wait).count();
        if stale > 0 {
            warn!(stale, total = connections.len(), "connections past heartbeat deadline");
        } else {
            debug!(total = connections.len(), "heartbeat check");
        }
    }
}

async fn log_metrics(hub: Arc<Hub>, interval: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        let stats = hub.stats();
        info!(
            users = stats.connected_users,
            connections = stats.total_connections,
            drivers = stats.connected_drivers,
            riders = stats.connected_riders,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "hub stats"
        );
    }
}

async fn sweep_messages(
    store: Arc<dyn MessageStore>,
    interval: Duration,
    retention: Duration,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        match store.delete_old(retention).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired stored messages"),
            Err(e) => warn!("retention sweep failed: {e:#}"),
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
