// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection registry and delivery fan-out.
//!
//! A single dispatch task owns every mutation of the directory, consuming
//! the register, unregister, and broadcast channels. Readers take the
//! directory's read lock. Side effects that reach external systems (bus
//! publishes, presence writes) are handed to worker tasks through bounded
//! queues so the dispatch task never awaits I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusFrame};
use crate::connection::{Connection, Enqueue};
use crate::message::{Message, MessageType, Role};
use crate::store::{PresenceDevice, PresenceStore};

/// Capacity of the register, unregister, and broadcast channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the bus-publish and presence-write queues.
const SIDE_EFFECT_CAPACITY: usize = 1024;

/// Who a delivery is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    User(String),
    Role(Role),
}

impl Scope {
    fn of(message: &Message) -> Self {
        match message.target_user_id.as_deref() {
            Some(user) if !user.is_empty() => Self::User(user.to_owned()),
            _ => Self::All,
        }
    }
}

struct Delivery {
    scope: Scope,
    message: Message,
    /// Locally originated deliveries are also published to the bus.
    publish: bool,
}

struct Registration {
    conn: Arc<Connection>,
    done: oneshot::Sender<()>,
}

enum PresenceOp {
    Set { user_id: String, device: PresenceDevice },
    Remove { user_id: String, device_id: String },
    Refresh { user_id: String },
}

/// Receiving halves, taken by [`Hub::run`].
struct Inbox {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Registration>,
    broadcast_rx: mpsc::Receiver<Delivery>,
    bus_rx: mpsc::Receiver<BusFrame>,
    presence_rx: mpsc::Receiver<PresenceOp>,
}

/// Arena of open connections plus user and role indices.
#[derive(Default)]
struct Directory {
    connections: HashMap<String, Arc<Connection>>,
    by_user: HashMap<String, IndexSet<String>>,
    by_role: HashMap<Role, HashMap<String, IndexSet<String>>>,
}

impl Directory {
    /// Insert a connection; returns the user's device count afterwards.
    fn insert(&mut self, conn: Arc<Connection>) -> usize {
        let devices = self.by_user.entry(conn.user_id.clone()).or_default();
        devices.insert(conn.id.clone());
        let count = devices.len();
        self.by_role
            .entry(conn.role.clone())
            .or_default()
            .entry(conn.user_id.clone())
            .or_default()
            .insert(conn.id.clone());
        self.connections.insert(conn.id.clone(), conn);
        count
    }

    /// Remove a connection by id; returns it and the user's remaining device count.
    fn remove(&mut self, id: &str) -> Option<(Arc<Connection>, usize)> {
        let conn = self.connections.remove(id)?;
        let remaining = match self.by_user.get_mut(&conn.user_id) {
            Some(devices) => {
                devices.shift_remove(id);
                let remaining = devices.len();
                if remaining == 0 {
                    self.by_user.remove(&conn.user_id);
                }
                remaining
            }
            None => 0,
        };
        if let Some(users) = self.by_role.get_mut(&conn.role) {
            if let Some(devices) = users.get_mut(&conn.user_id) {
                devices.shift_remove(id);
                if devices.is_empty() {
                    users.remove(&conn.user_id);
                }
            }
            if users.is_empty() {
                self.by_role.remove(&conn.role);
            }
        }
        Some((conn, remaining))
    }

    fn resolve<'a>(
        &'a self,
        ids: &'a IndexSet<String>,
    ) -> impl Iterator<Item = Arc<Connection>> + 'a {
        ids.iter().filter_map(move |id| self.connections.get(id).cloned())
    }

    fn targets(&self, scope: &Scope) -> Vec<Arc<Connection>> {
        match scope {
            Scope::All => self.connections.values().cloned().collect(),
            Scope::User(user) => {
                self.by_user.get(user).map(|ids| self.resolve(ids).collect()).unwrap_or_default()
            }
            Scope::Role(role) => self
                .by_role
                .get(role)
                .map(|users| users.values().flat_map(|ids| self.resolve(ids)).collect())
                .unwrap_or_default(),
        }
    }

    fn role_user_count(&self, role: &Role) -> usize {
        self.by_role.get(role).map_or(0, HashMap::len)
    }

    fn has_role_user(&self, role: &Role, user_id: &str) -> bool {
        self.by_role.get(role).is_some_and(|users| users.contains_key(user_id))
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HubStats {
    pub connected_users: usize,
    pub total_connections: usize,
    pub connected_drivers: usize,
    pub connected_riders: usize,
    pub delivered: u64,
    pub dropped: u64,
}

pub struct HubOptions {
    pub node_id: String,
    pub bus: Arc<dyn Bus>,
    /// Presence is written only when a store is given.
    pub presence: Option<Arc<dyn PresenceStore>>,
    pub channel_capacity: usize,
}

pub struct Hub {
    node_id: String,
    directory: RwLock<Directory>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Registration>,
    broadcast_tx: mpsc::Sender<Delivery>,
    bus_tx: mpsc::Sender<BusFrame>,
    presence_tx: mpsc::Sender<PresenceOp>,
    inbox: Mutex<Option<Inbox>>,
    bus: Arc<dyn Bus>,
    presence: Option<Arc<dyn PresenceStore>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new(opts: HubOptions) -> Arc<Self> {
        let capacity = opts.channel_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (bus_tx, bus_rx) = mpsc::channel(SIDE_EFFECT_CAPACITY);
        let (presence_tx, presence_rx) = mpsc::channel(SIDE_EFFECT_CAPACITY);
        Arc::new(Self {
            node_id: opts.node_id,
            directory: RwLock::new(Directory::default()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            bus_tx,
            presence_tx,
            inbox: Mutex::new(Some(Inbox {
                register_rx,
                unregister_rx,
                broadcast_rx,
                bus_rx,
                presence_rx,
            })),
            bus: opts.bus,
            presence: opts.presence,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Spawn [`Hub::run`] on the runtime.
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(shutdown))
    }

    /// Run the dispatch loop until `shutdown` is cancelled. Spawns the bus
    /// subscriber, bus publisher, and presence writer and waits for them
    /// before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!("hub dispatch loop already started");
            return;
        };

        let mut workers = Vec::new();
        workers.push(tokio::spawn(publish_frames(
            Arc::clone(&self.bus),
            inbox.bus_rx,
            shutdown.clone(),
        )));
        match self.bus.subscribe().await {
            Ok(stream) => {
                let receiver = Arc::clone(&self).receive_frames(stream, shutdown.clone());
                workers.push(tokio::spawn(receiver));
            }
            Err(e) => error!("bus subscribe failed, cross-node delivery disabled: {e:#}"),
        }
        if let Some(ref store) = self.presence {
            workers.push(tokio::spawn(write_presence(
                Arc::clone(store),
                inbox.presence_rx,
                shutdown.clone(),
            )));
        }

        info!(node_id = %self.node_id, "hub running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(reg) = inbox.register_rx.recv() => self.register_client(reg),
                Some(reg) = inbox.unregister_rx.recv() => self.unregister_client(reg),
                Some(delivery) = inbox.broadcast_rx.recv() => self.deliver(&delivery),
            }
        }

        self.close_all();
        for worker in workers {
            let _ = worker.await;
        }
        info!("hub stopped");
    }

    /// Register a connection. Resolves once the dispatch loop has applied
    /// it; `false` if the hub is no longer running.
    pub async fn register(&self, conn: Arc<Connection>) -> bool {
        let (done, applied) = oneshot::channel();
        if self.register_tx.send(Registration { conn, done }).await.is_err() {
            return false;
        }
        applied.await.is_ok()
    }

    /// Unregister a connection. Unknown connections are ignored.
    pub async fn unregister(&self, conn: Arc<Connection>) {
        let (done, applied) = oneshot::channel();
        if self.unregister_tx.send(Registration { conn, done }).await.is_ok() {
            let _ = applied.await;
        }
    }

    /// Deliver to every device of `user_id` on every node.
    pub async fn send_to_user(&self, user_id: &str, mut message: Message) {
        message.target_user_id = Some(user_id.to_owned());
        self.submit(Scope::User(user_id.to_owned()), message).await;
    }

    /// Deliver to every connection on every node.
    pub async fn broadcast(&self, mut message: Message) {
        message.target_user_id = None;
        self.submit(Scope::All, message).await;
    }

    /// Deliver to every connection holding `role`, on every node.
    pub async fn broadcast_to_role(&self, role: Role, mut message: Message) {
        message.target_user_id = None;
        self.submit(Scope::Role(role), message).await;
    }

    /// Send to a user only if they are connected here as a driver.
    pub async fn send_to_driver(&self, user_id: &str, message: Message) -> bool {
        self.send_to_role_member(Role::Driver, user_id, message).await
    }

    /// Send to a user only if they are connected here as a rider.
    pub async fn send_to_rider(&self, user_id: &str, message: Message) -> bool {
        self.send_to_role_member(Role::Rider, user_id, message).await
    }

    async fn send_to_role_member(&self, role: Role, user_id: &str, message: Message) -> bool {
        let connected = self.directory.read().has_role_user(&role, user_id);
        if !connected {
            warn!(user_id, %role, kind = %message.kind, "user not connected in role");
            return false;
        }
        self.send_to_user(user_id, message).await;
        true
    }

    async fn submit(&self, scope: Scope, message: Message) {
        let delivery = Delivery { scope, message, publish: true };
        if self.broadcast_tx.send(delivery).await.is_err() {
            debug!("hub stopped, delivery discarded");
        }
    }

    /// Refresh the user's presence TTL (called on pong).
    pub fn refresh_presence(&self, user_id: &str) {
        self.presence_op(PresenceOp::Refresh { user_id: user_id.to_owned() });
    }

    // -- Accessors -----------------------------------------------------------

    pub fn connected_users(&self) -> usize {
        self.directory.read().by_user.len()
    }

    pub fn total_connections(&self) -> usize {
        self.directory.read().connections.len()
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.directory.read().by_user.get(user_id).map_or(0, IndexSet::len)
    }

    pub fn is_user_connected(&self, user_id: &str) -> bool {
        self.directory.read().by_user.contains_key(user_id)
    }

    pub fn connected_drivers(&self) -> usize {
        self.directory.read().role_user_count(&Role::Driver)
    }

    pub fn connected_riders(&self) -> usize {
        self.directory.read().role_user_count(&Role::Rider)
    }

    pub fn is_driver_online(&self, user_id: &str) -> bool {
        self.directory.read().has_role_user(&Role::Driver, user_id)
    }

    /// Online here, or on any node according to the presence store.
    pub async fn is_user_online(&self, user_id: &str) -> bool {
        if self.is_user_connected(user_id) {
            return true;
        }
        let Some(ref store) = self.presence else {
            return false;
        };
        match store.is_online(user_id).await {
            Ok(online) => online,
            Err(e) => {
                warn!(user_id, "presence lookup failed: {e:#}");
                false
            }
        }
    }

    /// User id to device count.
    pub fn debug_snapshot(&self) -> BTreeMap<String, usize> {
        let dir = self.directory.read();
        dir.by_user.iter().map(|(user, ids)| (user.clone(), ids.len())).collect()
    }

    /// Every open connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.directory.read().targets(&Scope::All)
    }

    pub fn stats(&self) -> HubStats {
        let dir = self.directory.read();
        HubStats {
            connected_users: dir.by_user.len(),
            total_connections: dir.connections.len(),
            connected_drivers: dir.role_user_count(&Role::Driver),
            connected_riders: dir.role_user_count(&Role::Rider),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    // -- Dispatch loop -------------------------------------------------------

    fn register_client(&self, reg: Registration) {
        let conn = reg.conn;
        let (devices, users, total) = {
            let mut dir = self.directory.write();
            let devices = dir.insert(Arc::clone(&conn));
            (devices, dir.by_user.len(), dir.connections.len())
        };
        info!(
            conn_id = %conn.id,
            user_id = %conn.user_id,
            role = %conn.role,
            devices,
            users,
            total,
            "client registered"
        );

        self.presence_op(PresenceOp::Set {
            user_id: conn.user_id.clone(),
            device: PresenceDevice {
                device_id: conn.id.clone(),
                role: conn.role.clone(),
                user_agent: conn.user_agent.clone(),
                connected_at: conn.connected_at,
            },
        });

        conn.enqueue(Message::with_json(
            MessageType::CONNECTION_ACK,
            json!({
                "userId": conn.user_id,
                "clientId": conn.id,
                "role": conn.role,
                "timestamp": chrono::Utc::now(),
            }),
        ));

        if devices == 1 {
            self.announce_presence(&conn.user_id, true);
        }
        let _ = reg.done.send(());
    }

    fn unregister_client(&self, reg: Registration) {
        let conn = reg.conn;
        let removed = self.directory.write().remove(&conn.id);
        let Some((conn, remaining)) = removed else {
            warn!(conn_id = %conn.id, user_id = %conn.user_id, "unregister for unknown connection");
            let _ = reg.done.send(());
            return;
        };
        conn.close();
        info!(
            conn_id = %conn.id,
            user_id = %conn.user_id,
            remaining,
            dropped = conn.dropped_count(),
            "client unregistered"
        );

        // Other nodes may still hold devices in the shared record; the store
        // drops the record once its last device is gone.
        self.presence_op(PresenceOp::Remove {
            user_id: conn.user_id.clone(),
            device_id: conn.id.clone(),
        });
        if remaining == 0 {
            self.announce_presence(&conn.user_id, false);
        }
        let _ = reg.done.send(());
    }

    /// Emit `user_online` / `user_offline` here and on every other node.
    fn announce_presence(&self, user_id: &str, online: bool) {
        let (kind, status) = if online {
            (MessageType::USER_ONLINE, "online")
        } else {
            (MessageType::USER_OFFLINE, "offline")
        };
        info!(user_id, status, "presence changed");
        let message = Message::with_json(kind, json!({ "userId": user_id, "status": status }));
        self.deliver(&Delivery { scope: Scope::All, message, publish: true });
    }

    fn deliver(&self, delivery: &Delivery) {
        let targets = self.directory.read().targets(&delivery.scope);
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for conn in &targets {
            match conn.enqueue(delivery.message.clone()) {
                Enqueue::Queued => delivered += 1,
                Enqueue::Full => dropped += 1,
                Enqueue::Closed => {}
            }
        }
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
        debug!(
            kind = %delivery.message.kind,
            scope = ?delivery.scope,
            targets = targets.len(),
            delivered,
            dropped,
            "delivered"
        );

        if delivery.publish {
            self.publish(&delivery.scope, &delivery.message);
        }
    }

    fn publish(&self, scope: &Scope, message: &Message) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                error!(kind = %message.kind, "failed to encode bus frame: {e}");
                return;
            }
        };
        let role = match scope {
            Scope::Role(role) => Some(role.as_str().to_owned()),
            _ => None,
        };
        let frame = BusFrame { origin: Some(self.node_id.clone()), role, payload };
        if let Err(TrySendError::Full(_)) = self.bus_tx.try_send(frame) {
            warn!(kind = %message.kind, "bus publish queue full, dropping frame");
        }
    }

    fn presence_op(&self, op: PresenceOp) {
        if self.presence.is_none() {
            return;
        }
        if let Err(TrySendError::Full(_)) = self.presence_tx.try_send(op) {
            warn!("presence queue full, dropping update");
        }
    }

    /// Close every outbound queue and cancel every connection.
    fn close_all(&self) {
        let connections: Vec<_> = {
            let mut dir = self.directory.write();
            let drained = dir.connections.drain().map(|(_, conn)| conn).collect();
            dir.by_user.clear();
            dir.by_role.clear();
            drained
        };
        info!(total = connections.len(), "closing all connections");
        for conn in connections {
            conn.close();
            conn.cancel_token().cancel();
        }
    }

    /// Feed frames from other nodes into local delivery.
    async fn receive_frames(
        self: Arc<Self>,
        mut stream: BoxStream<'static, BusFrame>,
        shutdown: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(frame) => frame,
                    None => {
                        warn!("bus subscription ended");
                        break;
                    }
                },
            };
            if frame.origin.as_deref() == Some(self.node_id.as_str()) {
                continue;
            }
            let message: Message = match serde_json::from_slice(&frame.payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("dropping undecodable bus frame: {e}");
                    continue;
                }
            };
            let scope = match frame.role {
                Some(ref role) => Scope::Role(Role::parse(role)),
                None => Scope::of(&message),
            };
            let delivery = Delivery { scope, message, publish: false };
            if self.broadcast_tx.send(delivery).await.is_err() {
                break;
            }
        }
    }
}

async fn publish_frames(
    bus: Arc<dyn Bus>,
    mut rx: mpsc::Receiver<BusFrame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = bus.publish(frame).await {
            warn!("bus publish failed: {e:#}");
        }
    }
}

async fn write_presence(
    store: Arc<dyn PresenceStore>,
    mut rx: mpsc::Receiver<PresenceOp>,
    shutdown: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = shutdown.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let result = match op {
            PresenceOp::Set { ref user_id, device } => store.set_device(user_id, device).await,
            PresenceOp::Remove { ref user_id, ref device_id } => {
                store.remove_device(user_id, device_id).await.map(|_| ())
            }
            PresenceOp::Refresh { ref user_id } => store.refresh(user_id).await,
        };
        if let Err(e) = result {
            warn!("presence write failed: {e:#}");
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
