// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure for unit and integration tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::LocalBus;
use crate::config::HubConfig;
use crate::connection::{Connection, ConnectionInit, ConnectionSettings};
use crate::handlers::HandlerTable;
use crate::hub::{Hub, HubOptions, DEFAULT_CHANNEL_CAPACITY};
use crate::manager::{Manager, Stores};
use crate::message::{Message, Role};
use crate::state::AppState;
use crate::store::memory::{MemoryStore, StoreLimits};
use crate::transport::auth::HmacAuthenticator;

/// Default wait for an expected message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection settings with short timers.
pub fn test_settings() -> ConnectionSettings {
    HubConfig::test().connection_settings()
}

/// A running hub on its own (or a shared) [`LocalBus`], with in-memory presence.
pub struct HubHarness {
    pub hub: Arc<Hub>,
    pub bus: LocalBus,
    pub store: Arc<MemoryStore>,
    pub shutdown: CancellationToken,
    pub settings: ConnectionSettings,
    handle: JoinHandle<()>,
}

impl HubHarness {
    pub fn start() -> Self {
        Self::on_bus(LocalBus::default(), "node-a")
    }

    /// Start a hub attached to `bus`; hubs sharing a bus act as separate nodes.
    pub fn on_bus(bus: LocalBus, node_id: &str) -> Self {
        let store = Arc::new(MemoryStore::new(StoreLimits::from_config(&HubConfig::test())));
        Self::on_cluster(bus, store, node_id)
    }

    /// Start a hub sharing both `bus` and the presence `store` with other nodes.
    pub fn on_cluster(bus: LocalBus, store: Arc<MemoryStore>, node_id: &str) -> Self {
        let hub = Hub::new(HubOptions {
            node_id: node_id.to_owned(),
            bus: Arc::new(bus.clone()),
            presence: Some(Arc::clone(&store) as _),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        });
        let shutdown = CancellationToken::new();
        let handle = hub.spawn(shutdown.clone());
        Self { hub, bus, store, shutdown, settings: test_settings(), handle }
    }

    /// Create a connection bound to this hub without registering it.
    pub fn connection(&self, user_id: &str, role: Role) -> TestClient {
        self.connection_with(user_id, role, None)
    }

    pub fn connection_with(
        &self,
        user_id: &str,
        role: Role,
        handlers: Option<HandlerTable>,
    ) -> TestClient {
        let (conn, rx) = Connection::new(ConnectionInit {
            user_id: user_id.to_owned(),
            role,
            user_agent: "test-agent".to_owned(),
            hub: Arc::downgrade(&self.hub),
            handlers,
            settings: self.settings,
        });
        TestClient { conn, rx }
    }

    /// Create and register a connection, then consume its `connection_ack`.
    pub async fn join(&self, user_id: &str, role: Role) -> anyhow::Result<TestClient> {
        let mut client = self.connection(user_id, role);
        anyhow::ensure!(self.hub.register(Arc::clone(&client.conn)).await, "hub not running");
        client.recv_kind("connection_ack").await?;
        Ok(client)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// The hub-side half of a connection: the connection and its outbound queue.
pub struct TestClient {
    pub conn: Arc<Connection>,
    pub rx: mpsc::Receiver<Message>,
}

impl TestClient {
    /// Next outbound message.
    pub async fn recv(&mut self) -> anyhow::Result<Message> {
        tokio::time::timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .map_err(|_| anyhow::anyhow!("recv timeout"))?
            .ok_or_else(|| anyhow::anyhow!("outbound queue closed"))
    }

    /// Skip messages until one of `kind` arrives.
    pub async fn recv_kind(&mut self, kind: &str) -> anyhow::Result<Message> {
        loop {
            let msg = self.recv().await?;
            if msg.kind == kind {
                return Ok(msg);
            }
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Wait `settle` and return every message of `kind` that arrived.
    pub async fn collect_kind(&mut self, kind: &str, settle: Duration) -> Vec<Message> {
        tokio::time::sleep(settle).await;
        self.drain().into_iter().filter(|m| m.kind == kind).collect()
    }
}

/// Manager on a private [`LocalBus`] with in-memory stores, already started.
pub fn test_manager(config: HubConfig) -> Arc<Manager> {
    let limits = StoreLimits::from_config(&config);
    let manager = Manager::new(config, Arc::new(LocalBus::default()), Stores::memory(limits));
    manager.start();
    manager
}

/// Authenticator matching [`HubConfig::test`]'s secret.
pub fn test_authenticator() -> HmacAuthenticator {
    HmacAuthenticator::new(b"test-secret")
}

/// Signed, non-expiring token for `user_id`.
pub fn token(user_id: &str, role: Role) -> anyhow::Result<String> {
    test_authenticator().issue(user_id, &role, None)
}

pub fn test_state(manager: Arc<Manager>) -> Arc<AppState> {
    Arc::new(AppState::new(manager, Arc::new(test_authenticator())))
}

/// Spawn an HTTP server on a random port for integration testing.
///
/// Returns the bound address and a join handle for the server task.
pub async fn spawn_http_server(
    state: Arc<AppState>,
) -> anyhow::Result<(std::net::SocketAddr, tokio::task::JoinHandle<()>)> {
    let router = crate::transport::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((addr, handle))
}

/// Assert that an expression returns `Err` whose message contains a substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}
